//! Embedded catalog schema.
//!
//! Tables are created with `CREATE TABLE IF NOT EXISTS`, so syncing is safe on
//! every start. Seeds run afterwards (see [seed](crate::db::seed)).

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::error::{CatalogError, Result};

pub use crate::db::seed::run_seeds;

/// Tables created by [sync_schema], in dependency order
pub const CATALOG_TABLES: &[&str] = &[
    "media_types",
    "media_items",
    "external_metadata",
    "directory_analysis",
    "media_files",
    "media_collections",
    "change_log",
    "quality_profiles",
];

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS media_types (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    detection_patterns TEXT NOT NULL DEFAULT '[]',
    metadata_providers TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS media_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    media_type_id INTEGER NOT NULL REFERENCES media_types(id),
    title TEXT NOT NULL,
    original_title TEXT,
    year INTEGER,
    description TEXT,
    genre TEXT NOT NULL DEFAULT '[]',
    director TEXT,
    cast_crew TEXT,
    rating REAL,
    runtime INTEGER,
    language TEXT,
    country TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    first_detected TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    last_updated TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS external_metadata (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    media_item_id INTEGER NOT NULL REFERENCES media_items(id) ON DELETE CASCADE,
    provider TEXT NOT NULL,
    external_id TEXT NOT NULL,
    data TEXT NOT NULL,
    rating REAL,
    review_url TEXT,
    cover_url TEXT,
    trailer_url TEXT,
    last_fetched TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(media_item_id, provider)
);

CREATE TABLE IF NOT EXISTS directory_analysis (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    directory_path TEXT NOT NULL,
    smb_root TEXT NOT NULL,
    media_item_id INTEGER REFERENCES media_items(id) ON DELETE SET NULL,
    confidence_score REAL NOT NULL,
    detection_method TEXT NOT NULL,
    analysis_data TEXT,
    last_analyzed TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    files_count INTEGER NOT NULL DEFAULT 0,
    total_size INTEGER NOT NULL DEFAULT 0,
    UNIQUE(smb_root, directory_path)
);

CREATE TABLE IF NOT EXISTS media_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    media_item_id INTEGER NOT NULL REFERENCES media_items(id) ON DELETE CASCADE,
    file_path TEXT NOT NULL,
    smb_root TEXT NOT NULL,
    filename TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    file_extension TEXT,
    quality_info TEXT,
    checksum TEXT,
    virtual_smb_link TEXT,
    direct_smb_link TEXT,
    last_verified TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(smb_root, file_path)
);

CREATE TABLE IF NOT EXISTS media_collections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    collection_type TEXT NOT NULL,
    description TEXT,
    total_items INTEGER NOT NULL DEFAULT 0,
    external_ids TEXT NOT NULL DEFAULT '{}',
    cover_url TEXT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(name, collection_type)
);

CREATE TABLE IF NOT EXISTS change_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    change_type TEXT NOT NULL,
    old_data TEXT,
    new_data TEXT,
    detected_at TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS quality_profiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    min_resolution_width INTEGER,
    min_resolution_height INTEGER,
    preferred_codecs TEXT NOT NULL DEFAULT '[]',
    min_bitrate INTEGER,
    quality_score INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_media_files_item ON media_files(media_item_id);
CREATE INDEX IF NOT EXISTS idx_media_files_root_path ON media_files(smb_root, file_path);
CREATE INDEX IF NOT EXISTS idx_media_files_checksum ON media_files(checksum);
CREATE INDEX IF NOT EXISTS idx_change_log_processed ON change_log(processed);
CREATE INDEX IF NOT EXISTS idx_change_log_detected ON change_log(detected_at);
CREATE INDEX IF NOT EXISTS idx_directory_analysis_item ON directory_analysis(media_item_id);
"#;

/// Result of a schema sync run.
#[derive(Debug, Default)]
pub struct SchemaSyncResult {
    pub tables_created: Vec<String>,
}

async fn table_exists(pool: &SqlitePool, table_name: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
    )
    .bind(table_name)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// Create every catalog table and index that does not exist yet.
///
/// A failure here means the embedded schema could not be applied, which
/// is fatal for the store.
pub async fn sync_schema(pool: &SqlitePool) -> Result<SchemaSyncResult> {
    let mut missing = Vec::new();
    for table in CATALOG_TABLES {
        if !table_exists(pool, table).await? {
            missing.push(table.to_string());
        }
    }

    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await.map_err(|e| {
        warn!(error = %e, "Embedded schema failed to apply");
        CatalogError::Config(format!("failed to apply catalog schema: {}", e))
    })?;

    if !missing.is_empty() {
        info!(tables = ?missing, "Created catalog tables");
    }

    Ok(SchemaSyncResult {
        tables_created: missing,
    })
}
