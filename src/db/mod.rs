//! Catalog Store: SQLite connection, schema and repositories
//!
//! The store is the single source of truth. All durable entities live here;
//! in-memory scheduler and watcher state can always be rebuilt by re-scanning.

pub mod change_log;
pub mod collections;
pub mod directory_analysis;
pub mod encryption;
pub mod external_metadata;
pub mod media_files;
pub mod media_items;
pub mod media_types;
pub mod schema_sync;
pub mod seed;
pub mod sqlite_helpers;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{info, warn};

use crate::error::{CatalogError, Result};

pub use change_log::{ChangeLogEntry, ChangeLogRepository, ChangeStatistics, CreateChangeLog};
pub use collections::{CollectionRepository, CreateCollection, MediaCollection};
pub use directory_analysis::{
    DirectoryAnalysis, DirectoryAnalysisRepository, UpsertDirectoryAnalysis,
};
pub use encryption::FieldCipher;
pub use external_metadata::{
    ExternalMetadata, ExternalMetadataRepository, UpsertExternalMetadata,
};
pub use media_files::{MediaFile, MediaFileRepository, UpsertMediaFile};
pub use media_items::{
    Actor, CastCrew, CreateMediaItem, ItemEnrichment, MediaItem, MediaItemRepository,
};
pub use media_types::{MediaType, MediaTypeRepository};
pub use schema_sync::{CATALOG_TABLES, sync_schema};

/// Store-level statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseStats {
    pub size_bytes: i64,
    pub table_counts: BTreeMap<String, i64>,
    pub recent_analysis_24h: i64,
}

/// Database wrapper providing connection pool access
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    cipher: FieldCipher,
}

impl Database {
    /// Create a new database wrapper from an existing pool
    pub fn new(pool: SqlitePool, cipher: FieldCipher) -> Self {
        Self { pool, cipher }
    }

    /// Get the maximum connection pool size from environment or default
    fn get_max_connections() -> u32 {
        std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8)
    }

    /// Open (creating if needed) the catalog at `url`.
    ///
    /// In-memory databases are limited to a single connection so every
    /// query sees the same database.
    pub async fn connect(url: &str, cipher: FieldCipher) -> Result<Self> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)
            .map_err(|e| CatalogError::Config(format!("invalid database url '{}': {}", url, e)))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
            if let Some(parent) = options.get_filename().parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let max_connections = if in_memory { 1 } else { Self::get_max_connections() };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        Ok(Self { pool, cipher })
    }

    /// Fresh in-memory catalog with schema and seeds applied
    pub async fn in_memory(cipher: FieldCipher) -> Result<Self> {
        let db = Self::connect("sqlite::memory:", cipher).await?;
        db.migrate().await?;
        Ok(db)
    }

    /// Apply the embedded schema and seed data. Safe to call repeatedly.
    pub async fn migrate(&self) -> Result<()> {
        sync_schema(&self.pool).await?;
        let seeds = seed::run_seeds(&self.pool).await;
        for err in &seeds.errors {
            warn!(service = "database", error = %err, "Seed error");
        }
        if !seeds.tables_seeded.is_empty() {
            info!(service = "database", tables = ?seeds.tables_seeded, "Pre-seed complete");
        }
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn cipher(&self) -> &FieldCipher {
        &self.cipher
    }

    /// Begin a transaction. Dropping it without commit rolls back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Get a media types repository
    pub fn media_types(&self) -> MediaTypeRepository {
        MediaTypeRepository::new(self.pool.clone())
    }

    /// Get a media items repository
    pub fn media_items(&self) -> MediaItemRepository {
        MediaItemRepository::new(self.pool.clone())
    }

    /// Get a media files repository
    pub fn media_files(&self) -> MediaFileRepository {
        MediaFileRepository::new(self.pool.clone())
    }

    /// Get an external metadata repository
    pub fn external_metadata(&self) -> ExternalMetadataRepository {
        ExternalMetadataRepository::new(self.pool.clone(), self.cipher.clone())
    }

    /// Get a directory analysis repository
    pub fn directory_analysis(&self) -> DirectoryAnalysisRepository {
        DirectoryAnalysisRepository::new(self.pool.clone())
    }

    /// Get a change log repository
    pub fn change_log(&self) -> ChangeLogRepository {
        ChangeLogRepository::new(self.pool.clone(), self.cipher.clone())
    }

    /// Get a media collections repository
    pub fn collections(&self) -> CollectionRepository {
        CollectionRepository::new(self.pool.clone())
    }

    /// Size, per-table row counts and recent analysis activity
    pub async fn stats(&self) -> Result<DatabaseStats> {
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;

        let mut table_counts = BTreeMap::new();
        for table in CATALOG_TABLES {
            // Table names come from a fixed list, never from input
            let query = format!("SELECT COUNT(*) FROM {}", table);
            match sqlx::query_scalar::<_, i64>(&query).fetch_one(&self.pool).await {
                Ok(count) => {
                    table_counts.insert(table.to_string(), count);
                }
                Err(e) => warn!(table = %table, error = %e, "Failed to count table"),
            }
        }

        let since: DateTime<Utc> = Utc::now() - chrono::Duration::hours(24);
        let recent_analysis_24h = self.directory_analysis().recent_count(since).await?;

        Ok(DatabaseStats {
            size_bytes: page_count * page_size,
            table_counts,
            recent_analysis_24h,
        })
    }

    /// Verify integrity and that the catalog tables are readable
    pub async fn health_check(&self) -> Result<()> {
        let result: String = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_one(&self.pool)
            .await?;
        if result != "ok" {
            return Err(CatalogError::Config(format!(
                "database integrity check failed: {}",
                result
            )));
        }
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM media_types")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn vacuum(&self) -> Result<()> {
        info!(service = "database", "Starting database vacuum");
        sqlx::query("VACUUM").execute(&self.pool).await?;
        info!(service = "database", "Database vacuum completed");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
