//! Media type catalog repository

use sqlx::SqlitePool;

use crate::db::sqlite_helpers::json_to_vec;
use crate::error::Result;

#[derive(Debug, Clone, sqlx::FromRow)]
struct MediaTypeRow {
    id: i64,
    name: String,
    description: Option<String>,
    detection_patterns: String,
    metadata_providers: String,
}

/// A domain of media (movie, tv_show, music, ...)
#[derive(Debug, Clone, PartialEq)]
pub struct MediaType {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub detection_patterns: Vec<String>,
    pub metadata_providers: Vec<String>,
}

impl From<MediaTypeRow> for MediaType {
    fn from(row: MediaTypeRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            detection_patterns: json_to_vec(&row.detection_patterns),
            metadata_providers: json_to_vec(&row.metadata_providers),
        }
    }
}

pub struct MediaTypeRepository {
    pool: SqlitePool,
}

impl MediaTypeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// All media types in seed order
    pub async fn all(&self) -> Result<Vec<MediaType>> {
        let rows = sqlx::query_as::<_, MediaTypeRow>(
            r#"
            SELECT id, name, description, detection_patterns, metadata_providers
            FROM media_types
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(MediaType::from).collect())
    }

    pub async fn by_name(&self, name: &str) -> Result<Option<MediaType>> {
        let row = sqlx::query_as::<_, MediaTypeRow>(
            r#"
            SELECT id, name, description, detection_patterns, metadata_providers
            FROM media_types
            WHERE name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(MediaType::from))
    }

    pub async fn by_id(&self, id: i64) -> Result<Option<MediaType>> {
        let row = sqlx::query_as::<_, MediaTypeRow>(
            r#"
            SELECT id, name, description, detection_patterns, metadata_providers
            FROM media_types
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(MediaType::from))
    }
}
