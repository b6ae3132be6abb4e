//! Media collections repository (franchises, box sets, series groupings)

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::sqlite_helpers::{from_json, now_utc, to_json};
use crate::error::Result;

#[derive(Debug, Clone, sqlx::FromRow)]
struct CollectionRow {
    id: i64,
    name: String,
    collection_type: String,
    description: Option<String>,
    total_items: i64,
    external_ids: String,
    cover_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaCollection {
    pub id: i64,
    pub name: String,
    pub collection_type: String,
    pub description: Option<String>,
    pub total_items: i64,
    /// Provider name -> external id
    pub external_ids: BTreeMap<String, String>,
    pub cover_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateCollection {
    pub name: String,
    pub collection_type: String,
    pub description: Option<String>,
    pub total_items: i64,
    pub external_ids: BTreeMap<String, String>,
    pub cover_url: Option<String>,
}

pub struct CollectionRepository {
    pool: SqlitePool,
}

impl CollectionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a collection, or refresh the one with the same name and type
    pub async fn upsert(&self, input: &CreateCollection) -> Result<i64> {
        let now = now_utc();
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO media_collections
                (name, collection_type, description, total_items, external_ids, cover_url, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name, collection_type) DO UPDATE SET
                description = COALESCE(excluded.description, media_collections.description),
                total_items = MAX(excluded.total_items, media_collections.total_items),
                external_ids = excluded.external_ids,
                cover_url = COALESCE(excluded.cover_url, media_collections.cover_url),
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(&input.name)
        .bind(&input.collection_type)
        .bind(&input.description)
        .bind(input.total_items)
        .bind(to_json(&input.external_ids)?)
        .bind(&input.cover_url)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn list(&self) -> Result<Vec<MediaCollection>> {
        let rows = sqlx::query_as::<_, CollectionRow>(
            r#"
            SELECT id, name, collection_type, description, total_items, external_ids,
                   cover_url, created_at, updated_at
            FROM media_collections
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(MediaCollection {
                    id: row.id,
                    name: row.name,
                    collection_type: row.collection_type,
                    description: row.description,
                    total_items: row.total_items,
                    external_ids: from_json(&row.external_ids)?,
                    cover_url: row.cover_url,
                    created_at: row.created_at,
                    updated_at: row.updated_at,
                })
            })
            .collect()
    }
}
