//! External metadata repository
//!
//! One row per (media item, provider). The raw provider payload in `data` is
//! sealed with the store's [FieldCipher].

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use crate::db::FieldCipher;
use crate::db::sqlite_helpers::now_utc;
use crate::error::Result;

#[derive(Debug, Clone, sqlx::FromRow)]
struct ExternalMetadataRow {
    id: i64,
    media_item_id: i64,
    provider: String,
    external_id: String,
    data: String,
    rating: Option<f64>,
    review_url: Option<String>,
    cover_url: Option<String>,
    trailer_url: Option<String>,
    last_fetched: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalMetadata {
    pub id: i64,
    pub media_item_id: i64,
    pub provider: String,
    pub external_id: String,
    /// Decrypted provider payload (JSON)
    pub data: String,
    pub rating: Option<f64>,
    pub review_url: Option<String>,
    pub cover_url: Option<String>,
    pub trailer_url: Option<String>,
    pub last_fetched: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UpsertExternalMetadata {
    pub media_item_id: i64,
    pub provider: String,
    pub external_id: String,
    pub data: String,
    pub rating: Option<f64>,
    pub review_url: Option<String>,
    pub cover_url: Option<String>,
    pub trailer_url: Option<String>,
}

pub(crate) async fn upsert_metadata(
    conn: &mut SqliteConnection,
    cipher: &FieldCipher,
    input: &UpsertExternalMetadata,
) -> Result<i64> {
    let sealed = cipher.seal(&input.data)?;
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO external_metadata
            (media_item_id, provider, external_id, data, rating, review_url, cover_url, trailer_url, last_fetched)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(media_item_id, provider) DO UPDATE SET
            external_id = excluded.external_id,
            data = excluded.data,
            rating = excluded.rating,
            review_url = excluded.review_url,
            cover_url = excluded.cover_url,
            trailer_url = excluded.trailer_url,
            last_fetched = excluded.last_fetched
        RETURNING id
        "#,
    )
    .bind(input.media_item_id)
    .bind(&input.provider)
    .bind(&input.external_id)
    .bind(sealed)
    .bind(input.rating)
    .bind(&input.review_url)
    .bind(&input.cover_url)
    .bind(&input.trailer_url)
    .bind(now_utc())
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

pub struct ExternalMetadataRepository {
    pool: SqlitePool,
    cipher: FieldCipher,
}

impl ExternalMetadataRepository {
    pub fn new(pool: SqlitePool, cipher: FieldCipher) -> Self {
        Self { pool, cipher }
    }

    pub async fn upsert(&self, input: &UpsertExternalMetadata) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        upsert_metadata(&mut conn, &self.cipher, input).await
    }

    pub async fn list_for_item(&self, media_item_id: i64) -> Result<Vec<ExternalMetadata>> {
        let rows = sqlx::query_as::<_, ExternalMetadataRow>(
            r#"
            SELECT id, media_item_id, provider, external_id, data, rating,
                   review_url, cover_url, trailer_url, last_fetched
            FROM external_metadata
            WHERE media_item_id = ?
            ORDER BY provider
            "#,
        )
        .bind(media_item_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ExternalMetadata {
                    id: row.id,
                    media_item_id: row.media_item_id,
                    provider: row.provider,
                    external_id: row.external_id,
                    data: self.cipher.open(&row.data)?,
                    rating: row.rating,
                    review_url: row.review_url,
                    cover_url: row.cover_url,
                    trailer_url: row.trailer_url,
                    last_fetched: row.last_fetched,
                })
            })
            .collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM external_metadata")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Number of items covered by each provider
    pub async fn coverage_by_provider(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT provider, COUNT(DISTINCT media_item_id)
            FROM external_metadata
            GROUP BY provider
            ORDER BY provider
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
