//! Media items database repository

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};

use crate::db::sqlite_helpers::{from_json_opt, json_to_vec, now_utc, to_json_opt, vec_to_json};
use crate::error::Result;

/// Status values for `media_items.status`
pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_MISSING: &str = "missing";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
    #[serde(default)]
    pub character: Option<String>,
    #[serde(default)]
    pub order: i32,
}

/// People attached to a media item, stored as JSON in `media_items.cast_crew`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CastCrew {
    pub director: Option<String>,
    pub writers: Vec<String>,
    pub actors: Vec<Actor>,
    pub producers: Vec<String>,
    pub musicians: Vec<String>,
    pub developers: Vec<String>,
}

impl CastCrew {
    pub fn is_empty(&self) -> bool {
        self == &CastCrew::default()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct MediaItemRow {
    id: i64,
    media_type_id: i64,
    media_type_name: Option<String>,
    title: String,
    original_title: Option<String>,
    year: Option<i64>,
    description: Option<String>,
    genre: String,
    director: Option<String>,
    cast_crew: Option<String>,
    rating: Option<f64>,
    runtime: Option<i64>,
    language: Option<String>,
    country: Option<String>,
    status: String,
    first_detected: DateTime<Utc>,
    last_updated: DateTime<Utc>,
}

/// A logical title in the catalog, owning one or more files
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItem {
    pub id: i64,
    pub media_type_id: i64,
    /// Resolved from `media_types`; `None` when the type row is gone
    pub media_type: Option<String>,
    pub title: String,
    pub original_title: Option<String>,
    pub year: Option<i32>,
    pub description: Option<String>,
    pub genres: Vec<String>,
    pub director: Option<String>,
    pub cast_crew: Option<CastCrew>,
    pub rating: Option<f64>,
    pub runtime: Option<i32>,
    pub language: Option<String>,
    pub country: Option<String>,
    pub status: String,
    pub first_detected: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl TryFrom<MediaItemRow> for MediaItem {
    type Error = crate::error::CatalogError;

    fn try_from(row: MediaItemRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            media_type_id: row.media_type_id,
            media_type: row.media_type_name,
            title: row.title,
            original_title: row.original_title,
            year: row.year.map(|y| y as i32),
            description: row.description,
            genres: json_to_vec(&row.genre),
            director: row.director,
            cast_crew: from_json_opt(row.cast_crew.as_deref())?,
            rating: row.rating,
            runtime: row.runtime.map(|r| r as i32),
            language: row.language,
            country: row.country,
            status: row.status,
            first_detected: row.first_detected,
            last_updated: row.last_updated,
        })
    }
}

/// Input for creating a media item from a directory detection
#[derive(Debug, Clone)]
pub struct CreateMediaItem {
    pub media_type_id: i64,
    pub title: String,
    pub year: Option<i32>,
}

/// Provider-derived fields merged into an item after a match
#[derive(Debug, Clone, Default)]
pub struct ItemEnrichment {
    pub original_title: Option<String>,
    pub description: Option<String>,
    pub genres: Vec<String>,
    pub cast_crew: Option<CastCrew>,
    pub rating: Option<f64>,
}

const SELECT_ITEM: &str = r#"
    SELECT mi.id, mi.media_type_id, mt.name AS media_type_name, mi.title, mi.original_title,
           mi.year, mi.description, mi.genre, mi.director, mi.cast_crew, mi.rating, mi.runtime,
           mi.language, mi.country, mi.status, mi.first_detected, mi.last_updated
    FROM media_items mi
    LEFT JOIN media_types mt ON mt.id = mi.media_type_id
"#;

pub(crate) async fn insert_item(conn: &mut SqliteConnection, input: &CreateMediaItem) -> Result<i64> {
    let now = now_utc();
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO media_items (media_type_id, title, year, genre, cast_crew, status, first_detected, last_updated)
        VALUES (?, ?, ?, '[]', NULL, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(input.media_type_id)
    .bind(&input.title)
    .bind(input.year)
    .bind(STATUS_ACTIVE)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

/// Re-classification of an existing item. Reactivates items previously marked missing.
pub(crate) async fn update_detection(
    conn: &mut SqliteConnection,
    id: i64,
    input: &CreateMediaItem,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE media_items
        SET media_type_id = ?, title = ?, year = COALESCE(?, year), status = ?, last_updated = ?
        WHERE id = ?
        "#,
    )
    .bind(input.media_type_id)
    .bind(&input.title)
    .bind(input.year)
    .bind(STATUS_ACTIVE)
    .bind(now_utc())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn apply_enrichment(
    conn: &mut SqliteConnection,
    id: i64,
    enrichment: &ItemEnrichment,
) -> Result<()> {
    let director = enrichment
        .cast_crew
        .as_ref()
        .and_then(|c| c.director.clone());
    let genres = if enrichment.genres.is_empty() {
        None
    } else {
        Some(vec_to_json(&enrichment.genres))
    };

    sqlx::query(
        r#"
        UPDATE media_items
        SET original_title = COALESCE(?, original_title),
            description = COALESCE(?, description),
            genre = COALESCE(?, genre),
            director = COALESCE(?, director),
            cast_crew = COALESCE(?, cast_crew),
            rating = COALESCE(?, rating),
            last_updated = ?
        WHERE id = ?
        "#,
    )
    .bind(&enrichment.original_title)
    .bind(&enrichment.description)
    .bind(genres)
    .bind(director)
    .bind(to_json_opt(enrichment.cast_crew.as_ref())?)
    .bind(enrichment.rating)
    .bind(now_utc())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn fetch_item(conn: &mut SqliteConnection, id: i64) -> Result<Option<MediaItem>> {
    let row = sqlx::query_as::<_, MediaItemRow>(&format!("{} WHERE mi.id = ?", SELECT_ITEM))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(MediaItem::try_from).transpose()
}

pub struct MediaItemRepository {
    pool: SqlitePool,
}

impl MediaItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: &CreateMediaItem) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        insert_item(&mut conn, input).await
    }

    pub async fn get(&self, id: i64) -> Result<Option<MediaItem>> {
        let mut conn = self.pool.acquire().await?;
        fetch_item(&mut conn, id).await
    }

    pub async fn update_from_detection(&self, id: i64, input: &CreateMediaItem) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        update_detection(&mut conn, id, input).await
    }

    pub async fn enrich(&self, id: i64, enrichment: &ItemEnrichment) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        apply_enrichment(&mut conn, id, enrichment).await
    }

    pub async fn set_status(&self, id: i64, status: &str) -> Result<()> {
        sqlx::query("UPDATE media_items SET status = ?, last_updated = ? WHERE id = ?")
            .bind(status)
            .bind(now_utc())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Items per media type name, for the distribution statistics
    pub async fn by_type_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT mt.name, COUNT(mi.id)
            FROM media_types mt
            LEFT JOIN media_items mi ON mi.media_type_id = mt.id
            GROUP BY mt.id, mt.name
            ORDER BY mt.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Items whose metadata has not been fetched since `before`, or never
    pub async fn needing_refresh(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT mi.id
            FROM media_items mi
            LEFT JOIN external_metadata em ON em.media_item_id = mi.id
            WHERE mi.status = 'active'
            GROUP BY mi.id
            HAVING MAX(em.last_fetched) IS NULL OR MAX(em.last_fetched) < ?
            ORDER BY mi.id
            LIMIT ?
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cast_crew_round_trip() {
        let crew = CastCrew {
            director: Some("Michael Mann".into()),
            writers: vec!["Michael Mann".into()],
            actors: vec![
                Actor {
                    name: "Al Pacino".into(),
                    character: Some("Vincent Hanna".into()),
                    order: 0,
                },
                Actor {
                    name: "Robert De Niro".into(),
                    character: None,
                    order: 1,
                },
            ],
            producers: vec!["Art Linson".into()],
            musicians: vec![],
            developers: vec![],
        };

        let json = serde_json::to_string(&crew).unwrap();
        let back: CastCrew = serde_json::from_str(&json).unwrap();
        assert_eq!(back, crew);
    }

    #[test]
    fn test_cast_crew_tolerates_missing_fields() {
        let crew: CastCrew = serde_json::from_str(r#"{"director":"X"}"#).unwrap();
        assert_eq!(crew.director.as_deref(), Some("X"));
        assert!(crew.actors.is_empty());
        assert!(!crew.is_empty());
        assert!(CastCrew::default().is_empty());
    }
}
