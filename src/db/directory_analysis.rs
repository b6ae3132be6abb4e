//! Directory analysis repository
//!
//! One row per analyzed directory. This is the scheduling unit of the
//! analysis pipeline.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use crate::db::sqlite_helpers::{from_json_opt, now_utc, to_json_opt};
use crate::error::Result;
use crate::services::classifier::AnalysisData;

#[derive(Debug, Clone, sqlx::FromRow)]
struct DirectoryAnalysisRow {
    id: i64,
    directory_path: String,
    smb_root: String,
    media_item_id: Option<i64>,
    confidence_score: f64,
    detection_method: String,
    analysis_data: Option<String>,
    last_analyzed: DateTime<Utc>,
    files_count: i64,
    total_size: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryAnalysis {
    pub id: i64,
    pub directory_path: String,
    pub smb_root: String,
    /// Unset until the directory has been classified
    pub media_item_id: Option<i64>,
    pub confidence_score: f64,
    pub detection_method: String,
    pub analysis_data: Option<AnalysisData>,
    pub last_analyzed: DateTime<Utc>,
    pub files_count: i64,
    pub total_size: i64,
}

impl TryFrom<DirectoryAnalysisRow> for DirectoryAnalysis {
    type Error = crate::error::CatalogError;

    fn try_from(row: DirectoryAnalysisRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            directory_path: row.directory_path,
            smb_root: row.smb_root,
            media_item_id: row.media_item_id,
            confidence_score: row.confidence_score,
            detection_method: row.detection_method,
            analysis_data: from_json_opt(row.analysis_data.as_deref())?,
            last_analyzed: row.last_analyzed,
            files_count: row.files_count,
            total_size: row.total_size,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UpsertDirectoryAnalysis {
    pub directory_path: String,
    pub smb_root: String,
    pub media_item_id: Option<i64>,
    pub confidence_score: f64,
    pub detection_method: String,
    pub analysis_data: Option<AnalysisData>,
    pub files_count: i64,
    pub total_size: i64,
}

const SELECT_ANALYSIS: &str = r#"
    SELECT id, directory_path, smb_root, media_item_id, confidence_score, detection_method,
           analysis_data, last_analyzed, files_count, total_size
    FROM directory_analysis
"#;

/// Insert or refresh the analysis row. An existing item link is kept when
/// `media_item_id` is `None`.
pub(crate) async fn upsert_analysis(
    conn: &mut SqliteConnection,
    input: &UpsertDirectoryAnalysis,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO directory_analysis
            (directory_path, smb_root, media_item_id, confidence_score, detection_method,
             analysis_data, last_analyzed, files_count, total_size)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(smb_root, directory_path) DO UPDATE SET
            media_item_id = COALESCE(excluded.media_item_id, directory_analysis.media_item_id),
            confidence_score = excluded.confidence_score,
            detection_method = excluded.detection_method,
            analysis_data = excluded.analysis_data,
            last_analyzed = excluded.last_analyzed,
            files_count = excluded.files_count,
            total_size = excluded.total_size
        RETURNING id
        "#,
    )
    .bind(&input.directory_path)
    .bind(&input.smb_root)
    .bind(input.media_item_id)
    .bind(input.confidence_score)
    .bind(&input.detection_method)
    .bind(to_json_opt(input.analysis_data.as_ref())?)
    .bind(now_utc())
    .bind(input.files_count)
    .bind(input.total_size)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

pub(crate) async fn fetch_analysis(
    conn: &mut SqliteConnection,
    smb_root: &str,
    directory_path: &str,
) -> Result<Option<DirectoryAnalysis>> {
    let row = sqlx::query_as::<_, DirectoryAnalysisRow>(&format!(
        "{} WHERE smb_root = ? AND directory_path = ?",
        SELECT_ANALYSIS
    ))
    .bind(smb_root)
    .bind(directory_path)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(DirectoryAnalysis::try_from).transpose()
}

pub(crate) async fn link_analysis_item(
    conn: &mut SqliteConnection,
    smb_root: &str,
    directory_path: &str,
    media_item_id: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE directory_analysis SET media_item_id = ? WHERE smb_root = ? AND directory_path = ?",
    )
    .bind(media_item_id)
    .bind(smb_root)
    .bind(directory_path)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub struct DirectoryAnalysisRepository {
    pool: SqlitePool,
}

impl DirectoryAnalysisRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, input: &UpsertDirectoryAnalysis) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        upsert_analysis(&mut conn, input).await
    }

    pub async fn get(&self, smb_root: &str, directory_path: &str) -> Result<Option<DirectoryAnalysis>> {
        let mut conn = self.pool.acquire().await?;
        fetch_analysis(&mut conn, smb_root, directory_path).await
    }

    pub async fn link_item(&self, smb_root: &str, directory_path: &str, media_item_id: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        link_analysis_item(&mut conn, smb_root, directory_path, media_item_id).await
    }

    /// All analyzed directories as (path, share root)
    pub async fn all_directories(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT directory_path, smb_root FROM directory_analysis ORDER BY smb_root, directory_path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn recent_count(&self, since: DateTime<Utc>) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM directory_analysis WHERE last_analyzed > ?",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
