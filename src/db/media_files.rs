//! Media files database repository

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use crate::db::sqlite_helpers::{from_json_opt, now_utc, to_json_opt};
use crate::error::Result;
use crate::services::quality::QualityInfo;

#[derive(Debug, Clone, sqlx::FromRow)]
struct MediaFileRow {
    id: i64,
    media_item_id: i64,
    file_path: String,
    smb_root: String,
    filename: String,
    file_size: i64,
    file_extension: Option<String>,
    quality_info: Option<String>,
    checksum: Option<String>,
    virtual_smb_link: Option<String>,
    direct_smb_link: Option<String>,
    last_verified: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

/// One physical version of a media item on a share
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFile {
    pub id: i64,
    pub media_item_id: i64,
    /// Path relative to the share root, with a leading `/`
    pub file_path: String,
    pub smb_root: String,
    pub filename: String,
    pub file_size: i64,
    pub file_extension: Option<String>,
    pub quality_info: Option<QualityInfo>,
    /// Hex SHA-256 of the file contents
    pub checksum: Option<String>,
    pub virtual_smb_link: Option<String>,
    pub direct_smb_link: Option<String>,
    pub last_verified: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<MediaFileRow> for MediaFile {
    type Error = crate::error::CatalogError;

    fn try_from(row: MediaFileRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            media_item_id: row.media_item_id,
            file_path: row.file_path,
            smb_root: row.smb_root,
            filename: row.filename,
            file_size: row.file_size,
            file_extension: row.file_extension,
            quality_info: from_json_opt(row.quality_info.as_deref())?,
            checksum: row.checksum,
            virtual_smb_link: row.virtual_smb_link,
            direct_smb_link: row.direct_smb_link,
            last_verified: row.last_verified,
            created_at: row.created_at,
        })
    }
}

/// Input for inserting or refreshing a media file
#[derive(Debug, Clone)]
pub struct UpsertMediaFile {
    pub media_item_id: i64,
    pub file_path: String,
    pub smb_root: String,
    pub filename: String,
    pub file_size: i64,
    pub file_extension: Option<String>,
    pub quality_info: Option<QualityInfo>,
    /// `None` keeps the stored checksum
    pub checksum: Option<String>,
}

const SELECT_FILE: &str = r#"
    SELECT id, media_item_id, file_path, smb_root, filename, file_size, file_extension,
           quality_info, checksum, virtual_smb_link, direct_smb_link, last_verified, created_at
    FROM media_files
"#;

pub fn direct_link(smb_root: &str, file_path: &str) -> String {
    format!("smb://{}/{}", smb_root, file_path.trim_start_matches('/'))
}

pub(crate) async fn upsert_file(conn: &mut SqliteConnection, input: &UpsertMediaFile) -> Result<i64> {
    let now = now_utc();
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO media_files
            (media_item_id, file_path, smb_root, filename, file_size, file_extension,
             quality_info, checksum, direct_smb_link, last_verified, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(smb_root, file_path) DO UPDATE SET
            media_item_id = excluded.media_item_id,
            filename = excluded.filename,
            file_size = excluded.file_size,
            file_extension = excluded.file_extension,
            quality_info = excluded.quality_info,
            checksum = COALESCE(excluded.checksum, media_files.checksum),
            direct_smb_link = excluded.direct_smb_link,
            last_verified = excluded.last_verified
        RETURNING id
        "#,
    )
    .bind(input.media_item_id)
    .bind(&input.file_path)
    .bind(&input.smb_root)
    .bind(&input.filename)
    .bind(input.file_size)
    .bind(&input.file_extension)
    .bind(to_json_opt(input.quality_info.as_ref())?)
    .bind(&input.checksum)
    .bind(direct_link(&input.smb_root, &input.file_path))
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query(
        "UPDATE media_files SET virtual_smb_link = 'virtual://' || smb_root || '/' || id WHERE id = ?",
    )
    .bind(id)
    .execute(&mut *conn)
    .await?;

    Ok(id)
}

pub(crate) async fn fetch_by_path(
    conn: &mut SqliteConnection,
    smb_root: &str,
    file_path: &str,
) -> Result<Option<MediaFile>> {
    let row = sqlx::query_as::<_, MediaFileRow>(&format!(
        "{} WHERE smb_root = ? AND file_path = ?",
        SELECT_FILE
    ))
    .bind(smb_root)
    .bind(file_path)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(MediaFile::try_from).transpose()
}

pub struct MediaFileRepository {
    pool: SqlitePool,
}

impl MediaFileRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, input: &UpsertMediaFile) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        upsert_file(&mut conn, input).await
    }

    pub async fn find_by_path(&self, smb_root: &str, file_path: &str) -> Result<Option<MediaFile>> {
        let mut conn = self.pool.acquire().await?;
        fetch_by_path(&mut conn, smb_root, file_path).await
    }

    pub async fn list_by_item(&self, media_item_id: i64) -> Result<Vec<MediaFile>> {
        let rows = sqlx::query_as::<_, MediaFileRow>(&format!(
            "{} WHERE media_item_id = ? ORDER BY file_path",
            SELECT_FILE
        ))
        .bind(media_item_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MediaFile::try_from).collect()
    }

    /// Files directly inside `directory` (not in subdirectories)
    pub async fn list_in_directory(&self, smb_root: &str, directory: &str) -> Result<Vec<MediaFile>> {
        let prefix = format!("{}/", directory.trim_end_matches('/'));
        let rows = sqlx::query_as::<_, MediaFileRow>(&format!(
            "{} WHERE smb_root = ? AND substr(file_path, 1, length(?)) = ? \
             AND instr(substr(file_path, length(?) + 1), '/') = 0 ORDER BY file_path",
            SELECT_FILE
        ))
        .bind(smb_root)
        .bind(&prefix)
        .bind(&prefix)
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MediaFile::try_from).collect()
    }

    pub async fn count_by_item(&self, media_item_id: i64) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM media_files WHERE media_item_id = ?",
        )
        .bind(media_item_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Mark a file as seen now. Returns false when the file is unknown.
    pub async fn touch_verified(&self, smb_root: &str, file_path: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE media_files SET last_verified = ? WHERE smb_root = ? AND file_path = ?",
        )
        .bind(now_utc())
        .bind(smb_root)
        .bind(file_path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn clear_virtual_link(&self, smb_root: &str, file_path: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE media_files SET virtual_smb_link = NULL, last_verified = ?
            WHERE smb_root = ? AND file_path = ?
            "#,
        )
        .bind(now_utc())
        .bind(smb_root)
        .bind(file_path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_checksum(&self, id: i64, checksum: Option<&str>, file_size: i64) -> Result<()> {
        sqlx::query(
            "UPDATE media_files SET checksum = ?, file_size = ?, last_verified = ? WHERE id = ?",
        )
        .bind(checksum)
        .bind(file_size)
        .bind(now_utc())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move a known file to a new path on the same share. Returns false when
    /// no file existed at `from`.
    pub async fn rename(&self, smb_root: &str, from: &str, to: &str) -> Result<bool> {
        let filename = to.rsplit('/').next().unwrap_or(to).to_string();
        let result = sqlx::query(
            r#"
            UPDATE media_files
            SET file_path = ?, filename = ?, direct_smb_link = ?, last_verified = ?
            WHERE smb_root = ? AND file_path = ?
            "#,
        )
        .bind(to)
        .bind(filename)
        .bind(direct_link(smb_root, to))
        .bind(now_utc())
        .bind(smb_root)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Files on `smb_root` sharing a checksum with at least one other
    /// non-empty file, ordered by checksum then path.
    pub async fn duplicate_candidates(&self, smb_root: &str) -> Result<Vec<MediaFile>> {
        let rows = sqlx::query_as::<_, MediaFileRow>(&format!(
            r#"{} WHERE smb_root = ? AND file_size > 0 AND checksum IN (
                   SELECT checksum FROM media_files
                   WHERE smb_root = ? AND file_size > 0 AND checksum IS NOT NULL
                   GROUP BY checksum HAVING COUNT(*) > 1
               )
               ORDER BY checksum, file_path"#,
            SELECT_FILE
        ))
        .bind(smb_root)
        .bind(smb_root)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MediaFile::try_from).collect()
    }
}
