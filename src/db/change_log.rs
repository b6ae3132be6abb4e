//! Change log repository
//!
//! Append-only audit trail of filesystem changes. Snapshots are sealed with
//! the store's [FieldCipher]. Rows are only ever flagged processed, never
//! deleted, so unprocessed rows can be replayed after a crash.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db::FieldCipher;
use crate::error::Result;

#[derive(Debug, Clone, sqlx::FromRow)]
struct ChangeLogRow {
    id: i64,
    entity_type: String,
    entity_id: String,
    change_type: String,
    old_data: Option<String>,
    new_data: Option<String>,
    detected_at: DateTime<Utc>,
    processed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub change_type: String,
    /// Decrypted before-snapshot (JSON)
    pub old_data: Option<String>,
    /// Decrypted after-snapshot (JSON)
    pub new_data: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub processed: bool,
}

#[derive(Debug, Clone)]
pub struct CreateChangeLog {
    pub entity_type: String,
    pub entity_id: String,
    pub change_type: String,
    pub old_data: Option<String>,
    pub new_data: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Aggregate view of the change log since a point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeStatistics {
    pub changes_by_type: BTreeMap<String, i64>,
    pub total_changes: i64,
    /// Unprocessed rows across the whole log, not just the window
    pub unprocessed_changes: i64,
}

pub struct ChangeLogRepository {
    pool: SqlitePool,
    cipher: FieldCipher,
}

impl ChangeLogRepository {
    pub fn new(pool: SqlitePool, cipher: FieldCipher) -> Self {
        Self { pool, cipher }
    }

    fn decode(&self, row: ChangeLogRow) -> Result<ChangeLogEntry> {
        Ok(ChangeLogEntry {
            id: row.id,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            change_type: row.change_type,
            old_data: self.cipher.open_opt(row.old_data.as_deref())?,
            new_data: self.cipher.open_opt(row.new_data.as_deref())?,
            detected_at: row.detected_at,
            processed: row.processed,
        })
    }

    /// Append an entry and return its id
    pub async fn append(&self, entry: &CreateChangeLog) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO change_log (entity_type, entity_id, change_type, old_data, new_data, detected_at, processed)
            VALUES (?, ?, ?, ?, ?, ?, 0)
            RETURNING id
            "#,
        )
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.change_type)
        .bind(self.cipher.seal_opt(entry.old_data.as_deref())?)
        .bind(self.cipher.seal_opt(entry.new_data.as_deref())?)
        .bind(entry.detected_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<ChangeLogEntry>> {
        let row = sqlx::query_as::<_, ChangeLogRow>(
            r#"
            SELECT id, entity_type, entity_id, change_type, old_data, new_data, detected_at, processed
            FROM change_log
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| self.decode(r)).transpose()
    }

    /// Oldest unprocessed entries first
    pub async fn unprocessed(&self, limit: i64) -> Result<Vec<ChangeLogEntry>> {
        let rows = sqlx::query_as::<_, ChangeLogRow>(
            r#"
            SELECT id, entity_type, entity_id, change_type, old_data, new_data, detected_at, processed
            FROM change_log
            WHERE processed = 0
            ORDER BY detected_at, id
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|r| self.decode(r)).collect()
    }

    pub async fn mark_processed(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE change_log SET processed = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn statistics(&self, since: DateTime<Utc>) -> Result<ChangeStatistics> {
        let by_type = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT change_type, COUNT(*)
            FROM change_log
            WHERE detected_at >= ?
            GROUP BY change_type
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let unprocessed_changes =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM change_log WHERE processed = 0")
                .fetch_one(&self.pool)
                .await?;

        let changes_by_type: BTreeMap<String, i64> = by_type.into_iter().collect();
        let total_changes = changes_by_type.values().sum();

        Ok(ChangeStatistics {
            changes_by_type,
            total_changes,
            unprocessed_changes,
        })
    }
}
