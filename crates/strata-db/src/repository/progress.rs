//! # Pull Checkpoint Repository
//!
//! Persists the opaque connector progress of each (snapshot, table) pull.
//!
//! ## Checkpoint Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  start()        progress = NULL, records_pulled = 0, completed_at NULL  │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  batch N ──► SINGLE TRANSACTION                                        │
//! │              ├── upsert batch records                                   │
//! │              └── progress = batch progress, records_pulled += len       │
//! │     │                                                                   │
//! │     │   crash here? the last committed progress is the resume point    │
//! │     ▼                                                                   │
//! │  complete()     completed_at = now                                      │
//! │                                                                         │
//! │  A new pull resumes when the stored checkpoint is not complete.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::DbResult;

/// Stored progress of one table's pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullCheckpoint {
    pub snapshot_id: String,
    pub table_ws_id: String,
    /// Last committed connector progress; `None` before the first batch.
    pub progress: Option<Value>,
    pub records_pulled: i64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PullCheckpoint {
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    fn from_row(row: &SqliteRow) -> DbResult<Self> {
        let progress: Option<String> = row.try_get("progress")?;
        Ok(PullCheckpoint {
            snapshot_id: row.try_get("snapshot_id")?,
            table_ws_id: row.try_get("table_ws_id")?,
            progress: progress.map(|p| serde_json::from_str(&p)).transpose()?,
            records_pulled: row.try_get("records_pulled")?,
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

/// Repository for pull checkpoints.
#[derive(Debug, Clone)]
pub struct ProgressRepository {
    pool: SqlitePool,
}

impl ProgressRepository {
    /// Creates a new ProgressRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ProgressRepository { pool }
    }

    /// Loads the checkpoint of a table, if a pull ever started.
    pub async fn load_progress(
        &self,
        snapshot_id: &str,
        table_ws_id: &str,
    ) -> DbResult<Option<PullCheckpoint>> {
        let row = sqlx::query(
            r#"
            SELECT snapshot_id, table_ws_id, progress, records_pulled,
                   started_at, updated_at, completed_at
            FROM pull_checkpoints
            WHERE snapshot_id = ?1 AND table_ws_id = ?2
            "#,
        )
        .bind(snapshot_id)
        .bind(table_ws_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(PullCheckpoint::from_row).transpose()
    }

    /// Starts a fresh pull, discarding any earlier checkpoint.
    pub async fn start_progress(&self, snapshot_id: &str, table_ws_id: &str) -> DbResult<()> {
        let now = Utc::now();
        debug!(snapshot = %snapshot_id, table = %table_ws_id, "Starting pull checkpoint");

        sqlx::query(
            r#"
            INSERT INTO pull_checkpoints (
                snapshot_id, table_ws_id, progress, records_pulled,
                started_at, updated_at, completed_at
            ) VALUES (?1, ?2, NULL, 0, ?3, ?3, NULL)
            ON CONFLICT (snapshot_id, table_ws_id) DO UPDATE SET
                progress = NULL,
                records_pulled = 0,
                started_at = excluded.started_at,
                updated_at = excluded.updated_at,
                completed_at = NULL
            "#,
        )
        .bind(snapshot_id)
        .bind(table_ws_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records progress outside a batch transaction.
    pub async fn save_progress(
        &self,
        snapshot_id: &str,
        table_ws_id: &str,
        progress: &Value,
        records_in_batch: usize,
    ) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        save_progress_in(&mut *conn, snapshot_id, table_ws_id, progress, records_in_batch).await
    }

    /// Marks the pull finished.
    pub async fn complete_progress(&self, snapshot_id: &str, table_ws_id: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE pull_checkpoints SET
                completed_at = ?3,
                updated_at = ?3
            WHERE snapshot_id = ?1 AND table_ws_id = ?2
            "#,
        )
        .bind(snapshot_id)
        .bind(table_ws_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Deletes the checkpoint; the next pull starts from the beginning.
    pub async fn clear_progress(&self, snapshot_id: &str, table_ws_id: &str) -> DbResult<bool> {
        let result = sqlx::query(
            "DELETE FROM pull_checkpoints WHERE snapshot_id = ?1 AND table_ws_id = ?2",
        )
        .bind(snapshot_id)
        .bind(table_ws_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Upserts a checkpoint on an open connection (usually a batch transaction).
pub(crate) async fn save_progress_in(
    conn: &mut SqliteConnection,
    snapshot_id: &str,
    table_ws_id: &str,
    progress: &Value,
    records_in_batch: usize,
) -> DbResult<()> {
    let now = Utc::now();
    let progress_json = serde_json::to_string(progress)?;

    sqlx::query(
        r#"
        INSERT INTO pull_checkpoints (
            snapshot_id, table_ws_id, progress, records_pulled,
            started_at, updated_at, completed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?5, NULL)
        ON CONFLICT (snapshot_id, table_ws_id) DO UPDATE SET
            progress = excluded.progress,
            records_pulled = pull_checkpoints.records_pulled + excluded.records_pulled,
            updated_at = excluded.updated_at,
            completed_at = NULL
        "#,
    )
    .bind(snapshot_id)
    .bind(table_ws_id)
    .bind(progress_json)
    .bind(records_in_batch as i64)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::posts_table;
    use serde_json::json;

    #[tokio::test]
    async fn test_checkpoint_lifecycle() {
        let (db, table) = posts_table().await;
        let progress = db.progress();
        let (snap, t) = (table.snapshot_id.as_str(), table.table_ws_id());

        assert!(progress.load_progress(snap, t).await.unwrap().is_none());

        progress.start_progress(snap, t).await.unwrap();
        progress.save_progress(snap, t, &json!({ "offset": 100 }), 100).await.unwrap();
        progress.save_progress(snap, t, &json!({ "offset": 200 }), 100).await.unwrap();

        let checkpoint = progress.load_progress(snap, t).await.unwrap().unwrap();
        assert_eq!(checkpoint.progress, Some(json!({ "offset": 200 })));
        assert_eq!(checkpoint.records_pulled, 200);
        assert!(!checkpoint.is_complete());

        progress.complete_progress(snap, t).await.unwrap();
        assert!(progress.load_progress(snap, t).await.unwrap().unwrap().is_complete());

        progress.start_progress(snap, t).await.unwrap();
        let restarted = progress.load_progress(snap, t).await.unwrap().unwrap();
        assert_eq!(restarted.records_pulled, 0);
        assert!(restarted.progress.is_none());

        assert!(progress.clear_progress(snap, t).await.unwrap());
        assert!(progress.load_progress(snap, t).await.unwrap().is_none());
    }
}
