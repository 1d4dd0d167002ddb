//! # Record Repository
//!
//! Reads and mutates the rows of snapshot tables.
//!
//! ## Who Writes What
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  pull   upsert_pull_batch ──► synced columns + __metadata               │
//! │                               (wsId, edits and suggestions untouched)   │
//! │                                                                         │
//! │  user   apply_edit(Accepted) ──► fields + __edited_fields + __dirty     │
//! │  agent  apply_edit(Suggested) ─► __suggested_values only                │
//! │  user   accept / reject ───────► move or discard suggestions            │
//! │                                                                         │
//! │  push   claim_dirty_batch ─────► __push_claim (compare-and-swap)        │
//! │         complete_batch ────────► remote id, clean edits, release        │
//! │         release_claims ────────► give back failed / skipped rows        │
//! │                                                                         │
//! │  Every multi-row mutation runs in a single transaction.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Push Claims
//! ```text
//!   claim:      UPDATE … SET __push_claim = :token
//!               WHERE wsId IN (dirty rows for the operation
//!                              whose claim is NULL or older than the lease
//!                              ORDER BY id LIMIT :batch)
//!   connector:  called with no transaction open
//!   write-back: only rows still holding :token; field edits made after the
//!               claim keep the row dirty
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use strata_core::ids::{generate_record_ws_id, is_valid_slug};
use strata_core::validation::validate_edit_fields;
use strata_core::{
    ConnectorRecord, CoreError, EditOp, EditOutcome, EditTier, EditedFields, FieldMap, FieldRef,
    PushOperation, RecordId, SnapshotRecord, SuggestedValues, CREATED_MARKER, DELETED_MARKER,
    DEFAULT_LIST_LIMIT,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::filter::{push_filter, Filter};
use super::progress::save_progress_in;
use super::{
    push_sql_value, quote_ident, record_from_row, select_columns, to_sql_value, SnapshotTable,
    COL_DIRTY, COL_EDITED_FIELDS, COL_ID, COL_METADATA, COL_SUGGESTED_VALUES, COL_WS_ID,
};
use crate::error::{DbError, DbResult};

/// Largest page `list_records` returns.
pub const MAX_LIST_LIMIT: u32 = 1000;

// =============================================================================
// Types
// =============================================================================

/// Parameters of a `list_records` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    /// wsId of the last record of the previous page.
    pub cursor: Option<String>,
    /// Page size; 0 means the default.
    pub limit: u32,
    pub filter: Option<Filter>,
}

/// One page of records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPage {
    pub records: Vec<SnapshotRecord>,
    pub total_count: i64,
    pub filtered_count: i64,
    pub next_cursor: Option<String>,
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    /// Existing rows with unpushed edits whose synced values were replaced.
    pub dirty_overwritten: usize,
}

/// Dirty rows per push path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirtyCounts {
    pub create: i64,
    pub update: i64,
    pub delete: i64,
}

impl DirtyCounts {
    pub fn total(&self) -> i64 {
        self.create + self.update + self.delete
    }

    pub fn for_operation(&self, operation: PushOperation) -> i64 {
        match operation {
            PushOperation::Create => self.create,
            PushOperation::Update => self.update,
            PushOperation::Delete => self.delete,
        }
    }
}

/// A row claimed for a push batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedRecord {
    pub record: SnapshotRecord,
    /// `__edited_fields` exactly as stored when the claim was taken.
    edited_at_claim: EditedFields,
}

impl ClaimedRecord {
    pub fn ws_id(&self) -> &str {
        &self.record.id.ws_id
    }
}

/// What the push callback reports for one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// wsId → new remote id, for create batches.
    pub created_ids: HashMap<String, String>,
    /// Records that were not sent (they stay dirty).
    pub skipped: HashSet<String>,
}

/// Result of writing one pushed batch back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBack {
    /// Rows now clean (or removed, for deletes).
    pub cleaned: usize,
    /// Rows that received new edits while the batch was in flight.
    pub still_dirty: usize,
    /// Rows whose claim was taken over (lease expired) before write-back.
    pub lost_claims: usize,
    /// Create batch members the connector returned no remote id for.
    pub missing_remote_ids: Vec<String>,
}

/// Options of [`RecordRepository::for_each_dirty_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyBatchOptions {
    pub batch_size: usize,
    /// Claims older than this may be taken over by another worker.
    pub claim_lease: Duration,
    /// Clear edits after a successful push (false keeps rows dirty).
    pub mark_clean: bool,
}

impl Default for DirtyBatchOptions {
    fn default() -> Self {
        DirtyBatchOptions {
            batch_size: 100,
            claim_lease: Duration::from_secs(600),
            mark_clean: true,
        }
    }
}

/// A batch whose callback failed.
#[derive(Debug)]
pub struct FailedBatch<E> {
    pub batch_index: usize,
    pub ws_ids: Vec<String>,
    pub error: E,
}

/// Summary of one `for_each_dirty_batch` run.
#[derive(Debug)]
pub struct DirtyBatchRun<E> {
    pub batches: usize,
    pub write_back: WriteBack,
    pub skipped: Vec<String>,
    pub failures: Vec<FailedBatch<E>>,
}

impl<E> Default for DirtyBatchRun<E> {
    fn default() -> Self {
        DirtyBatchRun {
            batches: 0,
            write_back: WriteBack::default(),
            skipped: Vec::new(),
            failures: Vec::new(),
        }
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for snapshot records.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    /// Creates a new RecordRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RecordRepository { pool }
    }

    // -------------------------------------------------------------------------
    // Pull side
    // -------------------------------------------------------------------------

    /// Merges connector records by remote id in one transaction.
    pub async fn upsert_from_connector(
        &self,
        table: &SnapshotTable,
        records: &[ConnectorRecord],
    ) -> DbResult<UpsertSummary> {
        let mut tx = self.pool.begin().await?;
        let summary = upsert_in(&mut tx, table, records).await?;
        tx.commit().await?;
        Ok(summary)
    }

    /// Merges one pull batch and stores its checkpoint in the same transaction.
    pub async fn upsert_pull_batch(
        &self,
        table: &SnapshotTable,
        records: &[ConnectorRecord],
        progress: &Value,
    ) -> DbResult<UpsertSummary> {
        let mut tx = self.pool.begin().await?;
        let summary = upsert_in(&mut tx, table, records).await?;
        save_progress_in(
            &mut tx,
            &table.snapshot_id,
            table.table_ws_id(),
            progress,
            records.len(),
        )
        .await?;
        tx.commit().await?;
        Ok(summary)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Loads one record.
    pub async fn get_record(
        &self,
        table: &SnapshotTable,
        ws_id: &str,
    ) -> DbResult<Option<SnapshotRecord>> {
        let mut conn = self.pool.acquire().await?;
        get_in(&mut conn, table, ws_id).await
    }

    /// Lists records ordered by remote id.
    ///
    /// ## Cursor
    /// The cursor is the wsId of the last record of the previous page; the
    /// page continues after that record's remote id. A cursor naming a record
    /// that no longer exists is a `NotFound` error.
    pub async fn list_records(&self, table: &SnapshotTable, query: &ListQuery) -> DbResult<RecordPage> {
        let name = table.quoted_name();
        let limit = match query.limit {
            0 => DEFAULT_LIST_LIMIT,
            n => n.min(MAX_LIST_LIMIT),
        };

        if let Some(filter) = &query.filter {
            self.validate_filter(table, filter).await?;
        }

        if let Some(cursor) = &query.cursor {
            let exists: Option<i64> = sqlx::query_scalar(&format!(
                "SELECT 1 FROM {} WHERE \"wsId\" = ?1",
                name
            ))
            .bind(cursor)
            .fetch_optional(&self.pool)
            .await?;
            if exists.is_none() {
                return Err(DbError::not_found("Cursor record", cursor.clone()));
            }
        }

        let total_count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", name))
            .fetch_one(&self.pool)
            .await?;

        let filtered_count = match &query.filter {
            None => total_count,
            Some(filter) => {
                let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT COUNT(*) FROM {} WHERE ", name));
                push_filter(&mut qb, &table.spec, filter)?;
                qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?
            }
        };

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM {} WHERE 1 = 1",
            select_columns(&table.spec),
            name
        ));
        if let Some(filter) = &query.filter {
            qb.push(" AND (");
            push_filter(&mut qb, &table.spec, filter)?;
            qb.push(")");
        }
        if let Some(cursor) = &query.cursor {
            qb.push(format!(
                " AND \"id\" > (SELECT \"id\" FROM {} WHERE \"wsId\" = ",
                name
            ));
            qb.push_bind(cursor.clone());
            qb.push(")");
        }
        qb.push(" ORDER BY \"id\" LIMIT ");
        qb.push_bind(i64::from(limit) + 1);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut records = rows
            .iter()
            .map(|row| record_from_row(&table.spec, row))
            .collect::<DbResult<Vec<_>>>()?;

        let next_cursor = if records.len() > limit as usize {
            records.truncate(limit as usize);
            records.last().map(|r| r.id.ws_id.clone())
        } else {
            None
        };

        Ok(RecordPage {
            records,
            total_count,
            filtered_count,
            next_cursor,
        })
    }

    /// Compiles `filter` and runs it with `LIMIT 0`.
    pub async fn validate_filter(&self, table: &SnapshotTable, filter: &Filter) -> DbResult<()> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT 1 FROM {} WHERE ",
            table.quoted_name()
        ));
        push_filter(&mut qb, &table.spec, filter)?;
        qb.push(" LIMIT 0");
        qb.build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DbError::InvalidFilter(e.to_string()))?;
        Ok(())
    }

    /// Dirty rows per push path.
    pub async fn count_dirty(&self, table: &SnapshotTable) -> DbResult<DirtyCounts> {
        let sql = format!(
            "SELECT \
                COALESCE(SUM(CASE WHEN {create} THEN 1 ELSE 0 END), 0) AS c, \
                COALESCE(SUM(CASE WHEN {update} THEN 1 ELSE 0 END), 0) AS u, \
                COALESCE(SUM(CASE WHEN {delete} THEN 1 ELSE 0 END), 0) AS d \
             FROM {name} WHERE \"__dirty\" = 1",
            create = operation_predicate(PushOperation::Create),
            update = operation_predicate(PushOperation::Update),
            delete = operation_predicate(PushOperation::Delete),
            name = table.quoted_name(),
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(DirtyCounts {
            create: row.try_get("c")?,
            update: row.try_get("u")?,
            delete: row.try_get("d")?,
        })
    }

    /// Rows carrying at least one unresolved suggestion.
    pub async fn count_pending_suggestions(&self, table: &SnapshotTable) -> DbResult<i64> {
        let count = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE \"__suggested_values\" <> '{{}}'",
            table.quoted_name()
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Edits
    // -------------------------------------------------------------------------

    /// Applies edit ops in one transaction.
    ///
    /// `Accepted` ops write `fields` and mark the record dirty; `Suggested`
    /// ops only write `suggestedValues`. Any failing op rolls back the batch.
    pub async fn apply_edit(
        &self,
        table: &SnapshotTable,
        ops: &[EditOp],
        tier: EditTier,
    ) -> DbResult<EditOutcome> {
        let now = Utc::now();
        let mut outcome = EditOutcome::default();
        let mut tx = self.pool.begin().await?;

        for op in ops {
            apply_op(&mut tx, table, op, tier, now, &mut outcome).await?;
        }

        tx.commit().await?;
        debug!(
            table = %table.label(),
            tier = %tier,
            ops = ops.len(),
            created = outcome.created.len(),
            removed = outcome.removed.len(),
            "Edits applied"
        );
        Ok(outcome)
    }

    /// Moves the named suggestions into `fields`; returns how many moved.
    pub async fn accept_suggestions(&self, table: &SnapshotTable, refs: &[FieldRef]) -> DbResult<usize> {
        let mut tx = self.pool.begin().await?;
        let count = resolve_suggestions_in(&mut tx, table, refs, true, Utc::now()).await?;
        tx.commit().await?;
        Ok(count)
    }

    /// Discards the named suggestions; returns how many were discarded.
    pub async fn reject_suggestions(&self, table: &SnapshotTable, refs: &[FieldRef]) -> DbResult<usize> {
        let mut tx = self.pool.begin().await?;
        let count = resolve_suggestions_in(&mut tx, table, refs, false, Utc::now()).await?;
        tx.commit().await?;
        Ok(count)
    }

    /// Accepts every pending suggestion of the table.
    pub async fn accept_all_suggestions(&self, table: &SnapshotTable) -> DbResult<usize> {
        self.resolve_all(table, true).await
    }

    /// Rejects every pending suggestion of the table.
    pub async fn reject_all_suggestions(&self, table: &SnapshotTable) -> DbResult<usize> {
        self.resolve_all(table, false).await
    }

    async fn resolve_all(&self, table: &SnapshotTable, accept: bool) -> DbResult<usize> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE \"__suggested_values\" <> '{{}}' ORDER BY \"id\"",
            select_columns(&table.spec),
            table.quoted_name()
        ))
        .fetch_all(&mut *tx)
        .await?;

        let mut refs = Vec::new();
        for row in &rows {
            let record = record_from_row(&table.spec, row)?;
            let ws_id = &record.id.ws_id;
            let suggested = &record.suggested_values;
            if suggested.created.is_some() {
                refs.push(FieldRef::new(ws_id.clone(), CREATED_MARKER));
            }
            refs.extend(
                suggested
                    .values
                    .keys()
                    .map(|field| FieldRef::new(ws_id.clone(), field.clone())),
            );
            if suggested.deleted.is_some() {
                refs.push(FieldRef::new(ws_id.clone(), DELETED_MARKER));
            }
        }

        let count = resolve_suggestions_in(&mut tx, table, &refs, accept, Utc::now()).await?;
        tx.commit().await?;
        info!(table = %table.label(), accept, count, "Resolved all suggestions");
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Push side
    // -------------------------------------------------------------------------

    /// Claims up to `limit` unclaimed dirty rows for `operation`.
    pub async fn claim_dirty_batch(
        &self,
        table: &SnapshotTable,
        operation: PushOperation,
        limit: usize,
        token: &str,
        lease: Duration,
    ) -> DbResult<Vec<ClaimedRecord>> {
        let name = table.quoted_name();
        let now = Utc::now().timestamp();
        let expired_before = now - lease.as_secs() as i64;

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "UPDATE {name} SET \"__push_claim\" = ?1, \"__push_claimed_at\" = ?2 \
             WHERE \"wsId\" IN ( \
                SELECT \"wsId\" FROM {name} \
                WHERE \"__dirty\" = 1 AND {predicate} \
                  AND (\"__push_claim\" IS NULL OR \"__push_claimed_at\" < ?3) \
                ORDER BY \"id\" LIMIT ?4)",
            name = name,
            predicate = operation_predicate(operation),
        ))
        .bind(token)
        .bind(now)
        .bind(expired_before)
        .bind(limit as i64)
        .execute(&mut *tx)
        .await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE \"__push_claim\" = ?1 ORDER BY \"id\"",
            select_columns(&table.spec),
            name
        ))
        .bind(token)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        rows.iter()
            .map(|row| {
                let record = record_from_row(&table.spec, row)?;
                Ok(ClaimedRecord {
                    edited_at_claim: record.edited_fields.clone(),
                    record,
                })
            })
            .collect()
    }

    /// Writes a successfully pushed batch back.
    ///
    /// ## Per Row
    /// - only rows still holding `token` are touched
    /// - create: the remote id replaces the placeholder, `__created` is dropped
    /// - field edits present at claim time are cleared when `mark_clean`;
    ///   edits made after the claim keep the row dirty
    /// - delete (with `mark_clean`): the row is removed
    /// - the claim is released
    pub async fn complete_batch(
        &self,
        table: &SnapshotTable,
        operation: PushOperation,
        token: &str,
        pushed: &[ClaimedRecord],
        created_ids: &HashMap<String, String>,
        mark_clean: bool,
    ) -> DbResult<WriteBack> {
        let name = table.quoted_name();
        let mut result = WriteBack::default();
        let mut tx = self.pool.begin().await?;

        for claimed in pushed {
            let ws_id = claimed.ws_id();
            let current: Option<String> = sqlx::query_scalar(&format!(
                "SELECT \"__edited_fields\" FROM {} WHERE \"wsId\" = ?1 AND \"__push_claim\" = ?2",
                name
            ))
            .bind(ws_id)
            .bind(token)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(current) = current else {
                warn!(table = %table.label(), ws_id = %ws_id, "Push claim lost before write-back");
                result.lost_claims += 1;
                continue;
            };

            if operation == PushOperation::Delete && mark_clean {
                sqlx::query(&format!("DELETE FROM {} WHERE \"wsId\" = ?1 AND \"__push_claim\" = ?2", name))
                    .bind(ws_id)
                    .bind(token)
                    .execute(&mut *tx)
                    .await?;
                result.cleaned += 1;
                continue;
            }

            let remote_id = if operation == PushOperation::Create {
                match created_ids.get(ws_id) {
                    Some(id) => Some(id.clone()),
                    None => {
                        result.missing_remote_ids.push(ws_id.to_string());
                        continue;
                    }
                }
            } else {
                None
            };

            let mut edited: EditedFields = serde_json::from_str(&current)?;
            if operation == PushOperation::Create {
                edited.created = None;
            }
            if mark_clean {
                let at_claim = &claimed.edited_at_claim;
                edited
                    .fields
                    .retain(|field, at| at_claim.fields.get(field) != Some(at));
            }
            let dirty = !edited.is_empty();

            let mut qb = QueryBuilder::<Sqlite>::new(format!("UPDATE {} SET ", name));
            if let Some(remote_id) = remote_id {
                qb.push("\"id\" = ");
                qb.push_bind(remote_id);
                qb.push(", ");
            }
            qb.push("\"__edited_fields\" = ");
            qb.push_bind(serde_json::to_string(&edited)?);
            qb.push(", \"__dirty\" = ");
            qb.push_bind(i64::from(dirty));
            qb.push(", \"__push_claim\" = NULL, \"__push_claimed_at\" = NULL WHERE \"wsId\" = ");
            qb.push_bind(ws_id.to_string());
            qb.push(" AND \"__push_claim\" = ");
            qb.push_bind(token.to_string());
            qb.build().execute(&mut *tx).await?;

            if dirty {
                result.still_dirty += 1;
            } else {
                result.cleaned += 1;
            }
        }

        tx.commit().await?;
        Ok(result)
    }

    /// Releases every row held by the given claim tokens.
    pub async fn release_claims(&self, table: &SnapshotTable, tokens: &[String]) -> DbResult<u64> {
        if tokens.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE {} SET \"__push_claim\" = NULL, \"__push_claimed_at\" = NULL WHERE \"__push_claim\" IN (",
            table.quoted_name()
        ));
        let mut separated = qb.separated(", ");
        for token in tokens {
            separated.push_bind(token.clone());
        }
        separated.push_unseparated(")");
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Drains the dirty rows of one push path batch by batch.
    ///
    /// ## Flow
    /// ```text
    /// loop:
    ///   claim ≤ batch_size rows  (none left → stop)
    ///   callback(records)        (no transaction open)
    ///     Ok  → write back sent rows; skipped rows stay claimed
    ///     Err → whole batch stays claimed, failure recorded
    /// release every claim still held by this run
    /// ```
    ///
    /// Holding failed and skipped rows until the end keeps the run from
    /// claiming them again. A store error ends the run after releasing.
    pub async fn for_each_dirty_batch<F, Fut, E>(
        &self,
        table: &SnapshotTable,
        operation: PushOperation,
        options: DirtyBatchOptions,
        mut callback: F,
    ) -> DbResult<DirtyBatchRun<E>>
    where
        F: FnMut(Vec<SnapshotRecord>) -> Fut,
        Fut: Future<Output = Result<BatchOutcome, E>>,
    {
        let batch_size = options.batch_size.max(1);
        let mut held_tokens: Vec<String> = Vec::new();
        let mut run = DirtyBatchRun::default();

        let result: DbResult<()> = async {
            loop {
                let token = Uuid::new_v4().to_string();
                let claimed = self
                    .claim_dirty_batch(table, operation, batch_size, &token, options.claim_lease)
                    .await?;
                if claimed.is_empty() {
                    break;
                }

                let batch_index = run.batches;
                run.batches += 1;
                let ws_ids: Vec<String> = claimed.iter().map(|c| c.ws_id().to_string()).collect();
                debug!(
                    table = %table.label(),
                    operation = %operation,
                    batch = batch_index,
                    size = claimed.len(),
                    "Claimed push batch"
                );

                let records = claimed.iter().map(|c| c.record.clone()).collect();
                match callback(records).await {
                    Ok(outcome) => {
                        let sent: Vec<ClaimedRecord> = claimed
                            .into_iter()
                            .filter(|c| !outcome.skipped.contains(c.ws_id()))
                            .collect();
                        if !outcome.skipped.is_empty() {
                            held_tokens.push(token.clone());
                            run.skipped.extend(outcome.skipped.iter().cloned());
                        }
                        let write_back = self
                            .complete_batch(
                                table,
                                operation,
                                &token,
                                &sent,
                                &outcome.created_ids,
                                options.mark_clean,
                            )
                            .await?;
                        if !write_back.missing_remote_ids.is_empty() {
                            held_tokens.push(token.clone());
                        }
                        merge_write_back(&mut run.write_back, write_back);
                    }
                    Err(error) => {
                        held_tokens.push(token);
                        run.failures.push(FailedBatch {
                            batch_index,
                            ws_ids,
                            error,
                        });
                    }
                }
            }
            Ok(())
        }
        .await;

        held_tokens.dedup();
        let released = self.release_claims(table, &held_tokens).await;
        result?;
        released?;
        Ok(run)
    }
}

fn merge_write_back(total: &mut WriteBack, batch: WriteBack) {
    total.cleaned += batch.cleaned;
    total.still_dirty += batch.still_dirty;
    total.lost_claims += batch.lost_claims;
    total.missing_remote_ids.extend(batch.missing_remote_ids);
}

// =============================================================================
// Helpers
// =============================================================================

/// SQL predicate selecting dirty rows routed to `operation`.
fn operation_predicate(operation: PushOperation) -> &'static str {
    match operation {
        PushOperation::Create => {
            "(json_extract(\"__edited_fields\", '$.__created') IS NOT NULL \
              AND json_extract(\"__edited_fields\", '$.__deleted') IS NULL)"
        }
        PushOperation::Update => {
            "(json_extract(\"__edited_fields\", '$.__created') IS NULL \
              AND json_extract(\"__edited_fields\", '$.__deleted') IS NULL)"
        }
        PushOperation::Delete => "(json_extract(\"__edited_fields\", '$.__deleted') IS NOT NULL)",
    }
}

async fn get_in(
    conn: &mut SqliteConnection,
    table: &SnapshotTable,
    ws_id: &str,
) -> DbResult<Option<SnapshotRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM {} WHERE \"wsId\" = ?1",
        select_columns(&table.spec),
        table.quoted_name()
    ))
    .bind(ws_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref()
        .map(|row| record_from_row(&table.spec, row))
        .transpose()
}

async fn require_in(
    conn: &mut SqliteConnection,
    table: &SnapshotTable,
    ws_id: &str,
) -> DbResult<SnapshotRecord> {
    get_in(conn, table, ws_id).await?.ok_or_else(|| {
        DbError::Core(CoreError::RecordNotFound {
            table: table.label(),
            ws_id: ws_id.to_string(),
        })
    })
}

async fn upsert_in(
    conn: &mut SqliteConnection,
    table: &SnapshotTable,
    records: &[ConnectorRecord],
) -> DbResult<UpsertSummary> {
    let mut summary = UpsertSummary::default();
    if records.is_empty() {
        return Ok(summary);
    }
    let name = table.quoted_name();

    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "SELECT \"id\", \"__dirty\" FROM {} WHERE \"id\" IN (",
        name
    ));
    let mut separated = qb.separated(", ");
    for record in records {
        separated.push_bind(record.id.clone());
    }
    separated.push_unseparated(")");
    let existing: HashMap<String, bool> = qb
        .build()
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|row| {
            let id: String = row.try_get(COL_ID)?;
            let dirty: i64 = row.try_get(COL_DIRTY)?;
            Ok((id, dirty != 0))
        })
        .collect::<DbResult<_>>()?;

    let mut ignored_fields = 0usize;
    for record in records {
        if record.id.is_empty() || strata_core::ids::is_placeholder_remote_id(&record.id) {
            warn!(table = %table.label(), id = %record.id, "Skipping pulled record with unusable id");
            continue;
        }

        let columns: Vec<_> = table
            .spec
            .columns
            .iter()
            .filter(|c| record.fields.contains_key(c.ws_id()))
            .collect();
        ignored_fields += record.fields.len() - columns.len();

        let metadata = record
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO {} (\"wsId\", \"id\", \"__metadata\"",
            name
        ));
        for column in &columns {
            qb.push(", ");
            qb.push(quote_ident(column.ws_id()));
        }
        qb.push(") VALUES (");
        qb.push_bind(generate_record_ws_id());
        qb.push(", ");
        qb.push_bind(record.id.clone());
        qb.push(", ");
        qb.push_bind(metadata);
        for column in &columns {
            qb.push(", ");
            let value = record.fields.get(column.ws_id()).unwrap_or(&Value::Null);
            push_sql_value(&mut qb, to_sql_value(column.pg_type, value));
        }
        qb.push(format!(
            ") ON CONFLICT({}) DO UPDATE SET {1} = excluded.{1}",
            quote_ident(COL_ID),
            quote_ident(COL_METADATA)
        ));
        for column in &columns {
            qb.push(format!(", {0} = excluded.{0}", quote_ident(column.ws_id())));
        }
        qb.build().execute(&mut *conn).await?;

        match existing.get(&record.id) {
            Some(dirty) => {
                summary.updated += 1;
                if *dirty {
                    summary.dirty_overwritten += 1;
                }
            }
            None => summary.inserted += 1,
        }
    }

    if ignored_fields > 0 {
        debug!(table = %table.label(), ignored_fields, "Pulled fields without a column were ignored");
    }
    if summary.dirty_overwritten > 0 {
        warn!(
            table = %table.label(),
            dirty_overwritten = summary.dirty_overwritten,
            "Pull overwrote synced values of rows with unpushed edits"
        );
    }
    Ok(summary)
}

/// Writes the given field columns plus the edit metadata of `record`.
async fn write_state(
    conn: &mut SqliteConnection,
    table: &SnapshotTable,
    record: &SnapshotRecord,
    changed_fields: &[String],
) -> DbResult<()> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!("UPDATE {} SET ", table.quoted_name()));
    for field in changed_fields {
        let Some(column) = table.spec.column(field) else {
            continue;
        };
        qb.push(format!("{} = ", quote_ident(field)));
        let value = record.fields.get(field).unwrap_or(&Value::Null);
        push_sql_value(&mut qb, to_sql_value(column.pg_type, value));
        qb.push(", ");
    }
    qb.push(format!("{} = ", quote_ident(COL_EDITED_FIELDS)));
    qb.push_bind(serde_json::to_string(&record.edited_fields)?);
    qb.push(format!(", {} = ", quote_ident(COL_SUGGESTED_VALUES)));
    qb.push_bind(serde_json::to_string(&record.suggested_values)?);
    qb.push(format!(", {} = ", quote_ident(COL_DIRTY)));
    qb.push_bind(i64::from(record.dirty));
    qb.push(format!(" WHERE {} = ", quote_ident(COL_WS_ID)));
    qb.push_bind(record.id.ws_id.clone());
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

/// Inserts a locally created record.
async fn insert_local(
    conn: &mut SqliteConnection,
    table: &SnapshotTable,
    record: &SnapshotRecord,
) -> DbResult<()> {
    let columns: Vec<_> = table
        .spec
        .columns
        .iter()
        .filter(|c| record.fields.contains_key(c.ws_id()))
        .collect();

    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "INSERT INTO {} (\"wsId\", \"id\", \"__edited_fields\", \"__suggested_values\", \"__dirty\"",
        table.quoted_name()
    ));
    for column in &columns {
        qb.push(", ");
        qb.push(quote_ident(column.ws_id()));
    }
    qb.push(") VALUES (");
    qb.push_bind(record.id.ws_id.clone());
    qb.push(", ");
    qb.push_bind(record.id.stored_id());
    qb.push(", ");
    qb.push_bind(serde_json::to_string(&record.edited_fields)?);
    qb.push(", ");
    qb.push_bind(serde_json::to_string(&record.suggested_values)?);
    qb.push(", ");
    qb.push_bind(i64::from(record.dirty));
    for column in &columns {
        qb.push(", ");
        let value = record.fields.get(column.ws_id()).unwrap_or(&Value::Null);
        push_sql_value(&mut qb, to_sql_value(column.pg_type, value));
    }
    qb.push(")");
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

async fn delete_row(conn: &mut SqliteConnection, table: &SnapshotTable, ws_id: &str) -> DbResult<()> {
    sqlx::query(&format!(
        "DELETE FROM {} WHERE \"wsId\" = ?1",
        table.quoted_name()
    ))
    .bind(ws_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// True while a push batch holds the row.
///
/// Expired claims count too: the create they cover may still have reached
/// the source, so the row is left for the delete path to settle.
async fn claim_held(conn: &mut SqliteConnection, table: &SnapshotTable, ws_id: &str) -> DbResult<bool> {
    let held: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT 1 FROM {} WHERE \"wsId\" = ?1 AND \"__push_claim\" IS NOT NULL",
        table.quoted_name()
    ))
    .bind(ws_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(held.is_some())
}

/// True for a row that exists only as an agent's create proposal.
fn is_suggested_only(record: &SnapshotRecord) -> bool {
    record.id.remote_id.is_none() && record.edited_fields.created.is_none()
}

async fn apply_op(
    conn: &mut SqliteConnection,
    table: &SnapshotTable,
    op: &EditOp,
    tier: EditTier,
    now: DateTime<Utc>,
    outcome: &mut EditOutcome,
) -> DbResult<()> {
    match op {
        EditOp::Create { ws_id, fields } => {
            let ws_id = ws_id.clone().unwrap_or_else(generate_record_ws_id);
            if !is_valid_slug(&ws_id) {
                return Err(DbError::invalid_edit(ws_id, "wsId is not a valid identifier"));
            }
            validate_edit_fields(&table.spec, fields)?;
            if get_in(conn, table, &ws_id).await?.is_some() {
                return Err(DbError::invalid_edit(ws_id, "a record with this wsId already exists"));
            }

            let record = match tier {
                EditTier::Accepted => SnapshotRecord {
                    id: RecordId {
                        ws_id: ws_id.clone(),
                        remote_id: None,
                    },
                    fields: fields.clone(),
                    edited_fields: EditedFields::created_at(now),
                    suggested_values: SuggestedValues::default(),
                    dirty: true,
                    metadata: Value::Null,
                },
                EditTier::Suggested => SnapshotRecord {
                    id: RecordId {
                        ws_id: ws_id.clone(),
                        remote_id: None,
                    },
                    fields: FieldMap::new(),
                    edited_fields: EditedFields::default(),
                    suggested_values: SuggestedValues {
                        created: Some(now),
                        deleted: None,
                        values: fields.clone().into_iter().collect(),
                    },
                    dirty: false,
                    metadata: Value::Null,
                },
            };
            insert_local(conn, table, &record).await?;
            outcome.created.push(ws_id);
        }

        EditOp::Update { ws_id, fields } => {
            validate_edit_fields(&table.spec, fields)?;
            let mut record = require_in(conn, table, ws_id).await?;

            match tier {
                EditTier::Accepted => {
                    if record.edited_fields.deleted.is_some() {
                        return Err(DbError::invalid_edit(ws_id.clone(), "record is marked deleted"));
                    }
                    if is_suggested_only(&record) {
                        return Err(DbError::invalid_edit(
                            ws_id.clone(),
                            "record is a suggested create; accept it first",
                        ));
                    }
                    for (field, value) in fields {
                        record.fields.insert(field.clone(), value.clone());
                        record.edited_fields.mark_field(field.clone(), now);
                    }
                    record.sync_dirty();
                    let changed: Vec<String> = fields.keys().cloned().collect();
                    write_state(conn, table, &record, &changed).await?;
                }
                EditTier::Suggested => {
                    for (field, value) in fields {
                        record.suggested_values.suggest(field.clone(), value.clone());
                    }
                    write_state(conn, table, &record, &[]).await?;
                }
            }
            outcome.updated.push(ws_id.clone());
        }

        EditOp::Delete { ws_id } => {
            let mut record = require_in(conn, table, ws_id).await?;
            let local_only = record.id.remote_id.is_none() && !claim_held(conn, table, ws_id).await?;
            match tier {
                EditTier::Accepted if local_only => {
                    // Never pushed: nothing to delete at the source.
                    delete_row(conn, table, ws_id).await?;
                    outcome.removed.push(ws_id.clone());
                }
                EditTier::Accepted => {
                    record.edited_fields.mark_deleted(now);
                    record.sync_dirty();
                    write_state(conn, table, &record, &[]).await?;
                    outcome.updated.push(ws_id.clone());
                }
                EditTier::Suggested => {
                    record.suggested_values.deleted = Some(now);
                    write_state(conn, table, &record, &[]).await?;
                    outcome.updated.push(ws_id.clone());
                }
            }
        }

        EditOp::Undelete { ws_id } => {
            let mut record = require_in(conn, table, ws_id).await?;
            match tier {
                EditTier::Accepted => {
                    // A delete deferred behind a create push dropped the create marker.
                    if record.edited_fields.clear_deleted() && record.id.remote_id.is_none() {
                        record.edited_fields.mark_created(now);
                    }
                    record.sync_dirty();
                }
                EditTier::Suggested => {
                    record.suggested_values.deleted = None;
                }
            }
            write_state(conn, table, &record, &[]).await?;
            outcome.updated.push(ws_id.clone());
        }
    }
    Ok(())
}

/// Accepts or rejects `refs`; returns how many suggestions were resolved.
async fn resolve_suggestions_in(
    conn: &mut SqliteConnection,
    table: &SnapshotTable,
    refs: &[FieldRef],
    accept: bool,
    now: DateTime<Utc>,
) -> DbResult<usize> {
    // Group by record, keeping first-seen order.
    let mut order: Vec<&str> = Vec::new();
    let mut by_record: HashMap<&str, Vec<&str>> = HashMap::new();
    for field_ref in refs {
        by_record
            .entry(field_ref.ws_id.as_str())
            .or_insert_with(|| {
                order.push(field_ref.ws_id.as_str());
                Vec::new()
            })
            .push(field_ref.field_id.as_str());
    }

    let mut resolved = 0usize;
    for ws_id in order {
        let mut fields = by_record.remove(ws_id).unwrap_or_default();
        // The create marker goes first so field accepts land on a real create.
        fields.sort_by_key(|f| *f != CREATED_MARKER);

        let mut record = require_in(conn, table, ws_id).await?;
        let mut changed: Vec<String> = Vec::new();
        let mut removed = false;

        for field in fields {
            match field {
                CREATED_MARKER => {
                    if record.suggested_values.created.take().is_none() {
                        continue;
                    }
                    resolved += 1;
                    if accept {
                        record.edited_fields.mark_created(now);
                        let values = std::mem::take(&mut record.suggested_values.values);
                        for (key, value) in values {
                            record.fields.insert(key.clone(), value);
                            changed.push(key);
                        }
                    } else if is_suggested_only(&record) {
                        delete_row(conn, table, ws_id).await?;
                        removed = true;
                        break;
                    }
                }
                DELETED_MARKER => {
                    if record.suggested_values.deleted.take().is_none() {
                        continue;
                    }
                    resolved += 1;
                    if accept {
                        if record.id.remote_id.is_none() && !claim_held(conn, table, ws_id).await? {
                            delete_row(conn, table, ws_id).await?;
                            removed = true;
                            break;
                        }
                        record.edited_fields.mark_deleted(now);
                    }
                }
                field => {
                    let Some(value) = record.suggested_values.take(field) else {
                        continue;
                    };
                    resolved += 1;
                    if accept {
                        if is_suggested_only(&record) {
                            return Err(DbError::invalid_edit(
                                ws_id,
                                "accept the suggested create before its fields",
                            ));
                        }
                        record.fields.insert(field.to_string(), value);
                        record.edited_fields.mark_field(field, now);
                        changed.push(field.to_string());
                    }
                }
            }
        }

        if !removed {
            record.sync_dirty();
            write_state(conn, table, &record, &changed).await?;
        }
    }
    Ok(resolved)
}
