//! # Sync Engine
//!
//! Moves records between a connector and the snapshot store, and exposes
//! the edit surface over snapshot tables.
//!
//! ## Pull
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  fetch_table_spec ──► create_schema ──► pull_records(progress)          │
//! │                                            │                            │
//! │                              on_batch ─────┤ per page, in order:        │
//! │                                            ▼                            │
//! │                         ┌──────────────────────────────────┐           │
//! │                         │ one transaction:                 │           │
//! │                         │   upsert records by remote id    │           │
//! │                         │   save checkpoint {progress, n}  │           │
//! │                         └──────────────────────────────────┘           │
//! │                                                                         │
//! │  crash / error ──► checkpoint stays incomplete ──► next pull resumes   │
//! │  end of stream ──► checkpoint marked complete                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Push
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  for op in [create, update, delete]:                                    │
//! │    for_each_dirty_batch(op, min(connector batch, max_batch_size))       │
//! │      validate each record   (invalid → skipped, stays dirty)           │
//! │      connector.{create|update|delete}_records                           │
//! │        Ok  → write back ids, clear edits, release claim                 │
//! │        Err → batch held until the run ends, one error reported          │
//! │                                                                         │
//! │  A failing batch never stops later batches or other tables.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Pulls and edits of the same table are serialized in-process; pushes are
//! partitioned by row claims instead and may run concurrently.

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use strata_core::validation::validate_for_push;
use strata_core::{
    ConnectorError, EditOp, EditOutcome, EditTier, EntityId, FieldRef, PushOperation,
    SnapshotRecord, TableSpec,
};
use strata_db::{
    physical_table_name, BatchOutcome, Database, DbError, DirtyBatchOptions, DirtyCounts,
    ListQuery, PullCheckpoint, RecordPage, RecordRepository, SnapshotTable,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::SyncSettings;
use crate::connector::{Connector, ConnectorResult, PullBatch, PullBatchHandler};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Reports
// =============================================================================

/// Outcome of one pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullReport {
    /// `snapshot/table`
    pub table: String,
    pub batches: usize,
    /// Records received by this run.
    pub records: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Rows with unpushed edits whose synced values were replaced.
    pub dirty_overwritten: usize,
    /// True if the run continued an earlier checkpoint.
    pub resumed: bool,
    /// Total records of the pull across all resumed runs.
    pub records_pulled: i64,
}

/// Outcome of one push path of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    pub operation: PushOperation,
    pub batches: usize,
    /// Rows written back clean (or removed, for deletes).
    pub pushed: usize,
    /// Rows pushed but edited again while in flight.
    pub still_dirty: usize,
    pub lost_claims: usize,
    /// Rows held back by validation.
    pub skipped: usize,
    pub failed_batches: usize,
}

/// One reported push failure.
#[derive(Debug)]
pub struct BatchError {
    pub operation: PushOperation,
    /// `None` for record-level failures (validation, reconciliation).
    pub batch_index: Option<usize>,
    pub ws_ids: Vec<String>,
    pub error: SyncError,
}

/// Outcome of pushing one table.
#[derive(Debug)]
pub struct PushReport {
    pub table: String,
    pub operations: Vec<OperationReport>,
    pub errors: Vec<BatchError>,
}

impl PushReport {
    /// Rows pushed across all operations.
    pub fn pushed(&self) -> usize {
        self.operations.iter().map(|o| o.pushed).sum()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Sync state of one snapshot table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStatus {
    pub table: String,
    pub dirty: DirtyCounts,
    pub pending_suggestions: i64,
    pub checkpoint: Option<PullCheckpoint>,
}

// =============================================================================
// Pull Batch Handler
// =============================================================================

/// Stores each pull batch together with its checkpoint.
struct StoreBatches<'a> {
    records: RecordRepository,
    table: &'a SnapshotTable,
    report: PullReport,
    failure: Option<SyncError>,
}

#[async_trait]
impl<'a> PullBatchHandler for StoreBatches<'a> {
    async fn on_batch(&mut self, batch: PullBatch) -> ConnectorResult<()> {
        let index = self.report.batches;
        match self
            .records
            .upsert_pull_batch(self.table, &batch.records, &batch.progress)
            .await
        {
            Ok(summary) => {
                self.report.batches += 1;
                self.report.records += batch.records.len();
                self.report.inserted += summary.inserted;
                self.report.updated += summary.updated;
                self.report.dirty_overwritten += summary.dirty_overwritten;
                debug!(
                    table = %self.table.label(),
                    batch = index,
                    records = batch.records.len(),
                    "Stored pull batch"
                );
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.failure = Some(SyncError::database_batch(self.table.label(), index, e));
                Err(ConnectorError::Aborted { reason })
            }
        }
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Pull/push orchestrator over one snapshot store.
///
/// Cloning is cheap; clones share the store and the per-table locks.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    db: Database,
    settings: SyncSettings,
    table_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SyncEngine {
    pub fn new(db: Database, settings: SyncSettings) -> Self {
        SyncEngine {
            db,
            settings,
            table_locks: Arc::default(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    async fn table_lock(&self, snapshot_id: &str, table_ws_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.table_locks.lock().await;
        locks
            .entry(physical_table_name(snapshot_id, table_ws_id))
            .or_default()
            .clone()
    }

    async fn load_table(&self, snapshot_id: &str, table_ws_id: &str) -> SyncResult<SnapshotTable> {
        self.db
            .schema()
            .load_table(snapshot_id, table_ws_id)
            .await
            .map_err(|e| match e {
                DbError::NotFound { .. } => SyncError::TableNotFound {
                    snapshot: snapshot_id.to_string(),
                    table: table_ws_id.to_string(),
                },
                other => SyncError::database(format!("{}/{}", snapshot_id, table_ws_id), other),
            })
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Pulls one table into the snapshot.
    ///
    /// Starts from `resume_token` when given, otherwise from the table's
    /// incomplete checkpoint, otherwise from the beginning. Batches stored
    /// before a failure stay committed; the checkpoint points after the
    /// last of them.
    pub async fn pull(
        &self,
        snapshot_id: &str,
        connector: &dyn Connector,
        table: &EntityId,
        resume_token: Option<Value>,
    ) -> SyncResult<PullReport> {
        let service = connector.display_name().to_string();
        let requested = format!("{}/{}", snapshot_id, table.ws_id);
        info!(table = %requested, service = %service, "Starting pull");

        let spec = connector
            .fetch_table_spec(table)
            .await
            .map_err(|e| SyncError::connector(&service, e))?;
        let bound = self
            .db
            .schema()
            .create_schema(snapshot_id, std::slice::from_ref(&spec))
            .await
            .map_err(|e| SyncError::database(&requested, e))?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::TableNotFound {
                snapshot: snapshot_id.to_string(),
                table: table.ws_id.clone(),
            })?;
        let label = bound.label();

        let lock = self.table_lock(snapshot_id, bound.table_ws_id()).await;
        let _guard = lock.lock().await;

        let progress = self.db.progress();
        let store_err = |e| SyncError::database(&label, e);
        let (start, resumed) = match resume_token {
            Some(token) => (Some(token), true),
            None => match progress
                .load_progress(snapshot_id, bound.table_ws_id())
                .await
                .map_err(store_err)?
            {
                Some(checkpoint) if !checkpoint.is_complete() => {
                    info!(
                        table = %label,
                        records_pulled = checkpoint.records_pulled,
                        "Resuming pull from checkpoint"
                    );
                    (checkpoint.progress, true)
                }
                _ => {
                    progress
                        .start_progress(snapshot_id, bound.table_ws_id())
                        .await
                        .map_err(store_err)?;
                    (None, false)
                }
            },
        };

        let mut handler = StoreBatches {
            records: self.db.records(),
            table: &bound,
            report: PullReport {
                table: label.clone(),
                resumed,
                ..Default::default()
            },
            failure: None,
        };

        if let Err(err) = connector.pull_records(&bound.spec, start, &mut handler).await {
            if let Some(failure) = handler.failure.take() {
                error!(table = %label, error = %failure, "Pull stopped by store failure");
                return Err(failure);
            }
            warn!(
                table = %label,
                batches = handler.report.batches,
                error = %err,
                "Pull interrupted, checkpoint kept for resume"
            );
            return Err(SyncError::connector(&service, err));
        }

        progress
            .complete_progress(snapshot_id, bound.table_ws_id())
            .await
            .map_err(store_err)?;
        let mut report = handler.report;
        report.records_pulled = progress
            .load_progress(snapshot_id, bound.table_ws_id())
            .await
            .map_err(store_err)?
            .map(|c| c.records_pulled)
            .unwrap_or(report.records as i64);

        info!(
            table = %label,
            batches = report.batches,
            inserted = report.inserted,
            updated = report.updated,
            records_pulled = report.records_pulled,
            "Pull complete"
        );
        Ok(report)
    }

    /// Forgets the table's checkpoint so the next pull starts over.
    pub async fn clear_checkpoint(&self, snapshot_id: &str, table_ws_id: &str) -> SyncResult<bool> {
        self.db
            .progress()
            .clear_progress(snapshot_id, table_ws_id)
            .await
            .map_err(|e| SyncError::database(format!("{}/{}", snapshot_id, table_ws_id), e))
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Pushes the dirty rows of one table.
    ///
    /// `operation` limits the run to one push path; `None` drains create,
    /// update and delete in that order. Batch failures are reported in the
    /// returned [`PushReport`]; only store failures end the run early.
    pub async fn push(
        &self,
        snapshot_id: &str,
        connector: &dyn Connector,
        table_ws_id: &str,
        operation: Option<PushOperation>,
    ) -> SyncResult<PushReport> {
        let table = self.load_table(snapshot_id, table_ws_id).await?;
        let operations = match operation {
            Some(op) => vec![op],
            None => PushOperation::ORDERED.to_vec(),
        };

        let mut report = PushReport {
            table: table.label(),
            operations: Vec::with_capacity(operations.len()),
            errors: Vec::new(),
        };
        for operation in operations {
            let (op_report, errors) = self.push_operation(&table, connector, operation).await?;
            report.operations.push(op_report);
            report.errors.extend(errors);
        }

        info!(
            table = %report.table,
            pushed = report.pushed(),
            errors = report.errors.len(),
            "Push complete"
        );
        Ok(report)
    }

    async fn push_operation(
        &self,
        table: &SnapshotTable,
        connector: &dyn Connector,
        operation: PushOperation,
    ) -> SyncResult<(OperationReport, Vec<BatchError>)> {
        let service = connector.display_name().to_string();
        let options = DirtyBatchOptions {
            batch_size: connector
                .batch_size(operation)
                .min(self.settings.max_batch_size)
                .max(1),
            claim_lease: self.settings.claim_lease(),
            mark_clean: self.settings.mark_clean,
        };
        let spec = &table.spec;
        let rejected: Arc<StdMutex<Vec<BatchError>>> = Arc::default();
        let sink = Arc::clone(&rejected);

        let run = self
            .db
            .records()
            .for_each_dirty_batch(table, operation, options, move |records| {
                let sink = Arc::clone(&sink);
                let service = service.clone();
                async move {
                    send_batch(connector, spec, operation, records, &sink)
                        .await
                        .map_err(|e| SyncError::connector(service, e))
                }
            })
            .await
            .map_err(|e| SyncError::database(table.label(), e))?;

        let mut errors = match rejected.lock() {
            Ok(mut list) => std::mem::take(&mut *list),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        let op_report = OperationReport {
            operation,
            batches: run.batches,
            pushed: run.write_back.cleaned,
            still_dirty: run.write_back.still_dirty,
            lost_claims: run.write_back.lost_claims,
            skipped: run.skipped.len(),
            failed_batches: run.failures.len(),
        };

        for failure in run.failures {
            error!(
                table = %table.label(),
                operation = %operation,
                batch = failure.batch_index,
                records = failure.ws_ids.len(),
                error = %failure.error,
                "Push batch failed"
            );
            errors.push(BatchError {
                operation,
                batch_index: Some(failure.batch_index),
                ws_ids: failure.ws_ids,
                error: failure.error,
            });
        }

        let missing = run.write_back.missing_remote_ids;
        if !missing.is_empty() {
            errors.push(BatchError {
                operation,
                batch_index: None,
                error: SyncError::Reconciliation {
                    table: table.label(),
                    message: format!(
                        "{} returned no remote id for {} created record(s)",
                        connector.display_name(),
                        missing.len()
                    ),
                },
                ws_ids: missing,
            });
        }
        if op_report.lost_claims > 0 {
            warn!(
                table = %table.label(),
                operation = %operation,
                lost = op_report.lost_claims,
                "Push claims expired before write-back"
            );
        }

        debug!(
            table = %table.label(),
            operation = %operation,
            batches = op_report.batches,
            pushed = op_report.pushed,
            "Push path drained"
        );
        Ok((op_report, errors))
    }

    /// Pushes several tables concurrently. One table's failure never stops
    /// the others.
    pub async fn push_all(
        &self,
        snapshot_id: &str,
        connector: &dyn Connector,
        tables: &[String],
    ) -> Vec<(String, SyncResult<PushReport>)> {
        let runs = tables.iter().map(|table| async move {
            let result = self.push(snapshot_id, connector, table, None).await;
            if let Err(e) = &result {
                error!(snapshot = %snapshot_id, table = %table, error = %e, "Table push failed");
            }
            (table.clone(), result)
        });
        join_all(runs).await
    }

    // =========================================================================
    // Reads & Edits
    // =========================================================================

    /// Table specs of a snapshot.
    pub async fn tables(&self, snapshot_id: &str) -> SyncResult<Vec<TableSpec>> {
        self.db
            .schema()
            .list_tables(snapshot_id)
            .await
            .map_err(|e| SyncError::database(snapshot_id, e))
    }

    /// Snapshot ids present in the store, sorted.
    pub async fn snapshots(&self) -> SyncResult<Vec<String>> {
        self.db
            .schema()
            .list_snapshots()
            .await
            .map_err(|e| SyncError::database("catalog", e))
    }

    pub async fn list_records(
        &self,
        snapshot_id: &str,
        table_ws_id: &str,
        query: &ListQuery,
    ) -> SyncResult<RecordPage> {
        let table = self.load_table(snapshot_id, table_ws_id).await?;
        self.db
            .records()
            .list_records(&table, query)
            .await
            .map_err(|e| SyncError::database(table.label(), e))
    }

    pub async fn get_record(
        &self,
        snapshot_id: &str,
        table_ws_id: &str,
        ws_id: &str,
    ) -> SyncResult<Option<SnapshotRecord>> {
        let table = self.load_table(snapshot_id, table_ws_id).await?;
        self.db
            .records()
            .get_record(&table, ws_id)
            .await
            .map_err(|e| SyncError::database(table.label(), e))
    }

    /// Applies edit ops atomically.
    pub async fn apply_edit(
        &self,
        snapshot_id: &str,
        table_ws_id: &str,
        ops: &[EditOp],
        tier: EditTier,
    ) -> SyncResult<EditOutcome> {
        let table = self.load_table(snapshot_id, table_ws_id).await?;
        let lock = self.table_lock(snapshot_id, table_ws_id).await;
        let _guard = lock.lock().await;
        self.db
            .records()
            .apply_edit(&table, ops, tier)
            .await
            .map_err(|e| SyncError::database(table.label(), e))
    }

    pub async fn accept_suggestions(
        &self,
        snapshot_id: &str,
        table_ws_id: &str,
        refs: &[FieldRef],
    ) -> SyncResult<usize> {
        self.resolve(snapshot_id, table_ws_id, Some(refs), true).await
    }

    pub async fn reject_suggestions(
        &self,
        snapshot_id: &str,
        table_ws_id: &str,
        refs: &[FieldRef],
    ) -> SyncResult<usize> {
        self.resolve(snapshot_id, table_ws_id, Some(refs), false).await
    }

    pub async fn accept_all_suggestions(&self, snapshot_id: &str, table_ws_id: &str) -> SyncResult<usize> {
        self.resolve(snapshot_id, table_ws_id, None, true).await
    }

    pub async fn reject_all_suggestions(&self, snapshot_id: &str, table_ws_id: &str) -> SyncResult<usize> {
        self.resolve(snapshot_id, table_ws_id, None, false).await
    }

    async fn resolve(
        &self,
        snapshot_id: &str,
        table_ws_id: &str,
        refs: Option<&[FieldRef]>,
        accept: bool,
    ) -> SyncResult<usize> {
        let table = self.load_table(snapshot_id, table_ws_id).await?;
        let lock = self.table_lock(snapshot_id, table_ws_id).await;
        let _guard = lock.lock().await;

        let records = self.db.records();
        let result = match (refs, accept) {
            (Some(refs), true) => records.accept_suggestions(&table, refs).await,
            (Some(refs), false) => records.reject_suggestions(&table, refs).await,
            (None, true) => records.accept_all_suggestions(&table).await,
            (None, false) => records.reject_all_suggestions(&table).await,
        };
        result.map_err(|e| SyncError::database(table.label(), e))
    }

    /// Dirty counts, pending suggestions and the last pull checkpoint.
    pub async fn status(&self, snapshot_id: &str, table_ws_id: &str) -> SyncResult<TableStatus> {
        let table = self.load_table(snapshot_id, table_ws_id).await?;
        let store_err = |e| SyncError::database(table.label(), e);
        let records = self.db.records();

        Ok(TableStatus {
            table: table.label(),
            dirty: records.count_dirty(&table).await.map_err(store_err)?,
            pending_suggestions: records
                .count_pending_suggestions(&table)
                .await
                .map_err(store_err)?,
            checkpoint: self
                .db
                .progress()
                .load_progress(snapshot_id, table_ws_id)
                .await
                .map_err(store_err)?,
        })
    }

    /// Drops every table of a snapshot.
    pub async fn drop_snapshot(&self, snapshot_id: &str) -> SyncResult<bool> {
        self.db
            .schema()
            .drop_snapshot(snapshot_id)
            .await
            .map_err(|e| SyncError::database(snapshot_id, e))
    }
}

/// Validates and sends one claimed batch.
async fn send_batch(
    connector: &dyn Connector,
    spec: &TableSpec,
    operation: PushOperation,
    records: Vec<SnapshotRecord>,
    rejected: &StdMutex<Vec<BatchError>>,
) -> ConnectorResult<BatchOutcome> {
    let mut outcome = BatchOutcome::default();
    let mut valid = Vec::with_capacity(records.len());

    for record in records {
        match validate_for_push(spec, &record) {
            Ok(()) => valid.push(record),
            Err(source) => {
                let ws_id = record.id.ws_id.clone();
                warn!(table = %spec.ws_id(), ws_id = %ws_id, error = %source, "Record held back from push");
                outcome.skipped.insert(ws_id.clone());
                if let Ok(mut list) = rejected.lock() {
                    list.push(BatchError {
                        operation,
                        batch_index: None,
                        ws_ids: vec![ws_id.clone()],
                        error: SyncError::Validation { ws_id, source },
                    });
                }
            }
        }
    }

    match operation {
        PushOperation::Create => {
            if !valid.is_empty() {
                outcome.created_ids = connector.create_records(spec, &valid).await?;
            }
        }
        PushOperation::Update => {
            if !valid.is_empty() {
                connector.update_records(spec, &valid).await?;
            }
        }
        PushOperation::Delete => {
            // Never-pushed rows have nothing to delete remotely.
            let remote: Vec<SnapshotRecord> = valid.into_iter().filter(|r| r.is_pushed()).collect();
            if !remote.is_empty() {
                connector.delete_records(spec, &remote).await?;
            }
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::memory::{MemoryCall, MemoryConnector, MemoryOptions};
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;
    use strata_core::{ColumnSpec, ConnectorRecord, FieldMap, PgType};

    const SNAP: &str = "snap";

    fn notes_spec() -> TableSpec {
        TableSpec::new(
            EntityId::new("notes", vec!["base".into(), "tbl_notes".into()]),
            "Notes",
            vec![
                ColumnSpec::new(EntityId::new("title", vec!["fld_title".into()]), "Title", PgType::Text)
                    .required(),
                ColumnSpec::new(EntityId::new("views", vec!["fld_views".into()]), "Views", PgType::Numeric),
            ],
        )
    }

    fn fields(title: Option<&str>, views: i64) -> FieldMap {
        let mut map = FieldMap::new();
        if let Some(title) = title {
            map.insert("title".into(), json!(title));
        }
        map.insert("views".into(), json!(views));
        map
    }

    fn source_rows(n: usize) -> Vec<ConnectorRecord> {
        (0..n)
            .map(|i| ConnectorRecord::new(format!("r{:04}", i), fields(Some(&format!("Note {}", i)), i as i64)))
            .collect()
    }

    async fn setup(options: MemoryOptions, rows: usize) -> (SyncEngine, MemoryConnector) {
        let db = Database::in_memory().await.unwrap();
        let engine = SyncEngine::new(db, SyncSettings::default());
        let connector = MemoryConnector::new(options);
        connector.add_table(notes_spec(), source_rows(rows)).await;
        (engine, connector)
    }

    async fn all_records(engine: &SyncEngine) -> Vec<SnapshotRecord> {
        let query = ListQuery {
            limit: 1000,
            ..Default::default()
        };
        engine.list_records(SNAP, "notes", &query).await.unwrap().records
    }

    async fn ws_id_of(engine: &SyncEngine, remote_id: &str) -> String {
        all_records(engine)
            .await
            .into_iter()
            .find(|r| r.id.remote_id.as_deref() == Some(remote_id))
            .map(|r| r.id.ws_id)
            .unwrap()
    }

    async fn push_calls(connector: &MemoryConnector) -> Vec<MemoryCall> {
        connector
            .call_log()
            .await
            .into_iter()
            .filter(MemoryCall::is_push)
            .collect()
    }

    #[tokio::test]
    async fn test_interrupted_pull_resumes_from_checkpoint() {
        let (engine, connector) =
            setup(MemoryOptions::default().page_size(100).fail_after_batches(2), 250).await;

        let err = engine
            .pull(SNAP, &connector, &notes_spec().id, None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let status = engine.status(SNAP, "notes").await.unwrap();
        let checkpoint = status.checkpoint.unwrap();
        assert_eq!(checkpoint.records_pulled, 200);
        assert!(!checkpoint.is_complete());

        let report = engine.pull(SNAP, &connector, &notes_spec().id, None).await.unwrap();
        assert!(report.resumed);
        assert_eq!(report.records, 50);
        assert_eq!(report.records_pulled, 250);

        let records = all_records(&engine).await;
        assert_eq!(records.len(), 250);
        let distinct: HashSet<_> = records.iter().map(|r| r.id.remote_id.clone()).collect();
        assert_eq!(distinct.len(), 250);
        assert!(engine
            .status(SNAP, "notes")
            .await
            .unwrap()
            .checkpoint
            .unwrap()
            .is_complete());
    }

    #[tokio::test]
    async fn test_repeated_pull_is_idempotent() {
        let (engine, connector) = setup(MemoryOptions::default(), 120).await;

        let first = engine.pull(SNAP, &connector, &notes_spec().id, None).await.unwrap();
        assert_eq!(first.inserted, 120);
        assert!(!first.resumed);

        let second = engine.pull(SNAP, &connector, &notes_spec().id, None).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 120);
        assert_eq!(second.records_pulled, 120);
        assert_eq!(all_records(&engine).await.len(), 120);
    }

    #[tokio::test]
    async fn test_explicit_resume_token() {
        let (engine, connector) = setup(MemoryOptions::default().page_size(10), 25).await;
        let report = engine
            .pull(SNAP, &connector, &notes_spec().id, Some(json!({ "offset": 20 })))
            .await
            .unwrap();
        assert!(report.resumed);
        assert_eq!(report.records, 5);
    }

    #[tokio::test]
    async fn test_push_runs_create_update_delete_in_order() {
        let (engine, connector) = setup(MemoryOptions::default(), 3).await;
        engine.pull(SNAP, &connector, &notes_spec().id, None).await.unwrap();

        let r1 = ws_id_of(&engine, "r0001").await;
        let r2 = ws_id_of(&engine, "r0002").await;
        let outcome = engine
            .apply_edit(
                SNAP,
                "notes",
                &[
                    EditOp::delete(&r2),
                    EditOp::update(&r1, fields(Some("Renamed"), 11)),
                    EditOp::create(fields(Some("Fresh"), 0)),
                ],
                EditTier::Accepted,
            )
            .await
            .unwrap();
        let created = outcome.created[0].clone();
        connector.clear_call_log().await;

        let report = engine.push(SNAP, &connector, "notes", None).await.unwrap();
        assert!(!report.has_errors());
        assert_eq!(report.pushed(), 3);

        let calls = push_calls(&connector).await;
        assert_eq!(
            calls,
            vec![
                MemoryCall::Create { table: "notes".into(), count: 1 },
                MemoryCall::Update { table: "notes".into(), count: 1 },
                MemoryCall::Delete { table: "notes".into(), count: 1 },
            ]
        );

        let status = engine.status(SNAP, "notes").await.unwrap();
        assert_eq!(status.dirty.total(), 0);

        let records = all_records(&engine).await;
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| !r.dirty && r.is_pushed()));
        let fresh = engine.get_record(SNAP, "notes", &created).await.unwrap().unwrap();
        assert!(fresh.id.remote_id.unwrap().starts_with("notes_"));

        let remote = connector.records("notes").await;
        assert_eq!(remote.len(), 3);
        assert!(remote.iter().all(|r| r.id != "r0002"));
        assert!(remote
            .iter()
            .any(|r| r.id == "r0001" && r.fields.get("title") == Some(&json!("Renamed"))));
    }

    #[tokio::test]
    async fn test_placeholder_delete_needs_no_connector_call() {
        let (engine, connector) = setup(MemoryOptions::default(), 0).await;
        engine.pull(SNAP, &connector, &notes_spec().id, None).await.unwrap();

        let outcome = engine
            .apply_edit(SNAP, "notes", &[EditOp::create(fields(Some("Draft"), 1))], EditTier::Accepted)
            .await
            .unwrap();
        let removed = engine
            .apply_edit(SNAP, "notes", &[EditOp::delete(&outcome.created[0])], EditTier::Accepted)
            .await
            .unwrap();
        assert_eq!(removed.removed, outcome.created);
        connector.clear_call_log().await;

        let report = engine.push(SNAP, &connector, "notes", None).await.unwrap();
        assert_eq!(report.pushed(), 0);
        assert!(push_calls(&connector).await.is_empty());
        assert!(all_records(&engine).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_is_reported_and_stays_dirty() {
        let (engine, connector) = setup(MemoryOptions::default().batch_size(1), 3).await;
        engine.pull(SNAP, &connector, &notes_spec().id, None).await.unwrap();

        let mut ops = Vec::new();
        for remote in ["r0000", "r0001", "r0002"] {
            ops.push(EditOp::update(ws_id_of(&engine, remote).await, fields(None, 99)));
        }
        engine.apply_edit(SNAP, "notes", &ops, EditTier::Accepted).await.unwrap();
        connector
            .fail_next(
                PushOperation::Update,
                ConnectorError::Http {
                    status: 500,
                    body: "boom".into(),
                },
            )
            .await;

        let report = engine
            .push(SNAP, &connector, "notes", Some(PushOperation::Update))
            .await
            .unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].batch_index, Some(0));
        assert_eq!(report.errors[0].ws_ids.len(), 1);
        assert!(report.errors[0].error.is_retryable());
        assert_eq!(report.operations[0].pushed, 2);
        assert_eq!(report.operations[0].failed_batches, 1);

        let status = engine.status(SNAP, "notes").await.unwrap();
        assert_eq!(status.dirty.update, 1);

        let retry = engine.push(SNAP, &connector, "notes", None).await.unwrap();
        assert!(!retry.has_errors());
        assert_eq!(engine.status(SNAP, "notes").await.unwrap().dirty.total(), 0);
    }

    #[tokio::test]
    async fn test_invalid_records_are_skipped() {
        let (engine, connector) = setup(MemoryOptions::default(), 0).await;
        engine.pull(SNAP, &connector, &notes_spec().id, None).await.unwrap();

        engine
            .apply_edit(
                SNAP,
                "notes",
                &[EditOp::create(fields(None, 5)), EditOp::create(fields(Some("Ok"), 6))],
                EditTier::Accepted,
            )
            .await
            .unwrap();

        let report = engine.push(SNAP, &connector, "notes", None).await.unwrap();
        assert_eq!(report.pushed(), 1);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0].error, SyncError::Validation { .. }));
        assert_eq!(report.operations[0].skipped, 1);

        let status = engine.status(SNAP, "notes").await.unwrap();
        assert_eq!(status.dirty.create, 1);
        assert_eq!(connector.records("notes").await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_pushes_take_disjoint_rows() {
        let (engine, connector) = setup(
            MemoryOptions::default()
                .batch_size(5)
                .latency(Duration::from_millis(2)),
            0,
        )
        .await;
        engine.pull(SNAP, &connector, &notes_spec().id, None).await.unwrap();

        let ops: Vec<EditOp> = (0..40)
            .map(|i| EditOp::create(fields(Some(&format!("New {}", i)), i)))
            .collect();
        engine.apply_edit(SNAP, "notes", &ops, EditTier::Accepted).await.unwrap();

        let other = engine.clone();
        let (a, b) = tokio::join!(
            engine.push(SNAP, &connector, "notes", Some(PushOperation::Create)),
            other.push(SNAP, &connector, "notes", Some(PushOperation::Create)),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.pushed() + b.pushed(), 40);
        assert!(!a.has_errors() && !b.has_errors());

        assert_eq!(connector.records("notes").await.len(), 40);
        assert_eq!(engine.status(SNAP, "notes").await.unwrap().dirty.total(), 0);
    }

    #[tokio::test]
    async fn test_push_all_reports_each_table() {
        let (engine, connector) = setup(MemoryOptions::default(), 2).await;
        engine.pull(SNAP, &connector, &notes_spec().id, None).await.unwrap();

        let results = engine
            .push_all(SNAP, &connector, &["notes".to_string(), "missing".to_string()])
            .await;
        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(SyncError::TableNotFound { .. })));
    }

    #[tokio::test]
    async fn test_suggestions_through_engine() {
        let (engine, connector) = setup(MemoryOptions::default(), 1).await;
        engine.pull(SNAP, &connector, &notes_spec().id, None).await.unwrap();
        let ws_id = ws_id_of(&engine, "r0000").await;

        engine
            .apply_edit(
                SNAP,
                "notes",
                &[EditOp::update(&ws_id, fields(Some("Suggested"), 7))],
                EditTier::Suggested,
            )
            .await
            .unwrap();
        let status = engine.status(SNAP, "notes").await.unwrap();
        assert_eq!(status.pending_suggestions, 1);
        assert_eq!(status.dirty.total(), 0);

        let accepted = engine
            .accept_suggestions(SNAP, "notes", &[FieldRef::new(&ws_id, "title")])
            .await
            .unwrap();
        assert_eq!(accepted, 1);
        assert_eq!(engine.reject_all_suggestions(SNAP, "notes").await.unwrap(), 1);

        let record = engine.get_record(SNAP, "notes", &ws_id).await.unwrap().unwrap();
        assert_eq!(record.fields.get("title"), Some(&json!("Suggested")));
        assert_eq!(record.fields.get("views"), Some(&json!(0)));
        assert!(record.dirty);
    }
}
