//! # Memory Connector
//!
//! An in-process data source. Used for fixtures, demos and tests.
//!
//! ## Knobs
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  page_size              records per pull batch                          │
//! │  create/update/delete   batch sizes reported by batch_size()            │
//! │  latency                sleep before every call                         │
//! │  fail_after_batches     one-shot: the next pull fails after N batches   │
//! │  fail_next(op, err)     one-shot: the next push of `op` fails           │
//! │  call_log()             every call, in order                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Records are kept per table ordered by remote id; pull progress is
//! `{"offset": n}`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use strata_core::{
    ConnectorError, ConnectorRecord, EntityId, PushOperation, SnapshotRecord, TablePreview,
    TableSpec,
};
use tokio::sync::Mutex;
use tracing::debug;

use super::{Connector, ConnectorResult, PullBatch, PullBatchHandler};

pub const SERVICE_NAME: &str = "memory";

/// Configuration of a [`MemoryConnector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryOptions {
    pub page_size: usize,
    pub create_batch_size: usize,
    pub update_batch_size: usize,
    pub delete_batch_size: usize,
    pub latency: Duration,
    pub fail_after_batches: Option<usize>,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        MemoryOptions {
            page_size: 100,
            create_batch_size: 10,
            update_batch_size: 10,
            delete_batch_size: 10,
            latency: Duration::ZERO,
            fail_after_batches: None,
        }
    }
}

impl MemoryOptions {
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Sets the same batch size for all three push operations.
    pub fn batch_size(mut self, size: usize) -> Self {
        let size = size.max(1);
        self.create_batch_size = size;
        self.update_batch_size = size;
        self.delete_batch_size = size;
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fail_after_batches(mut self, batches: usize) -> Self {
        self.fail_after_batches = Some(batches);
        self
    }
}

/// One recorded connector call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryCall {
    TestConnection,
    ListTables,
    FetchTableSpec { table: String },
    PullBatch { table: String, offset: usize, count: usize },
    Create { table: String, count: usize },
    Update { table: String, count: usize },
    Delete { table: String, count: usize },
}

impl MemoryCall {
    /// True for create/update/delete calls.
    pub fn is_push(&self) -> bool {
        matches!(
            self,
            MemoryCall::Create { .. } | MemoryCall::Update { .. } | MemoryCall::Delete { .. }
        )
    }
}

#[derive(Debug, Default)]
struct MemoryTable {
    spec: Option<TableSpec>,
    rows: BTreeMap<String, ConnectorRecord>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    calls: Vec<MemoryCall>,
    next_id: u64,
    fail_after_batches: Option<usize>,
    push_failures: HashMap<PushOperation, ConnectorError>,
}

/// Fixture file layout accepted by [`MemoryConnector::load_fixture`].
#[derive(Debug, Deserialize)]
struct Fixture {
    tables: Vec<FixtureTable>,
}

#[derive(Debug, Deserialize)]
struct FixtureTable {
    spec: TableSpec,
    #[serde(default)]
    records: Vec<ConnectorRecord>,
}

/// In-process connector.
#[derive(Debug)]
pub struct MemoryConnector {
    options: MemoryOptions,
    state: Mutex<MemoryState>,
}

impl MemoryConnector {
    pub fn new(options: MemoryOptions) -> Self {
        let state = MemoryState {
            fail_after_batches: options.fail_after_batches,
            ..Default::default()
        };
        MemoryConnector {
            options,
            state: Mutex::new(state),
        }
    }

    /// Reads tables and records from a JSON fixture file.
    ///
    /// ```json
    /// { "tables": [ { "spec": { ...TableSpec... }, "records": [ { "id": "1", "fields": {...} } ] } ] }
    /// ```
    pub fn load_fixture(options: MemoryOptions, path: &Path) -> ConnectorResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConnectorError::Instantiation {
            service: SERVICE_NAME.to_string(),
            reason: format!("cannot read fixture {}: {}", path.display(), e),
        })?;
        let fixture: Fixture =
            serde_json::from_str(&contents).map_err(|e| ConnectorError::Instantiation {
                service: SERVICE_NAME.to_string(),
                reason: format!("invalid fixture {}: {}", path.display(), e),
            })?;

        let mut state = MemoryState {
            fail_after_batches: options.fail_after_batches,
            ..Default::default()
        };
        for table in fixture.tables {
            let entry = state.tables.entry(table.spec.ws_id().to_string()).or_default();
            entry.rows = table
                .records
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect();
            entry.spec = Some(table.spec);
        }
        Ok(MemoryConnector {
            options,
            state: Mutex::new(state),
        })
    }

    /// Adds (or replaces) a table and its records.
    pub async fn add_table(&self, spec: TableSpec, records: Vec<ConnectorRecord>) {
        let mut state = self.state.lock().await;
        let table = state.tables.entry(spec.ws_id().to_string()).or_default();
        table.rows = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        table.spec = Some(spec);
    }

    /// Replaces one record at the source.
    pub async fn put_record(&self, table: &str, record: ConnectorRecord) {
        let mut state = self.state.lock().await;
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .rows
            .insert(record.id.clone(), record);
    }

    /// Current records of a table, ordered by remote id.
    pub async fn records(&self, table: &str) -> Vec<ConnectorRecord> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every call made so far.
    pub async fn call_log(&self) -> Vec<MemoryCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn clear_call_log(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Makes the next pull fail after delivering `batches` batches.
    pub async fn fail_pull_after(&self, batches: usize) {
        self.state.lock().await.fail_after_batches = Some(batches);
    }

    /// Makes the next push of `operation` fail with `error`.
    pub async fn fail_next(&self, operation: PushOperation, error: ConnectorError) {
        self.state.lock().await.push_failures.insert(operation, error);
    }

    async fn simulate_latency(&self) {
        if !self.options.latency.is_zero() {
            tokio::time::sleep(self.options.latency).await;
        }
    }

    async fn record_call(&self, call: MemoryCall) {
        self.state.lock().await.calls.push(call);
    }

    async fn take_push_failure(&self, operation: PushOperation) -> ConnectorResult<()> {
        match self.state.lock().await.push_failures.remove(&operation) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn not_found(what: &str, id: &str) -> ConnectorError {
    ConnectorError::Http {
        status: 404,
        body: format!("{} '{}' not found", what, id),
    }
}

fn offset_of(progress: Option<&Value>) -> ConnectorResult<usize> {
    match progress {
        None | Some(Value::Null) => Ok(0),
        Some(value) => value
            .get("offset")
            .and_then(Value::as_u64)
            .map(|o| o as usize)
            .ok_or_else(|| ConnectorError::InvalidResponse {
                reason: format!("unrecognized pull progress: {}", value),
            }),
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn service_name(&self) -> &str {
        SERVICE_NAME
    }

    fn display_name(&self) -> &str {
        "Memory"
    }

    async fn test_connection(&self) -> ConnectorResult<()> {
        self.simulate_latency().await;
        self.record_call(MemoryCall::TestConnection).await;
        Ok(())
    }

    async fn list_tables(&self) -> ConnectorResult<Vec<TablePreview>> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;
        state.calls.push(MemoryCall::ListTables);
        Ok(state
            .tables
            .values()
            .filter_map(|t| t.spec.as_ref())
            .map(|spec| TablePreview {
                id: spec.id.clone(),
                display_name: spec.name.clone(),
            })
            .collect())
    }

    async fn fetch_table_spec(&self, table: &EntityId) -> ConnectorResult<TableSpec> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;
        state.calls.push(MemoryCall::FetchTableSpec {
            table: table.ws_id.clone(),
        });
        state
            .tables
            .get(&table.ws_id)
            .and_then(|t| t.spec.clone())
            .ok_or_else(|| not_found("table", &table.ws_id))
    }

    async fn pull_records(
        &self,
        spec: &TableSpec,
        progress: Option<Value>,
        handler: &mut dyn PullBatchHandler,
    ) -> ConnectorResult<()> {
        let table = spec.ws_id().to_string();
        let mut offset = offset_of(progress.as_ref())?;
        let page_size = self.options.page_size.max(1);
        let mut delivered = 0usize;

        loop {
            self.simulate_latency().await;

            let (records, fail_now) = {
                let mut state = self.state.lock().await;
                let fail_now = state.fail_after_batches == Some(delivered);
                if fail_now {
                    state.fail_after_batches = None;
                }
                let records: Vec<ConnectorRecord> = state
                    .tables
                    .get(&table)
                    .ok_or_else(|| not_found("table", &table))?
                    .rows
                    .values()
                    .skip(offset)
                    .take(page_size)
                    .cloned()
                    .collect();
                if !fail_now {
                    state.calls.push(MemoryCall::PullBatch {
                        table: table.clone(),
                        offset,
                        count: records.len(),
                    });
                }
                (records, fail_now)
            };

            if fail_now {
                return Err(ConnectorError::Network {
                    message: format!("injected failure after {} batches", delivered),
                });
            }
            if records.is_empty() {
                return Ok(());
            }

            let count = records.len();
            offset += count;
            debug!(table = %table, offset, count, "Memory pull batch");
            handler
                .on_batch(PullBatch {
                    records,
                    progress: json!({ "offset": offset }),
                })
                .await?;
            delivered += 1;

            if count < page_size {
                return Ok(());
            }
        }
    }

    fn batch_size(&self, operation: PushOperation) -> usize {
        match operation {
            PushOperation::Create => self.options.create_batch_size,
            PushOperation::Update => self.options.update_batch_size,
            PushOperation::Delete => self.options.delete_batch_size,
        }
        .max(1)
    }

    async fn create_records(
        &self,
        spec: &TableSpec,
        records: &[SnapshotRecord],
    ) -> ConnectorResult<HashMap<String, String>> {
        self.simulate_latency().await;
        let table = spec.ws_id().to_string();
        self.record_call(MemoryCall::Create {
            table: table.clone(),
            count: records.len(),
        })
        .await;
        self.take_push_failure(PushOperation::Create).await?;

        let mut state = self.state.lock().await;
        let mut created = HashMap::with_capacity(records.len());
        for record in records {
            state.next_id += 1;
            let remote_id = format!("{}_{:06}", table, state.next_id);
            let row = ConnectorRecord::new(remote_id.clone(), record.push_fields());
            state
                .tables
                .entry(table.clone())
                .or_default()
                .rows
                .insert(remote_id.clone(), row);
            created.insert(record.id.ws_id.clone(), remote_id);
        }
        Ok(created)
    }

    async fn update_records(&self, spec: &TableSpec, records: &[SnapshotRecord]) -> ConnectorResult<()> {
        self.simulate_latency().await;
        let table = spec.ws_id().to_string();
        self.record_call(MemoryCall::Update {
            table: table.clone(),
            count: records.len(),
        })
        .await;
        self.take_push_failure(PushOperation::Update).await?;

        let mut state = self.state.lock().await;
        let rows = &mut state
            .tables
            .get_mut(&table)
            .ok_or_else(|| not_found("table", &table))?
            .rows;

        // Resolve every id first so a bad batch changes nothing.
        for record in records {
            let remote_id = record.id.remote_id.as_deref().unwrap_or_default();
            if !rows.contains_key(remote_id) {
                return Err(not_found("record", remote_id));
            }
        }
        for record in records {
            let remote_id = record.id.remote_id.as_deref().unwrap_or_default();
            if let Some(row) = rows.get_mut(remote_id) {
                row.fields.extend(record.push_fields());
            }
        }
        Ok(())
    }

    async fn delete_records(&self, spec: &TableSpec, records: &[SnapshotRecord]) -> ConnectorResult<()> {
        self.simulate_latency().await;
        let table = spec.ws_id().to_string();
        self.record_call(MemoryCall::Delete {
            table: table.clone(),
            count: records.len(),
        })
        .await;
        self.take_push_failure(PushOperation::Delete).await?;

        let mut state = self.state.lock().await;
        if let Some(t) = state.tables.get_mut(&table) {
            for record in records {
                if let Some(remote_id) = &record.id.remote_id {
                    t.rows.remove(remote_id);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{ColumnSpec, FieldMap, PgType};

    struct Collect(Vec<PullBatch>);

    #[async_trait]
    impl PullBatchHandler for Collect {
        async fn on_batch(&mut self, batch: PullBatch) -> ConnectorResult<()> {
            self.0.push(batch);
            Ok(())
        }
    }

    fn spec() -> TableSpec {
        TableSpec::new(
            EntityId::new("notes", vec!["notes".into()]),
            "Notes",
            vec![ColumnSpec::new(EntityId::new("body", vec!["body".into()]), "Body", PgType::Text)],
        )
    }

    fn rows(n: usize) -> Vec<ConnectorRecord> {
        (0..n)
            .map(|i| {
                let mut fields = FieldMap::new();
                fields.insert("body".into(), json!(format!("note {}", i)));
                ConnectorRecord::new(format!("n{:04}", i), fields)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_pull_pages_and_resume() {
        let connector = MemoryConnector::new(MemoryOptions::default().page_size(4));
        connector.add_table(spec(), rows(10)).await;

        let mut all = Collect(Vec::new());
        connector.pull_records(&spec(), None, &mut all).await.unwrap();
        assert_eq!(all.0.len(), 3);
        assert_eq!(all.0[2].records.len(), 2);
        assert_eq!(all.0[2].progress, json!({ "offset": 10 }));

        let mut rest = Collect(Vec::new());
        connector
            .pull_records(&spec(), Some(json!({ "offset": 8 })), &mut rest)
            .await
            .unwrap();
        assert_eq!(rest.0.len(), 1);
        assert_eq!(rest.0[0].records[0].id, "n0008");
    }

    #[tokio::test]
    async fn test_injected_pull_failure_is_one_shot() {
        let connector =
            MemoryConnector::new(MemoryOptions::default().page_size(4).fail_after_batches(1));
        connector.add_table(spec(), rows(10)).await;

        let mut first = Collect(Vec::new());
        let err = connector.pull_records(&spec(), None, &mut first).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(first.0.len(), 1);

        let mut second = Collect(Vec::new());
        connector
            .pull_records(&spec(), Some(first.0[0].progress.clone()), &mut second)
            .await
            .unwrap();
        assert_eq!(second.0.len(), 2);
    }

    #[tokio::test]
    async fn test_push_failure_injection_and_call_log() {
        let connector = MemoryConnector::new(MemoryOptions::default());
        connector.add_table(spec(), rows(1)).await;
        connector
            .fail_next(PushOperation::Delete, ConnectorError::unknown("nope"))
            .await;

        assert!(connector.delete_records(&spec(), &[]).await.is_err());
        assert!(connector.delete_records(&spec(), &[]).await.is_ok());

        let log = connector.call_log().await;
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(MemoryCall::is_push));
        assert_eq!(connector.batch_size(PushOperation::Create), 10);
    }
}
