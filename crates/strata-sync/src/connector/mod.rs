//! # Connectors
//!
//! The contract every external data source implements, plus the built-in
//! implementations and the registry that builds them by service name.
//!
//! ## Capability Set
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         trait Connector                                 │
//! │                                                                         │
//! │  identity     service_name()  display_name()  discovery_mode()         │
//! │  discovery    test_connection()  list_tables()  search_tables()        │
//! │  schema       fetch_table_spec(table) ──► TableSpec (closed PgType set) │
//! │  pull         pull_records(spec, progress, handler)                     │
//! │                 └─► handler.on_batch({records, progress}) per page      │
//! │  push         create_records ──► wsId → remoteId                        │
//! │               update_records / delete_records                           │
//! │               batch_size(operation) ≥ 1                                 │
//! │  errors       classify_error(err) ──► ClassifiedError (never fails)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failing `on_batch` aborts the pull. Batches already handed to the
//! handler stay committed.
//!
//! ## Available Connectors
//!
//! - [`memory`] - In-process source for fixtures, demos and tests
//! - [`json_api`] - Generic REST/JSON source over HTTP
//! - [`registry`] - Service name → factory

pub mod json_api;
pub mod memory;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use strata_core::classify::classify_with;
use strata_core::{
    ClassifiedError, ConnectorError, ConnectorRecord, EntityId, PushOperation, SnapshotRecord,
    TablePreview, TableSpec,
};

/// Result type alias for connector calls.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// How a connector exposes its tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Every table is returned by `list_tables`.
    #[default]
    List,
    /// Tables are found through `search_tables`.
    Search,
}

/// One page of `search_tables` results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSearchPage {
    pub tables: Vec<TablePreview>,
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// One page delivered by a pull.
#[derive(Debug, Clone, PartialEq)]
pub struct PullBatch {
    pub records: Vec<ConnectorRecord>,
    /// Resume point after this batch.
    pub progress: Value,
}

/// Receives pull batches in order.
#[async_trait]
pub trait PullBatchHandler: Send {
    /// Stores one batch. An error stops the pull.
    async fn on_batch(&mut self, batch: PullBatch) -> ConnectorResult<()>;
}

/// An external data source.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Registry key (`memory`, `json_api`, ...).
    fn service_name(&self) -> &str;

    /// Name shown to users in messages.
    fn display_name(&self) -> &str;

    fn discovery_mode(&self) -> DiscoveryMode {
        DiscoveryMode::List
    }

    /// Checks credentials and reachability. No side effects.
    async fn test_connection(&self) -> ConnectorResult<()>;

    async fn list_tables(&self) -> ConnectorResult<Vec<TablePreview>>;

    /// Finds tables by display name.
    ///
    /// The default filters `list_tables` case-insensitively and returns a
    /// single page.
    async fn search_tables(
        &self,
        query: Option<&str>,
        _cursor: Option<&str>,
    ) -> ConnectorResult<TableSearchPage> {
        let needle = query.map(str::to_lowercase).unwrap_or_default();
        let tables = self
            .list_tables()
            .await?
            .into_iter()
            .filter(|t| t.display_name.to_lowercase().contains(&needle))
            .collect();
        Ok(TableSearchPage {
            tables,
            has_more: false,
            next_cursor: None,
        })
    }

    async fn fetch_table_spec(&self, table: &EntityId) -> ConnectorResult<TableSpec>;

    /// Streams the table's records to `handler`, starting after `progress`
    /// (`None` starts from the beginning).
    async fn pull_records(
        &self,
        spec: &TableSpec,
        progress: Option<Value>,
        handler: &mut dyn PullBatchHandler,
    ) -> ConnectorResult<()>;

    /// Largest batch the service accepts for `operation` (at least 1).
    fn batch_size(&self, operation: PushOperation) -> usize;

    /// Creates records; returns wsId → new remote id.
    async fn create_records(
        &self,
        spec: &TableSpec,
        records: &[SnapshotRecord],
    ) -> ConnectorResult<HashMap<String, String>>;

    async fn update_records(&self, spec: &TableSpec, records: &[SnapshotRecord]) -> ConnectorResult<()>;

    async fn delete_records(&self, spec: &TableSpec, records: &[SnapshotRecord]) -> ConnectorResult<()>;

    /// Maps a failure to a user-facing message.
    fn classify_error(&self, error: &ConnectorError) -> ClassifiedError {
        classify_with(self.display_name(), error, |_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::memory::{MemoryConnector, MemoryOptions};

    #[tokio::test]
    async fn test_default_search_filters_by_name() {
        let connector = MemoryConnector::new(MemoryOptions::default());
        connector
            .add_table(TableSpec::new(EntityId::new("posts", vec!["posts".into()]), "Blog Posts", vec![]), vec![])
            .await;
        connector
            .add_table(TableSpec::new(EntityId::new("authors", vec!["authors".into()]), "Authors", vec![]), vec![])
            .await;

        let page = connector.search_tables(Some("POSTS"), None).await.unwrap();
        assert_eq!(page.tables.len(), 1);
        assert_eq!(page.tables[0].display_name, "Blog Posts");
        assert!(!page.has_more);

        let all = connector.search_tables(None, None).await.unwrap();
        assert_eq!(all.tables.len(), 2);
    }
}
