//! # strata-sync: Connectors and Sync Engine for Strata
//!
//! This crate moves records between external services and the snapshot
//! store, and owns the configuration that ties them together.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Strata Sync Layer                                │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      SyncEngine                                  │  │
//! │  │                                                                  │  │
//! │  │  pull  : connector pages ──► transactional upsert + checkpoint   │  │
//! │  │  push  : claimed dirty batches ──► connector ──► write-back      │  │
//! │  │  edits : list / apply / accept / reject (per-table serialized)   │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ ConnectorReg.  │  │  Connectors    │  │   strata-db            │    │
//! │  │                │  │                │  │                        │    │
//! │  │ service name → │  │ memory         │  │ snapshot tables,       │    │
//! │  │ factory        │  │ json_api       │  │ claims, checkpoints    │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`engine`] - `SyncEngine` pull/push orchestration and edit surface
//! - [`connector`] - `Connector` trait, built-in connectors, registry
//! - [`config`] - TOML configuration with environment overrides
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use strata_sync::{ConnectorRegistry, StrataConfig, SyncEngine};
//! use strata_db::Database;
//!
//! let config = StrataConfig::load(None)?;
//! let db = Database::new(config.db_config()).await?;
//! let engine = SyncEngine::new(db, config.sync.clone());
//!
//! let connector = ConnectorRegistry::with_builtins().create(config.connection("blog")?)?;
//! let report = engine.pull("blog", connector.as_ref(), &table_id, None).await?;
//! let pushed = engine.push("blog", connector.as_ref(), "posts", None).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod connector;
pub mod engine;
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{ConnectionConfig, RetrySettings, StrataConfig, SyncSettings};
pub use connector::registry::{ConnectorFactory, ConnectorRegistry};
pub use connector::{
    Connector, ConnectorResult, DiscoveryMode, PullBatch, PullBatchHandler, TableSearchPage,
};
pub use engine::{BatchError, OperationReport, PullReport, PushReport, SyncEngine, TableStatus};
pub use error::{SyncError, SyncResult};
