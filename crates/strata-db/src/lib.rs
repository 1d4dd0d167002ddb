//! # strata-db: Snapshot Store for Strata
//!
//! This crate persists snapshots in SQLite: a small catalog describing which
//! tables exist, one physical table per synced table, and the pull
//! checkpoints that make interrupted pulls resumable.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Strata Data Flow                                 │
//! │                                                                         │
//! │  SyncEngine (pull / edit / push)                                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     strata-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories  │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                │    │  (embedded)  │  │   │
//! │  │   │               │    │ SchemaRepo     │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ RecordRepo     │    │ 001_catalog  │  │   │
//! │  │   │ WAL mode      │    │ ProgressRepo   │    │              │  │   │
//! │  │   └───────────────┘    └────────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  SQLite: catalog tables + s_<snapshot>__<table> per synced table│   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded catalog migrations
//! - [`error`] - Database error types
//! - [`repository`] - Schema, record and checkpoint repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use strata_db::{Database, DbConfig, ListQuery};
//!
//! let db = Database::new(DbConfig::new("snapshots.db")).await?;
//! let tables = db.schema().create_schema("snap1", &specs).await?;
//! let page = db.records().list_records(&tables[0], &ListQuery::default()).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::filter::Filter;
pub use repository::progress::{ProgressRepository, PullCheckpoint};
pub use repository::records::{
    BatchOutcome, ClaimedRecord, DirtyBatchOptions, DirtyBatchRun, DirtyCounts, FailedBatch,
    ListQuery, RecordPage, RecordRepository, UpsertSummary, WriteBack,
};
pub use repository::schema::SchemaRepository;
pub use repository::{physical_table_name, SnapshotTable};
