//! # strata-core: Pure Snapshot Model for Strata
//!
//! This crate holds everything about snapshots that can be expressed without
//! I/O: identities, the normalized schema, records and their edit metadata,
//! edit operations, validation and the connector error classifier.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Strata Architecture                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    strata-cli (job runner)                      │   │
//! │  │        tables ──► pull ──► records / edit ──► push              │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              strata-sync (connectors + engine)                  │   │
//! │  └──────────────┬──────────────────────────────┬───────────────────┘   │
//! │                 │                              │                        │
//! │  ┌──────────────▼──────────────────┐  ┌────────▼──────────────────┐   │
//! │  │  ★ strata-core (THIS CRATE) ★   │◄─│  strata-db (SQLite store) │   │
//! │  │                                 │  └───────────────────────────┘   │
//! │  │  ids · schema · record · edit   │                                   │
//! │  │  validation · classify          │                                   │
//! │  │  richtext                       │                                   │
//! │  │                                 │                                   │
//! │  │  NO I/O • NO DATABASE • NO NET  │                                   │
//! │  └─────────────────────────────────┘                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ids`] - wsId / remoteId identity, slugs, placeholder ids
//! - [`schema`] - `TableSpec`, `ColumnSpec`, `PgType`
//! - [`record`] - `SnapshotRecord`, `EditedFields`, `SuggestedValues`
//! - [`edit`] - Edit operations and tiers
//! - [`validation`] - Value and record validation against a `TableSpec`
//! - [`classify`] - `ConnectorError` and the user-facing error classifier
//! - [`richtext`] - Rich-text conversion collaborator
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use strata_core::{ColumnSpec, EntityId, PgType, TableSpec};
//!
//! let spec = TableSpec::new(
//!     EntityId::from_name("Blog Posts", vec!["posts".into()]),
//!     "Blog Posts",
//!     vec![ColumnSpec::new(EntityId::from_name("Title", vec!["t".into()]), "Title", PgType::Text)],
//! );
//! assert_eq!(spec.slug, "blog_posts");
//! assert!(spec.validate().is_ok());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod classify;
pub mod edit;
pub mod error;
pub mod ids;
pub mod record;
pub mod richtext;
pub mod schema;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use classify::{ClassifiedError, ConnectorError, ErrorCategory};
pub use edit::{EditOp, EditOutcome, EditTier};
pub use error::{CoreError, CoreResult, ValidationError};
pub use ids::{EntityId, RecordId};
pub use record::{
    ConnectorRecord, EditedFields, FieldMap, FieldRef, PushOperation, SnapshotRecord,
    SuggestedValues, CREATED_MARKER, DELETED_MARKER,
};
pub use schema::{ColumnMetadata, ColumnSpec, PgType, TablePreview, TableSpec};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Largest batch the engine will hand a connector, whatever it reports.
pub const MAX_PUSH_BATCH_SIZE: usize = 100;

/// Default page size for record listing.
pub const DEFAULT_LIST_LIMIT: u32 = 100;
