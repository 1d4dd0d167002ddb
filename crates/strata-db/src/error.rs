//! # Database Error Types
//!
//! Error types for snapshot store operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)          Model Error (strata-core)          │
//! │       │                                   │                             │
//! │       └──────────────┬────────────────────┘                             │
//! │                      ▼                                                  │
//! │  DbError (this module) ← Adds context and categorization               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError::Database { table, source } ← Engine adds table identity    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  CLI prints the message and exits non-zero                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use strata_core::{CoreError, ValidationError};
use thiserror::Error;

/// Snapshot store errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Entity not found in database.
    ///
    /// ## When This Occurs
    /// - A record wsId does not exist in the snapshot table
    /// - A snapshot table has not been created yet
    /// - A list cursor names a record that no longer exists
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Unique constraint violation.
    ///
    /// ## When This Occurs
    /// - Two records claim the same remote id
    /// - Creating a record with an existing wsId
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    /// Foreign key constraint violation.
    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation { message: String },

    /// A filter could not be compiled or was rejected by SQLite.
    ///
    /// ## When This Occurs
    /// - The filter names a column that is not part of the table
    /// - An operator is given a value of the wrong shape
    /// - The compiled SQL fails the `LIMIT 0` probe
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// A snapshot or table identifier is not usable as part of a table name.
    #[error("Invalid identifier '{0}': expected [a-z][a-z0-9_]*")]
    InvalidIdentifier(String),

    /// Edit or record rule violation from the model.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Value failed validation against the table spec.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// JSON side-column could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The store could not be opened.
    ///
    /// ## When This Occurs
    /// - The data directory cannot be created
    /// - The file is not a SQLite database or is read-only
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// SQLite gave up waiting for a lock held by another writer.
    ///
    /// ## When This Occurs
    /// - Another process holds a write transaction past `busy_timeout`
    #[error("Snapshot store is busy: {0}")]
    Busy(String),

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a UniqueViolation error.
    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        DbError::UniqueViolation {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Creates an InvalidEdit error for a record.
    pub fn invalid_edit(ws_id: impl Into<String>, reason: impl Into<String>) -> Self {
        DbError::Core(CoreError::InvalidEdit {
            ws_id: ws_id.into(),
            reason: reason.into(),
        })
    }

    /// Returns true if the error is caused by caller input rather than the store.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            DbError::NotFound { .. }
                | DbError::UniqueViolation { .. }
                | DbError::InvalidFilter(_)
                | DbError::InvalidIdentifier(_)
                | DbError::Core(_)
                | DbError::Validation(_)
        )
    }
}

/// Maps sqlx failures onto store errors.
///
/// ```text
/// RowNotFound                         → NotFound
/// UNIQUE on s_<snap>__<table>.<col>   → UniqueViolation { field: "<table>.<col>" }
/// FOREIGN KEY                         → ForeignKeyViolation
/// SQLITE_BUSY / SQLITE_LOCKED         → Busy
/// PoolTimedOut                        → PoolExhausted
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("Record", "unknown"),
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    DbError::duplicate(constraint_target(db_err.message()), "conflicting row")
                } else if db_err.is_foreign_key_violation() {
                    DbError::ForeignKeyViolation {
                        message: db_err.message().to_string(),
                    }
                } else if matches!(db_err.code().as_deref(), Some("5" | "6" | "261" | "517")) {
                    DbError::Busy(db_err.message().to_string())
                } else {
                    DbError::QueryFailed(db_err.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::PoolClosed => DbError::ConnectionFailed("pool is closed".to_string()),
            other => DbError::Internal(other.to_string()),
        }
    }
}

/// `"UNIQUE constraint failed: s_blog__posts.id"` → `"posts.id"`.
fn constraint_target(message: &str) -> String {
    let target = message
        .rsplit(": ")
        .next()
        .unwrap_or(message)
        .split(", ")
        .next()
        .unwrap_or(message);
    match target.split_once("__") {
        Some((_, rest)) => rest.to_string(),
        None => target.to_string(),
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_edit_is_client_error() {
        let err = DbError::invalid_edit("rec_1", "record is deleted");
        assert!(err.is_client_error());
        assert_eq!(err.to_string(), "Invalid edit on rec_1: record is deleted");
    }

    #[test]
    fn test_constraint_target_strips_snapshot_prefix() {
        assert_eq!(
            constraint_target("UNIQUE constraint failed: s_blog__posts.id"),
            "posts.id"
        );
        assert_eq!(
            constraint_target("UNIQUE constraint failed: snapshots.id"),
            "snapshots.id"
        );
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::NotFound { .. }));
        assert!(!DbError::PoolExhausted.is_client_error());
    }
}
