//! # Error Types
//!
//! Domain-specific error types for strata-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  strata-core errors (this file)                                        │
//! │  ├── CoreError        - Record/edit rule violations                     │
//! │  └── ValidationError  - Schema and value validation failures            │
//! │                                                                         │
//! │  strata-core connector errors (classify.rs)                            │
//! │  └── ConnectorError   - Typed transport/service failures                │
//! │                                                                         │
//! │  strata-db errors (separate crate)                                     │
//! │  └── DbError          - Store failures                                  │
//! │                                                                         │
//! │  strata-sync errors (separate crate)                                   │
//! │  └── SyncError        - What callers see (with classified message)      │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → DbError → SyncError → Caller       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::schema::PgType;

// =============================================================================
// Core Error
// =============================================================================

/// Record and edit rule violations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A record expected in a snapshot table does not exist.
    ///
    /// ## When This Occurs
    /// - The record was deleted concurrently (push or local delete)
    /// - An edit references a wsId that was never created
    #[error("Record {ws_id} not found in table {table}")]
    RecordNotFound { table: String, ws_id: String },

    /// An edit operation cannot be applied in the record's current state.
    ///
    /// ## When This Occurs
    /// - Creating a record with a wsId that already exists
    /// - Updating a record that is marked deleted
    #[error("Invalid edit on {ws_id}: {reason}")]
    InvalidEdit { ws_id: String, reason: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Schema and value validation failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// A required field is missing or null.
    #[error("{field} is required")]
    Required { field: String },

    /// Value does not match the column's type.
    #[error("{field} expects {expected}, got {found}")]
    TypeMismatch {
        field: String,
        expected: PgType,
        found: String,
    },

    /// Invalid format (e.g., unparsable timestamp).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Column is read-only and cannot be edited or pushed.
    #[error("{field} is read-only")]
    ReadOnly { field: String },

    /// Field does not exist in the table spec.
    #[error("{field} is not a column of this table")]
    UnknownColumn { field: String },

    /// Identifier is not a valid wsId slug.
    #[error("'{value}' is not a valid identifier (expected [a-z][a-z0-9_]*)")]
    InvalidSlug { value: String },

    /// Identifier collides with a store-reserved column.
    #[error("'{name}' is a reserved column name")]
    ReservedName { name: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },

    /// Duplicate value (e.g., duplicate column wsId).
    #[error("{field} '{value}' already exists")]
    Duplicate { field: String, value: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::RecordNotFound {
            table: "posts".to_string(),
            ws_id: "rec_1".to_string(),
        };
        assert_eq!(err.to_string(), "Record rec_1 not found in table posts");

        let err = ValidationError::TypeMismatch {
            field: "price".to_string(),
            expected: PgType::Numeric,
            found: "string".to_string(),
        };
        assert_eq!(err.to_string(), "price expects NUMERIC, got string");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "title".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
