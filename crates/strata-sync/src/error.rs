//! # Sync Error Types
//!
//! Error types for pull, push and edit operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Connector     │  │     Data                │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Instantiation  │  │  Validation             │ │
//! │  │  InvalidUrl     │  │  Auth           │  │  Reconciliation         │ │
//! │  │  ConfigLoad/Save│  │  Connector      │  │  TableNotFound          │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Database { table, batch, source }  ← store failures carry the  │   │
//! │  │                                       table (and batch) identity│   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use strata_core::{ClassifiedError, ConnectorError, ErrorCategory, ValidationError};
use strata_db::DbError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering every pull, push and edit failure.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A connection URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load the config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save the config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Connector Errors
    // =========================================================================
    /// The connector could not be built.
    ///
    /// ## When This Occurs
    /// - Unknown service name in `[connections.<name>]`
    /// - Missing credentials or base URL
    #[error("Cannot create {service} connector: {reason}")]
    ConnectorInstantiation { service: String, reason: String },

    /// The service rejected the credentials.
    #[error("{service} rejected the credentials: {message}")]
    ConnectorAuth { service: String, message: String },

    /// Any other connector failure.
    #[error("{service} failed: {source}")]
    Connector {
        service: String,
        #[source]
        source: ConnectorError,
    },

    // =========================================================================
    // Data Errors
    // =========================================================================
    /// A record does not satisfy its table spec.
    #[error("Record {ws_id} is invalid: {source}")]
    Validation {
        ws_id: String,
        #[source]
        source: ValidationError,
    },

    /// Local and remote identity could not be matched up.
    ///
    /// ## When This Occurs
    /// - A create push returned no remote id for a record
    /// - A push claim was taken over before write-back
    #[error("Reconciliation failed for {table}: {message}")]
    Reconciliation { table: String, message: String },

    /// The table was never pulled into this snapshot.
    #[error("Table {table} not found in snapshot {snapshot}")]
    TableNotFound { snapshot: String, table: String },

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Snapshot store failure, tagged with the table (and batch) it hit.
    #[error("Store error on {table}{}: {source}", batch_suffix(.batch))]
    Database {
        table: String,
        batch: Option<usize>,
        #[source]
        source: DbError,
    },
}

fn batch_suffix(batch: &Option<usize>) -> String {
    batch.map(|b| format!(" (batch {})", b)).unwrap_or_default()
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

// =============================================================================
// Constructors
// =============================================================================

impl SyncError {
    /// Wraps a store error with the table it happened on.
    pub fn database(table: impl Into<String>, source: DbError) -> Self {
        SyncError::Database {
            table: table.into(),
            batch: None,
            source,
        }
    }

    /// Wraps a store error with the table and batch it happened on.
    pub fn database_batch(table: impl Into<String>, batch: usize, source: DbError) -> Self {
        SyncError::Database {
            table: table.into(),
            batch: Some(batch),
            source,
        }
    }

    /// Lifts a connector failure, splitting out auth and instantiation.
    pub fn connector(service: impl Into<String>, source: ConnectorError) -> Self {
        let service = service.into();
        match source {
            ConnectorError::Unauthorized { message } => SyncError::ConnectorAuth { service, message },
            ConnectorError::Instantiation { service, reason } => {
                SyncError::ConnectorInstantiation { service, reason }
            }
            source => SyncError::Connector { service, source },
        }
    }

    // =========================================================================
    // Error Categorization (for retry logic)
    // =========================================================================

    /// Returns true if the operation can be retried as is.
    ///
    /// ## Retryable Errors
    /// - Connector timeouts, rate limits, network failures, 5xx
    /// - Store pool exhaustion or a busy SQLite lock
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Connector { source, .. } => source.is_retryable(),
            SyncError::Database { source, .. } => {
                matches!(source, DbError::PoolExhausted | DbError::Busy(_))
            }
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
                | SyncError::ConnectorInstantiation { .. }
        )
    }

    /// User-facing view of the error.
    ///
    /// Connector failures go through the connector's own classifier where
    /// one is available; see [`crate::Connector::classify_error`].
    pub fn classified(&self) -> ClassifiedError {
        match self {
            SyncError::ConnectorAuth { service, message } => {
                let source = ConnectorError::Unauthorized {
                    message: message.clone(),
                };
                strata_core::classify::classify_with(service, &source, |_| None)
            }
            SyncError::Connector { service, source } => {
                strata_core::classify::classify_with(service, source, |_| None)
            }
            SyncError::ConnectorInstantiation { service, reason } => ClassifiedError::new(
                ErrorCategory::Configuration,
                format!("The {} connection is not configured correctly.", service),
            )
            .with_description(reason.clone()),
            SyncError::Validation { ws_id, source } => ClassifiedError::new(
                ErrorCategory::Service,
                "Some records are not valid for this table and were not pushed.",
            )
            .with_description(format!("{}: {}", ws_id, source)),
            other if other.is_config_error() => {
                ClassifiedError::new(ErrorCategory::Configuration, "Strata is not configured correctly.")
                    .with_description(other.to_string())
            }
            other => ClassifiedError::new(ErrorCategory::Unknown, "Something went wrong while syncing.")
                .with_description(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        let timeout = SyncError::connector(
            "Blog",
            ConnectorError::Timeout {
                message: "30s".into(),
            },
        );
        assert!(timeout.is_retryable());
        assert!(SyncError::database("snap/posts", DbError::PoolExhausted).is_retryable());

        let auth = SyncError::connector(
            "Blog",
            ConnectorError::Unauthorized {
                message: "bad key".into(),
            },
        );
        assert!(matches!(auth, SyncError::ConnectorAuth { .. }));
        assert!(!auth.is_retryable());
        assert!(!SyncError::InvalidConfig("zero batch".into()).is_retryable());
    }

    #[test]
    fn test_config_errors() {
        let err = SyncError::connector(
            "registry",
            ConnectorError::Instantiation {
                service: "notion".into(),
                reason: "unknown service".into(),
            },
        );
        assert!(err.is_config_error());
        assert_eq!(err.classified().category, ErrorCategory::Configuration);
    }

    #[test]
    fn test_classified_views() {
        let auth = SyncError::ConnectorAuth {
            service: "Blog".into(),
            message: "expired".into(),
        };
        let classified = auth.classified();
        assert_eq!(classified.category, ErrorCategory::Unauthorized);
        assert!(classified.user_friendly_message.contains("Blog"));

        let store = SyncError::database_batch("snap/posts", 3, DbError::Internal("boom".into()));
        assert!(store.to_string().contains("batch 3"));
        assert_eq!(store.classified().category, ErrorCategory::Unknown);
    }
}
