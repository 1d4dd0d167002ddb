//! # CLI Error Type
//!
//! Unified error type for `strata` subcommands.
//!
//! ## Error Handling Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Flow in strata-cli                             │
//! │                                                                         │
//! │  Subcommand                                                             │
//! │  Result<(), CliError>                                                   │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  SyncError? ─── classified() ── category ──► ErrorCode ──┐             │
//! │         │                                                 │             │
//! │         ▼                                                 ▼             │
//! │  Bad argument? ───────────── ErrorCode::InvalidInput ── CliError       │
//! │                                                           │             │
//! │                                                           ▼             │
//! │                                  stderr: "error[CODE]: message"         │
//! │                                  exit status: ErrorCode::exit_code()    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::Serialize;
use strata_core::{ClassifiedError, ErrorCategory};
use strata_db::DbError;
use strata_sync::SyncError;

/// Error returned from a subcommand.
///
/// ## Serialization
/// With `--json` this is what lands on stderr:
/// ```json
/// {
///   "code": "UNAUTHORIZED",
///   "message": "Blog rejected the credentials. Check the API key.",
///   "description": "token expired"
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CliError {
    /// Machine-readable error code for job schedulers
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Error codes, one exit status each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Bad flag value or malformed JSON argument
    InvalidInput,

    /// Snapshot, table or record does not exist
    NotFound,

    /// Config file or connection settings are wrong
    Configuration,

    /// The remote service rejected the credentials
    Unauthorized,

    /// Timeouts, rate limits, network failures; retrying later may succeed
    Transient,

    /// The remote service refused the request
    Remote,

    /// Some push batches failed; the rows stay dirty
    PartialFailure,

    /// Snapshot store failure
    Store,

    Internal,
}

impl ErrorCode {
    /// Process exit status (sysexits-style where one fits).
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorCode::InvalidInput => 2,
            ErrorCode::NotFound => 3,
            ErrorCode::PartialFailure => 4,
            ErrorCode::Remote => 5,
            ErrorCode::Unauthorized => 77,
            ErrorCode::Configuration => 78,
            ErrorCode::Transient => 75,
            ErrorCode::Store => 74,
            ErrorCode::Internal => 70,
        }
    }
}

impl CliError {
    /// Creates a new CLI error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        CliError {
            code,
            message: message.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Creates an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        CliError::new(ErrorCode::InvalidInput, message)
    }

    /// Creates a not found error.
    pub fn not_found(resource: &str, id: &str) -> Self {
        CliError::new(ErrorCode::NotFound, format!("{} not found: {}", resource, id))
    }

    /// Builds the error from a classified view.
    pub fn from_classified(classified: ClassifiedError) -> Self {
        let code = match classified.category {
            ErrorCategory::Unauthorized => ErrorCode::Unauthorized,
            ErrorCategory::Timeout | ErrorCategory::RateLimited | ErrorCategory::Connectivity => {
                ErrorCode::Transient
            }
            ErrorCategory::Configuration => ErrorCode::Configuration,
            ErrorCategory::ResponseTooLarge | ErrorCategory::Service => ErrorCode::Remote,
            ErrorCategory::Unknown => ErrorCode::Internal,
        };
        CliError {
            code,
            message: classified.user_friendly_message,
            description: classified.description,
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error[{}]: {}", self.code_name(), self.message)?;
        if let Some(description) = &self.description {
            write!(f, "\n  {}", description)?;
        }
        Ok(())
    }
}

impl CliError {
    fn code_name(&self) -> String {
        serde_json::to_value(self.code)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self.code))
    }
}

impl std::error::Error for CliError {}

/// Converts sync errors to CLI errors.
impl From<SyncError> for CliError {
    fn from(err: SyncError) -> Self {
        match &err {
            SyncError::TableNotFound { snapshot, table } => {
                CliError::not_found("Table", &format!("{}/{}", snapshot, table))
            }
            SyncError::Database { source, .. } => match source {
                DbError::NotFound { entity, id } => CliError::not_found(entity, id),
                DbError::Validation(_) | DbError::InvalidFilter(_) | DbError::Core(_) => {
                    CliError::invalid_input(source.to_string())
                }
                DbError::UniqueViolation { .. } | DbError::InvalidIdentifier(_) => {
                    CliError::invalid_input(source.to_string())
                }
                DbError::PoolExhausted | DbError::Busy(_) => {
                    CliError::new(ErrorCode::Transient, "Snapshot store is busy")
                }
                _ => {
                    tracing::error!(error = %err, "Snapshot store failure");
                    CliError::new(ErrorCode::Store, "Snapshot store operation failed")
                        .with_description(err.to_string())
                }
            },
            _ => CliError::from_classified(err.classified()),
        }
    }
}

/// Converts store errors raised while opening the database.
impl From<DbError> for CliError {
    fn from(err: DbError) -> Self {
        CliError::from(SyncError::database("catalog", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::ConnectorError;

    #[test]
    fn test_connector_errors_map_to_codes() {
        let auth = CliError::from(SyncError::connector(
            "Blog",
            ConnectorError::Unauthorized {
                message: "expired".into(),
            },
        ));
        assert_eq!(auth.code, ErrorCode::Unauthorized);
        assert_eq!(auth.code.exit_code(), 77);

        let limited = CliError::from(SyncError::connector(
            "Blog",
            ConnectorError::RateLimited {
                retry_after_secs: Some(3),
            },
        ));
        assert_eq!(limited.code, ErrorCode::Transient);
    }

    #[test]
    fn test_store_errors_map_to_codes() {
        let missing = CliError::from(SyncError::database(
            "blog/posts",
            DbError::NotFound {
                entity: "Record".into(),
                id: "rec_1".into(),
            },
        ));
        assert_eq!(missing.code, ErrorCode::NotFound);
        assert_eq!(missing.message, "Record not found: rec_1");

        let broken = CliError::from(DbError::Internal("disk full".into()));
        assert_eq!(broken.code, ErrorCode::Store);
        assert!(broken.description.unwrap().contains("disk full"));
    }

    #[test]
    fn test_display_includes_code() {
        let err = CliError::invalid_input("--limit must be positive").with_description("got 0");
        assert_eq!(
            err.to_string(),
            "error[INVALID_INPUT]: --limit must be positive\n  got 0"
        );
    }
}
