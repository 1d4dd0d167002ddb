//! # Error Classifier
//!
//! Maps raw connector failures to messages a user can act on.
//!
//! ## Classification Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   ConnectorError                                                        │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   1. Transport categories                                               │
//! │      401/403 ─────────► Unauthorized                                    │
//! │      408/504/timeout ─► Timeout                                         │
//! │      413/too large ───► ResponseTooLarge                                │
//! │      429 ─────────────► RateLimited                                     │
//! │        │ (no match)                                                     │
//! │        ▼                                                                │
//! │   2. Connector-specific parser (optional closure)                       │
//! │        │ (no match)                                                     │
//! │        ▼                                                                │
//! │   3. Generic template naming the service                                │
//! │                                                                         │
//! │   Never fails: every input yields a ClassifiedError.                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use ts_rs::TS;

// =============================================================================
// ConnectorError
// =============================================================================

/// Typed failure raised by a connector.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectorError {
    /// Credentials were rejected by the service.
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// The request did not complete in time.
    #[error("Request timed out: {message}")]
    Timeout { message: String },

    /// The service refused or could not return a payload of this size.
    #[error("Response too large: {message}")]
    ResponseTooLarge { message: String },

    /// The service is throttling requests.
    #[error("Rate limited by service")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Non-success HTTP status not covered by a more specific variant.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Connection could not be established.
    #[error("Network error: {message}")]
    Network { message: String },

    /// The connector could not be built from its configuration.
    ///
    /// ## When This Occurs
    /// - Missing or malformed credentials
    /// - Unknown service key in the registry
    #[error("Cannot instantiate {service} connector: {reason}")]
    Instantiation { service: String, reason: String },

    /// The connector does not support the requested capability.
    #[error("{operation} is not supported by this connector")]
    Unsupported { operation: String },

    /// A pull was stopped because the batch callback failed.
    #[error("Pull aborted: {reason}")]
    Aborted { reason: String },

    /// The service answered with something the connector cannot parse.
    #[error("Invalid response: {reason}")]
    InvalidResponse { reason: String },

    #[error("{message}")]
    Unknown { message: String },
}

impl ConnectorError {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ConnectorError::Http { status, .. } => Some(*status),
            ConnectorError::Unauthorized { .. } => Some(401),
            ConnectorError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Transient failures a caller may retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectorError::Timeout { .. }
            | ConnectorError::RateLimited { .. }
            | ConnectorError::Network { .. } => true,
            ConnectorError::Http { status, .. } => *status >= 500 || *status == 408,
            _ => false,
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        ConnectorError::Unknown {
            message: message.into(),
        }
    }
}

// =============================================================================
// ClassifiedError
// =============================================================================

/// Coarse bucket a classified error falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum ErrorCategory {
    Unauthorized,
    Timeout,
    ResponseTooLarge,
    RateLimited,
    Connectivity,
    Configuration,
    Service,
    Unknown,
}

/// What the caller shows the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub user_friendly_message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl ClassifiedError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        ClassifiedError {
            category,
            user_friendly_message: message.into(),
            description: None,
            context: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{} ({})", self.user_friendly_message, description),
            None => f.write_str(&self.user_friendly_message),
        }
    }
}

// =============================================================================
// Classification
// =============================================================================

fn mentions_too_large(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("too large") || lower.contains("body limit") || lower.contains("payload size")
}

/// Step 1: transport-level categories shared by every connector.
pub fn classify_transport(service: &str, error: &ConnectorError) -> Option<ClassifiedError> {
    let classified = match error {
        ConnectorError::Unauthorized { message } => ClassifiedError::new(
            ErrorCategory::Unauthorized,
            format!("{} rejected the credentials. Reconnect the account and try again.", service),
        )
        .with_description(message.clone()),

        ConnectorError::Timeout { message } => ClassifiedError::new(
            ErrorCategory::Timeout,
            format!("{} took too long to respond. Try again in a moment.", service),
        )
        .with_description(message.clone()),

        ConnectorError::ResponseTooLarge { message } => ClassifiedError::new(
            ErrorCategory::ResponseTooLarge,
            format!("{} returned more data than can be handled in one request.", service),
        )
        .with_description(message.clone()),

        ConnectorError::RateLimited { retry_after_secs } => {
            let classified = ClassifiedError::new(
                ErrorCategory::RateLimited,
                format!("{} is limiting requests. Wait a little and retry.", service),
            );
            match retry_after_secs {
                Some(secs) => classified.with_context(json!({ "retryAfterSecs": secs })),
                None => classified,
            }
        }

        ConnectorError::Http { status, body } => {
            let category = match *status {
                401 | 403 => ErrorCategory::Unauthorized,
                408 | 504 => ErrorCategory::Timeout,
                413 => ErrorCategory::ResponseTooLarge,
                429 => ErrorCategory::RateLimited,
                _ if mentions_too_large(body) => ErrorCategory::ResponseTooLarge,
                _ => return None,
            };
            // Same wording as the typed variants above.
            let mut classified = match category {
                ErrorCategory::Unauthorized => classify_transport(
                    service,
                    &ConnectorError::Unauthorized {
                        message: body.clone(),
                    },
                ),
                ErrorCategory::Timeout => classify_transport(
                    service,
                    &ConnectorError::Timeout {
                        message: body.clone(),
                    },
                ),
                ErrorCategory::ResponseTooLarge => classify_transport(
                    service,
                    &ConnectorError::ResponseTooLarge {
                        message: body.clone(),
                    },
                ),
                _ => classify_transport(
                    service,
                    &ConnectorError::RateLimited {
                        retry_after_secs: None,
                    },
                ),
            }?;
            classified.context = Some(json!({ "status": status }));
            classified
        }

        ConnectorError::Network { message } => ClassifiedError::new(
            ErrorCategory::Connectivity,
            format!("Could not reach {}. Check the network connection.", service),
        )
        .with_description(message.clone()),

        ConnectorError::Instantiation { reason, .. } => ClassifiedError::new(
            ErrorCategory::Configuration,
            format!("The {} connection is not configured correctly.", service),
        )
        .with_description(reason.clone()),

        _ => return None,
    };
    Some(classified)
}

/// Step 3: the fallback message naming the service.
pub fn classify_generic(service: &str, error: &ConnectorError) -> ClassifiedError {
    ClassifiedError::new(
        ErrorCategory::Unknown,
        format!("Something went wrong while talking to {}.", service),
    )
    .with_description(error.to_string())
}

/// Runs the full pipeline with an optional connector-specific parser.
///
/// ## Example
/// ```rust
/// use strata_core::classify::{classify_with, ConnectorError, ErrorCategory};
///
/// let err = ConnectorError::Http { status: 401, body: "bad token".into() };
/// let classified = classify_with("Webflow", &err, |_| None);
/// assert_eq!(classified.category, ErrorCategory::Unauthorized);
/// assert!(classified.user_friendly_message.contains("Webflow"));
/// ```
pub fn classify_with<F>(service: &str, error: &ConnectorError, specific: F) -> ClassifiedError
where
    F: FnOnce(&ConnectorError) -> Option<ClassifiedError>,
{
    classify_transport(service, error)
        .or_else(|| specific(error))
        .unwrap_or_else(|| classify_generic(service, error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_status_mapping() {
        let cases = [
            (401, ErrorCategory::Unauthorized),
            (403, ErrorCategory::Unauthorized),
            (408, ErrorCategory::Timeout),
            (504, ErrorCategory::Timeout),
            (413, ErrorCategory::ResponseTooLarge),
            (429, ErrorCategory::RateLimited),
        ];
        for (status, expected) in cases {
            let err = ConnectorError::Http {
                status,
                body: String::new(),
            };
            let classified = classify_with("Blog", &err, |_| None);
            assert_eq!(classified.category, expected, "status {}", status);
            assert_eq!(classified.context, Some(json!({ "status": status })));
        }
    }

    #[test]
    fn test_body_too_large_without_413() {
        let err = ConnectorError::Http {
            status: 400,
            body: "Request body too large".into(),
        };
        assert_eq!(
            classify_with("Blog", &err, |_| None).category,
            ErrorCategory::ResponseTooLarge
        );
    }

    #[test]
    fn test_specific_parser_runs_before_generic() {
        let err = ConnectorError::Http {
            status: 422,
            body: "slug taken".into(),
        };
        let classified = classify_with("Blog", &err, |e| match e {
            ConnectorError::Http { body, .. } if body.contains("slug") => Some(
                ClassifiedError::new(ErrorCategory::Service, "That slug is already used."),
            ),
            _ => None,
        });
        assert_eq!(classified.category, ErrorCategory::Service);
    }

    #[test]
    fn test_unknown_falls_back_to_template() {
        let err = ConnectorError::unknown("boom");
        let classified = classify_with("Notes", &err, |_| None);
        assert_eq!(classified.category, ErrorCategory::Unknown);
        assert_eq!(
            classified.user_friendly_message,
            "Something went wrong while talking to Notes."
        );
        assert_eq!(classified.description.as_deref(), Some("boom"));
    }

    #[test]
    fn test_retryable() {
        assert!(ConnectorError::RateLimited {
            retry_after_secs: Some(3)
        }
        .is_retryable());
        assert!(ConnectorError::Http {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!ConnectorError::Unauthorized {
            message: String::new()
        }
        .is_retryable());
    }
}
