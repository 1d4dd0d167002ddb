//! # Retry Policy
//!
//! Caller-side retry for sync jobs. A retryable failure (timeout, rate
//! limit, network, 5xx, busy store) waits out an exponential backoff and
//! runs the job again; pulls pick up from the checkpoint the failed attempt
//! left behind.
//!
//! ```text
//!   attempt 1 ──► Err(retryable) ──► sleep(backoff | Retry-After) ──┐
//!       ▲                                                           │
//!       └──────────────────────── attempt n+1 ◄─────────────────────┘
//!   Err(non-retryable) or attempts == max_attempts ──► return error
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use strata_core::ConnectorError;
use strata_sync::{RetrySettings, SyncError, SyncResult};
use tracing::{info, warn};

/// Creates the exponential backoff configuration.
fn create_backoff(settings: &RetrySettings) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: settings.initial_backoff(),
        max_interval: settings.max_backoff(),
        multiplier: 2.0,
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Delay requested by the service itself, if any.
fn requested_delay(error: &SyncError) -> Option<Duration> {
    match error {
        SyncError::Connector {
            source: ConnectorError::RateLimited {
                retry_after_secs: Some(secs),
            },
            ..
        } => Some(Duration::from_secs(*secs)),
        _ => None,
    }
}

/// Runs `job` until it succeeds, fails with a non-retryable error, or
/// `settings.max_attempts` attempts have been made. The closure receives
/// the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(settings: &RetrySettings, what: &str, mut job: F) -> SyncResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut backoff = create_backoff(settings);
    let mut attempt = 1;

    loop {
        match job(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!(job = %what, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < settings.max_attempts => {
                let delay = requested_delay(&e)
                    .map(|d| d.min(settings.max_backoff()))
                    .or_else(|| backoff.next_backoff())
                    .unwrap_or_else(|| settings.max_backoff());
                warn!(
                    job = %what,
                    attempt,
                    max_attempts = settings.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use strata_db::DbError;

    fn fast_settings(max_attempts: u32) -> RetrySettings {
        RetrySettings {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_secs: 1,
        }
    }

    fn network_error() -> SyncError {
        SyncError::connector(
            "memory",
            ConnectorError::Network {
                message: "connection reset".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_settings(5), "pull", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(network_error())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: SyncResult<()> = with_retry(&fast_settings(2), "pull", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::database("blog/posts", DbError::PoolExhausted)) }
        })
        .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: SyncResult<()> = with_retry(&fast_settings(5), "push", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(SyncError::connector(
                    "memory",
                    ConnectorError::Unauthorized {
                        message: "bad key".into(),
                    },
                ))
            }
        })
        .await;

        assert!(matches!(result, Err(SyncError::ConnectorAuth { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rate_limit_delay_is_honored() {
        let limited = SyncError::connector(
            "memory",
            ConnectorError::RateLimited {
                retry_after_secs: Some(2),
            },
        );
        assert_eq!(requested_delay(&limited), Some(Duration::from_secs(2)));
        assert_eq!(requested_delay(&network_error()), None);
    }
}
