//! Bounded retry with exponential backoff for remote calls.
//!
//! Only errors classified as `ErrorRetryStrategy::Retry` are retried. When the
//! budget runs out the error from the last attempt is returned untouched, so
//! callers see the original failure rather than a wrapper.

use std::future::Future;

use tracing::{debug, error, warn};

use crate::config::RetryPolicy;
use crate::error::{ErrorRetryStrategy, GenerationError};

/// Runs `operation` up to `policy.max_attempts` times.
///
/// # Arguments
/// - `description` - Human-readable name of the operation for logging
/// - `policy` - Attempt budget and backoff bounds
/// - `operation` - Produces a fresh future for each attempt
pub async fn execute_with_retry<T, F, Fut>(
    description: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, GenerationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GenerationError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        debug!("Processing {} (attempt {}/{})", description, attempt, max_attempts);

        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => match err.to_retry_strategy() {
                ErrorRetryStrategy::Fail => {
                    error!("Permanent error for {}: {}", description, err);
                    return Err(err);
                }
                ErrorRetryStrategy::Retry => {
                    if attempt >= max_attempts {
                        error!(
                            "Max attempts ({}) exceeded for {}: {}",
                            max_attempts, description, err
                        );
                        return Err(err);
                    }

                    let backoff = policy.backoff(attempt);
                    warn!(
                        "Retrying {} (attempt {}/{}) after {:?}: {}",
                        description, attempt, max_attempts, backoff, err
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let calls = AtomicU32::new(0);
        let result = execute_with_retry("flaky call", &fast_policy(3), || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(GenerationError::Network("connection reset".into()))
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausted_budget_returns_original_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = execute_with_retry("always down", &fast_policy(3), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err(GenerationError::RequestTimeout(format!("attempt {n}")))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            GenerationError::RequestTimeout(message) => assert_eq!(message, "attempt 2"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = execute_with_retry("bad request", &fast_policy(3), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GenerationError::Remote {
                status: 400,
                message: "invalid aspect_ratio".into(),
            })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
