// =============================================================================
// Retry — exponential backoff for transient failures
// =============================================================================
//
// Shared by the notification backends and the smart plug controller.
// Retryable errors back off `initial * 2^attempt`; non-retryable errors
// fail immediately. Per-attempt timeouts are the transport's job (SMTP and
// HTTP clients carry their own), so this helper only sequences attempts.
// =============================================================================

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff_sec: u64) -> Self {
        Self {
            max_retries: max_retries.max(1),
            initial_backoff: Duration::from_secs(initial_backoff_sec),
        }
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        self.initial_backoff * 2u32.saturating_pow(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 2)
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E: Display> {
    #[error("{name} failed (non-retryable): {source}")]
    Fatal { name: String, source: E },
    #[error("{name} failed after {attempts} attempts: {source}")]
    Exhausted {
        name: String,
        attempts: u32,
        source: E,
    },
}

/// Run `op` up to `policy.max_retries` times. `is_retryable` decides
/// whether a failure is worth another attempt.
pub async fn with_retry<T, E, F, Fut>(
    name: &str,
    policy: &RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => {
                error!(op = name, error = %e, "non-retryable failure");
                return Err(RetryError::Fatal {
                    name: name.to_string(),
                    source: e,
                });
            }
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_retries {
                    error!(op = name, attempts = attempt, error = %e, "retries exhausted");
                    return Err(RetryError::Exhausted {
                        name: name.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
                let backoff = policy.backoff_for_attempt(attempt - 1);
                warn!(
                    op = name,
                    attempt,
                    max = policy.max_retries,
                    error = %e,
                    backoff_sec = backoff.as_secs_f64(),
                    "attempt failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (retryable={})", self.retryable)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry(
            "test",
            &RetryPolicy::new(3, 1),
            |e: &TestError| e.retryable,
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError { retryable: true })
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_retries_on_persistent_transient_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(
            "test",
            &RetryPolicy::new(3, 1),
            |e: &TestError| e.retryable,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError { retryable: true }) }
            },
        )
        .await;
        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_fails_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(
            "test",
            &RetryPolicy::new(5, 1),
            |e: &TestError| e.retryable,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError { retryable: false }) }
            },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Fatal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::new(4, 2);
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_secs(8));
    }
}
