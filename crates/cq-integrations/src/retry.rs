//! Retry with exponential backoff for review-service calls and pushes.

use std::future::Future;
use std::time::Duration;

use cq_core::{ReviewError, ReviewResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How often and how patiently transient failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = run once).
    pub max_retries: u32,
    /// Delay before the first retry; doubled for every further one.
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_base_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Run a review-service call until it succeeds, fails permanently, or
/// retries run out.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, op: F) -> ReviewResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = ReviewResult<T>>,
{
    retry_if(policy, what, ReviewError::is_transient, op).await
}

/// Run `op` until it succeeds, returns an error `retryable` rejects, or
/// retries run out. The last error is returned.
pub async fn retry_if<T, E, R, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    retryable: R,
    op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if retryable(&e) && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                warn!(
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Map a transport-level failure.
pub(crate) fn transport(e: reqwest::Error) -> ReviewError {
    ReviewError::Transport(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base_ms: 100,
        }
    }

    #[test]
    fn delay_doubles() {
        let p = policy(3);
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let value = with_retry(&policy(3), "list", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ReviewError::Status {
                    status: 502,
                    body: "bad gateway".to_string(),
                })
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&policy(2), "list", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ReviewError::Transport("connection reset".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ReviewError::Transport(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&policy(5), "fetch", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ReviewError::NotFound(9))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ReviewError::NotFound(9)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_decides_what_is_retried() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let err = retry_if(&policy(2), "push", |e: &String| e.contains("hung up"), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("remote end hung up".to_string())
        })
        .await
        .unwrap_err();
        assert_eq!(err, "remote end hung up");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms then 200ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(300));

        let calls = AtomicU32::new(0);
        retry_if(&policy(2), "push", |e: &String| e.contains("hung up"), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("non-fast-forward".to_string())
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
