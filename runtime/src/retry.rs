//! Bounded retries with exponential backoff.
//!
//! Two callers: the optimistic-concurrency loop (retry on a version
//! conflict, re-reading the order each time) and transient infrastructure
//! failures during the sweep. Both are bounded; exhaustion surfaces the
//! last error unchanged.

use cinema_core::{CheckoutError, ErrorKind};
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy for exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first try.
    pub max_retries: usize,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap for the exponential backoff.
    pub max_delay: Duration,
    /// Delay multiplier per retry.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy retrying `max_retries` times with the default backoff curve.
    #[must_use]
    pub fn with_max_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay for a given 0-based attempt number, capped at `max_delay`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(delay_ms as u64);
        delay.min(self.max_delay)
    }
}

/// Retries `operation` while `is_retryable` approves the error, sleeping
/// with exponential backoff between attempts.
///
/// # Errors
///
/// The first non-retryable error, or the last error once `max_retries` is
/// exhausted.
pub async fn retry_if<F, Fut, T, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, CheckoutError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CheckoutError>>,
    P: Fn(&CheckoutError) -> bool,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::debug!(attempt, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) if is_retryable(&err) && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "retryable failure, backing off"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Predicate for the optimistic-concurrency loop: version conflicts only.
#[must_use]
pub fn is_version_conflict(err: &CheckoutError) -> bool {
    matches!(err, CheckoutError::ConcurrentModification { .. })
}

/// Predicate for infrastructure calls: transient failures only.
#[must_use]
pub fn is_transient(err: &CheckoutError) -> bool {
    err.kind() == ErrorKind::Transient
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use cinema_core::OrderId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn retries_version_conflicts_up_to_the_bound() {
        let calls = AtomicUsize::new(0);
        let order = OrderId::new();
        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let result: Result<(), _> = retry_if(
            &policy,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(CheckoutError::ConcurrentModification { order }) }
            },
            is_version_conflict,
        )
        .await;
        assert!(matches!(
            result,
            Err(CheckoutError::ConcurrentModification { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = retry_if(
            &RetryPolicy::default(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CheckoutError::EmptyCart) }
            },
            is_version_conflict,
        )
        .await;
        assert!(matches!(result, Err(CheckoutError::EmptyCart)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
