//! Typed retry policy with exponential backoff.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{cancellable_sleep, CancellationToken, RateLimiter};
use crate::error::CallError;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound of the random offset added to each backoff.
pub const DEFAULT_MAX_RETRY_JITTER: Duration = Duration::from_secs(1);

/// Default timeout applied to every individual attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Retry policy shared by the Generate, Analyze and Publish call sites.
///
/// Transient failures are retried up to `max_retries` times, sleeping
/// `initial_delay * 2^retry` plus a jitter offset in `[0, max_retry_jitter]`
/// between attempts. A remote `Retry-After` hint raises the delay if larger.
/// Permanent failures end the call immediately without using the budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "crate::utils::serde_secs")]
    pub initial_delay: Duration,
    #[serde(with = "crate::utils::serde_secs")]
    pub max_retry_jitter: Duration,
    #[serde(with = "crate::utils::serde_secs")]
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_retry_jitter: DEFAULT_MAX_RETRY_JITTER,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

/// Why a retried call ended without a value.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryFailure {
    /// The remote side rejected the call for good.
    Permanent(CallError),
    /// Every attempt failed transiently; carries the last error.
    Exhausted(CallError),
    /// Cancellation was observed before the call could complete.
    Cancelled,
}

impl std::fmt::Display for RetryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryFailure::Permanent(err) => write!(f, "{}", err),
            RetryFailure::Exhausted(err) => write!(f, "retries exhausted: {}", err),
            RetryFailure::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of a retried call together with the number of attempts made.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, RetryFailure>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            ..Default::default()
        }
    }

    pub fn with_max_retry_jitter(mut self, jitter: Duration) -> Self {
        self.max_retry_jitter = jitter;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Total number of attempts the policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Backoff before retry number `retry` (0-based), without jitter.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }

    /// Backoff for retry number `retry` plus a jitter offset from `limiter`.
    pub fn retry_delay(&self, retry: u32, limiter: &RateLimiter) -> Duration {
        self.backoff_delay(retry)
            .saturating_add(limiter.jitter(self.max_retry_jitter))
    }

    /// Runs `op` until it succeeds, fails permanently, exhausts the retry
    /// budget or `cancel` fires.
    ///
    /// When `pace` is set, every attempt is preceded by a delay drawn from
    /// `limiter`'s pacing window. Each attempt is bounded by
    /// `attempt_timeout`; a timeout counts as a transient failure. Sleeps are
    /// interrupted by cancellation, an attempt already in flight is not.
    pub async fn execute<T, F, Fut>(
        &self,
        limiter: &RateLimiter,
        pace: bool,
        cancel: &CancellationToken,
        mut op: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut attempts = 0u32;

        loop {
            if pace && !cancellable_sleep(cancel, limiter.next_delay()).await {
                return RetryOutcome {
                    result: Err(RetryFailure::Cancelled),
                    attempts,
                };
            }
            if cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(RetryFailure::Cancelled),
                    attempts,
                };
            }

            attempts += 1;
            let result = match tokio::time::timeout(self.attempt_timeout, op(attempts)).await {
                Ok(result) => result,
                Err(_) => Err(CallError::Timeout(self.attempt_timeout)),
            };

            let err = match result {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    }
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                tracing::warn!(attempt = attempts, error = %err, "Permanent failure, not retrying");
                return RetryOutcome {
                    result: Err(RetryFailure::Permanent(err)),
                    attempts,
                };
            }

            if attempts >= self.max_attempts() {
                tracing::warn!(
                    attempts = attempts,
                    error = %err,
                    "Transient failure, retry budget exhausted"
                );
                return RetryOutcome {
                    result: Err(RetryFailure::Exhausted(err)),
                    attempts,
                };
            }

            let mut delay = self.retry_delay(attempts - 1, limiter);
            if let Some(hint) = err.retry_after() {
                delay = delay.max(hint);
            }

            tracing::warn!(
                attempt = attempts,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient error, will retry"
            );

            if !cancellable_sleep(cancel, delay).await {
                return RetryOutcome {
                    result: Err(RetryFailure::Cancelled),
                    attempts,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(5))
            .with_max_retry_jitter(Duration::ZERO)
            .with_attempt_timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.attempt_timeout, Duration::from_secs(300));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(64), Duration::from_secs(u32::MAX as u64));
    }

    #[test]
    fn test_retry_delay_saturates_with_huge_settings() {
        let policy = RetryPolicy::new(3, Duration::MAX).with_max_retry_jitter(Duration::MAX);
        let limiter = RateLimiter::seeded(Duration::ZERO, Duration::ZERO, 11);
        assert_eq!(policy.retry_delay(2, &limiter), Duration::MAX);

        let policy = RetryPolicy::new(3, Duration::from_secs(1))
            .with_max_retry_jitter(Duration::ZERO);
        assert_eq!(policy.retry_delay(1, &RateLimiter::disabled()), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let policy = fast_policy(3);
        let outcome = policy
            .execute(&RateLimiter::disabled(), false, &CancellationToken::new(), |_| async {
                Ok::<_, CallError>(7)
            })
            .await;
        assert_eq!(outcome.result, Ok(7));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let policy = fast_policy(3);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = policy
            .execute(&RateLimiter::disabled(), false, &CancellationToken::new(), move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(CallError::Transient("connection reset".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(outcome.result, Ok("done"));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let policy = fast_policy(3);
        let outcome = policy
            .execute(&RateLimiter::disabled(), false, &CancellationToken::new(), |_| async {
                Err::<(), _>(CallError::Permanent("malformed request".into()))
            })
            .await;
        assert_eq!(
            outcome.result,
            Err(RetryFailure::Permanent(CallError::Permanent(
                "malformed request".into()
            )))
        );
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let policy = fast_policy(2);
        let outcome = policy
            .execute(&RateLimiter::disabled(), false, &CancellationToken::new(), |_| async {
                Err::<(), _>(CallError::Transient("503".into()))
            })
            .await;
        assert!(matches!(outcome.result, Err(RetryFailure::Exhausted(_))));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_transient() {
        let policy = RetryPolicy::new(1, Duration::from_millis(1))
            .with_max_retry_jitter(Duration::ZERO)
            .with_attempt_timeout(Duration::from_millis(10));
        let outcome = policy
            .execute(&RateLimiter::disabled(), false, &CancellationToken::new(), |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, CallError>(())
            })
            .await;
        assert_eq!(
            outcome.result,
            Err(RetryFailure::Exhausted(CallError::Timeout(
                Duration::from_millis(10)
            )))
        );
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_backoff_elapsed_between_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(20))
            .with_max_retry_jitter(Duration::ZERO)
            .with_attempt_timeout(Duration::from_secs(5));
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = Arc::clone(&stamps);
        let outcome = policy
            .execute(&RateLimiter::disabled(), false, &CancellationToken::new(), move |attempt| {
                recorder.lock().unwrap().push(Instant::now());
                async move {
                    if attempt < 3 {
                        Err(CallError::Transient("flaky".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert!(outcome.result.is_ok());

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 3);
        assert!(stamps[1] - stamps[0] >= Duration::from_millis(20));
        assert!(stamps[2] - stamps[1] >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_secs(30)).with_max_retry_jitter(Duration::ZERO);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let outcome = policy
            .execute(&RateLimiter::disabled(), false, &cancel, |_| async {
                Err::<(), _>(CallError::Transient("down".into()))
            })
            .await;
        assert_eq!(outcome.result, Err(RetryFailure::Cancelled));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = fast_policy(3)
            .execute(&RateLimiter::disabled(), true, &cancel, |_| async {
                Ok::<_, CallError>(())
            })
            .await;
        assert_eq!(outcome.result, Err(RetryFailure::Cancelled));
        assert_eq!(outcome.attempts, 0);
    }

    #[tokio::test]
    async fn test_retry_after_hint_raises_delay() {
        let policy = RetryPolicy::new(1, Duration::from_millis(1)).with_max_retry_jitter(Duration::ZERO);
        let started = Instant::now();
        let outcome = policy
            .execute(&RateLimiter::disabled(), false, &CancellationToken::new(), |attempt| async move {
                if attempt == 1 {
                    Err(CallError::RateLimited {
                        message: "429".into(),
                        retry_after: Some(Duration::from_millis(30)),
                    })
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(outcome.result.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_policy_deserializes_seconds() {
        let policy: RetryPolicy =
            serde_yaml::from_str("max_retries: 5\ninitial_delay: 0.5\n").unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
        assert_eq!(policy.attempt_timeout, DEFAULT_ATTEMPT_TIMEOUT);
    }
}
