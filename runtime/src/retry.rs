//! Retry with exponential backoff for the `reduce` phase.
//!
//! Only `reduce` is ever retried — `before`/`after` are never wrapped, per
//! the optimistic-update invariant that the optimistic apply itself is
//! never repeated. [`RetryPolicy`] is the runtime-side execution of an
//! [`flux_core::action::RetryMixin`] declaration.

use std::time::Duration;

use flux_core::action::RetryMixin;
use rand::Rng;
use tokio::time::sleep;

/// Exponential-backoff policy derived from an action's declared
/// [`RetryMixin`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial_delay: Duration,
    multiplier: f64,
    max_retries: u32,
    unlimited: bool,
}

impl From<RetryMixin> for RetryPolicy {
    fn from(mixin: RetryMixin) -> Self {
        Self {
            initial_delay: mixin.initial_delay,
            multiplier: mixin.multiplier,
            max_retries: mixin.max_retries,
            unlimited: mixin.unlimited,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry attempt `attempt` (0-indexed), with +/-50% jitter
    /// to avoid a thundering herd when many coalesced dispatches fail
    /// together.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let jitter = rand::thread_rng().gen_range(0.5..1.0);
        Duration::from_millis((base_ms * jitter) as u64)
    }

    /// Whether attempt number `attempt` (0-indexed, 0 = first try) is still
    /// permitted to run.
    #[must_use]
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.unlimited || attempt <= self.max_retries
    }
}

/// Retry a fallible async `reduce` invocation according to `policy`.
///
/// `operation` is re-invoked on every failed attempt; the last error is
/// returned once the policy is exhausted (never, if `unlimited`).
pub async fn retry_reduce<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, "reduce succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !policy.allows_attempt(attempt + 1) {
                    tracing::error!(attempt, "reduce exhausted retries");
                    crate::metrics::RetryMetrics::record_exhausted();
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(attempt, delay_ms = delay.as_millis(), "reduce failed, retrying");
                crate::metrics::RetryMetrics::record_attempt();
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn bounded_policy_stops_after_max_retries() {
        let policy = RetryPolicy::from(RetryMixin {
            max_retries: 2,
            unlimited: false,
            ..RetryMixin::default()
        });
        assert!(policy.allows_attempt(0));
        assert!(policy.allows_attempt(2));
        assert!(!policy.allows_attempt(3));
    }

    #[test]
    fn unlimited_policy_never_stops() {
        let policy = RetryPolicy::from(RetryMixin {
            unlimited: true,
            ..RetryMixin::default()
        });
        assert!(policy.allows_attempt(1000));
    }

    #[tokio::test]
    async fn retry_reduce_succeeds_after_failures() {
        let policy = RetryPolicy::from(RetryMixin {
            initial_delay: Duration::from_millis(1),
            max_retries: 3,
            ..RetryMixin::default()
        });
        let calls = Mutex::new(0usize);
        let counter = AtomicUsize::new(0);

        let result: Result<i32, &str> = retry_reduce(&policy, |_attempt| {
            *calls.lock().unwrap() += 1;
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err("not yet") } else { Ok(42) } }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn retry_reduce_gives_up_when_bounded() {
        let policy = RetryPolicy::from(RetryMixin {
            initial_delay: Duration::from_millis(1),
            max_retries: 1,
            ..RetryMixin::default()
        });

        let result: Result<i32, &str> =
            retry_reduce(&policy, |_attempt| async { Err("persistent") }).await;

        assert_eq!(result, Err("persistent"));
    }
}
