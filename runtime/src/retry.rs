//! Exponential backoff for transient store failures.
//!
//! The publisher wraps outbox store calls (claim, mark) with [`retry_transient`]
//! so a brief database hiccup does not abandon a claimed batch. Delivery
//! failures are not retried here; they go through the outbox retry budget.
//!
//! # Example
//!
//! ```rust
//! use tuneshare_runtime::retry::{RetryPolicy, retry_transient};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(50))
//!     .build();
//!
//! let claimed = retry_transient(&policy, "claim", || async { Ok::<_, String>(3) }, |e| {
//!     e.contains("timeout")
//! })
//! .await?;
//! assert_eq!(claimed, 3);
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Backoff settings.
///
/// Defaults: 3 retries, 100 ms initial delay doubling up to 5 s, with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Growth factor per retry.
    pub multiplier: f64,
    /// Randomize each delay to between half and all of its nominal value.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Builder starting from the defaults.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Nominal delay before retry number `attempt` (0-based), without jitter.
    ///
    /// `initial_delay × multiplier^attempt`, capped at `max_delay`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let millis = self.initial_delay.as_secs_f64() * 1_000.0 * factor;
        if !millis.is_finite() || millis >= self.max_delay.as_secs_f64() * 1_000.0 {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64)
    }

    fn sleep_for(&self, attempt: u32) -> Duration {
        let nominal = self.delay_for_attempt(attempt);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        nominal.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Retries after the first attempt.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    /// Delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Ceiling for any single delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Growth factor per retry.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Finish.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Run `operation`, retrying while `is_transient` holds for its error and the
/// policy allows another attempt.
///
/// # Errors
///
/// The first non-transient error, or the last error once retries run out.
pub async fn retry_transient<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation_name: &'static str,
    mut operation: F,
    is_transient: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(operation = operation_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !is_transient(&err) => return Err(err),
            Err(err) if attempt >= policy.max_retries => {
                tracing::error!(
                    operation = operation_name,
                    attempts = attempt + 1,
                    error = %err,
                    "Giving up after retries"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = policy.sleep_for(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Transient failure, retrying"
                );
                metrics::counter!("outbox.store.retries.total", "operation" => operation_name)
                    .increment(1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(2)
            .initial_delay(Duration::from_millis(1))
            .jitter(false)
            .build()
    }

    #[test]
    fn delays_double_until_capped() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(500))
            .jitter(false)
            .build();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy::default();
        for attempt in 0..5 {
            let nominal = policy.delay_for_attempt(attempt);
            let actual = policy.sleep_for(attempt);
            assert!(actual <= nominal && actual >= nominal / 2);
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result = retry_transient(
            &fast(),
            "test",
            || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient")
                    } else {
                        Ok(7)
                    }
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), &str> = retry_transient(
            &fast(),
            "test",
            || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err("down") }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), &str> = retry_transient(
            &fast(),
            "test",
            || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err("not found") }
            },
            |e| e.contains("timeout"),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    proptest::proptest! {
        #[test]
        fn delays_never_shrink_or_exceed_the_cap(
            initial_ms in 1u64..1_000,
            cap_ms in 1u64..60_000,
            multiplier in 1.0f64..4.0,
            attempt in 0u32..40,
        ) {
            let policy = RetryPolicy::builder()
                .initial_delay(Duration::from_millis(initial_ms))
                .max_delay(Duration::from_millis(cap_ms))
                .multiplier(multiplier)
                .jitter(false)
                .build();
            let this = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            proptest::prop_assert!(this <= policy.max_delay);
            proptest::prop_assert!(this <= next);
        }
    }
}
