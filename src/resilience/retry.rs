//! Retry with exponential backoff and jitter.
//!
//! Only errors whose [`ErrorClass`](crate::error_code::ErrorClass) is retryable are
//! retried. Quota exhaustion looks retryable but is bounded separately by
//! [`RetryConfig::quota_retry_limit`] so the caller can surface it quickly.

use crate::config::duration_ms;
use crate::error_code::ErrorClass;
use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(rename = "min_delay_ms", with = "duration_ms")]
    pub min_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    pub jitter: bool,
    /// Retries allowed for `QuotaExhausted` regardless of `max_retries`.
    pub quota_retry_limit: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
            quota_retry_limit: 1,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }
    pub fn with_delays(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay = min;
        self.max_delay = max;
        self
    }
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
    pub fn with_quota_retry_limit(mut self, n: u32) -> Self {
        self.quota_retry_limit = n;
        self
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry { delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff before retry number `attempt + 1`: `min_delay * 2^attempt`, capped at
    /// `max_delay`. With jitter the delay is drawn uniformly from `[delay/2, delay]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.min_delay.as_millis() as u64;
        let cap = self.config.max_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = base.saturating_mul(factor).min(cap);
        if self.config.jitter && delay > 1 {
            let low = delay / 2;
            Duration::from_millis(rand::thread_rng().gen_range(low..=delay))
        } else {
            Duration::from_millis(delay)
        }
    }

    /// `attempt` is 0-based: the first failure is attempt 0.
    pub fn decide(&self, err: &Error, attempt: u32, max_retries: u32) -> Decision {
        let class = err.class();
        if !class.retryable() || attempt >= max_retries {
            return Decision::GiveUp;
        }
        if class == ErrorClass::QuotaExhausted && attempt >= self.config.quota_retry_limit {
            return Decision::GiveUp;
        }
        Decision::Retry {
            delay: self.backoff(attempt),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Run `op` until it succeeds, fails permanently, or exhausts `max_retries`.
///
/// `op` receives the 0-based attempt number.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    max_retries: u32,
    label: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => match policy.decide(&e, attempt, max_retries) {
                Decision::Retry { delay } => {
                    debug!(
                        operation = label,
                        attempt = attempt + 1,
                        max_retries,
                        error_class = e.class().name(),
                        delay_ms = delay.as_millis() as u64,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Decision::GiveUp => return Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fixed_policy() -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::new()
                .with_delays(Duration::from_millis(100), Duration::from_millis(1000))
                .with_jitter(false),
        )
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let p = fixed_policy();
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
        assert_eq!(p.backoff(4), Duration::from_millis(1000));
        assert_eq!(p.backoff(63), Duration::from_millis(1000));
        assert_eq!(p.backoff(200), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let p = RetryPolicy::new(
            RetryConfig::new().with_delays(Duration::from_millis(400), Duration::from_secs(10)),
        );
        for _ in 0..50 {
            let d = p.backoff(0);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_decide_respects_class() {
        let p = fixed_policy();
        assert!(matches!(
            p.decide(&Error::transient("x"), 0, 3),
            Decision::Retry { .. }
        ));
        assert_eq!(p.decide(&Error::invalid_input("x"), 0, 3), Decision::GiveUp);
        assert_eq!(p.decide(&Error::transient("x"), 3, 3), Decision::GiveUp);
    }

    #[test]
    fn test_quota_is_bounded_separately() {
        let p = fixed_policy();
        let quota = Error::quota_exhausted("daily limit");
        assert!(matches!(p.decide(&quota, 0, 5), Decision::Retry { .. }));
        assert_eq!(p.decide(&quota, 1, 5), Decision::GiveUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_recovers_from_transient() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out = with_retry(&fixed_policy(), 3, "test", move |_| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::transient("blip"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(out.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_stops_on_permanent() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out: Result<()> = with_retry(&fixed_policy(), 3, "test", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::invalid_input("bad bytes")) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_gives_up_after_max() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out: Result<()> = with_retry(&fixed_policy(), 2, "test", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::transient("down")) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
