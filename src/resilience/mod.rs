//! Resilience primitives shared by the pool and the tiers.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`retry`] | Exponential backoff with jitter, gated on [`ErrorClass`](crate::error_code::ErrorClass) |
//! | [`rate_limiter`] | Token bucket that lets a saturated tier be skipped |
//!
//! ```rust
//! use capture_batch::resilience::retry::{RetryConfig, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(
//!     RetryConfig::new()
//!         .with_delays(Duration::from_millis(100), Duration::from_secs(2))
//!         .with_jitter(false),
//! );
//! assert_eq!(policy.backoff(2), Duration::from_millis(400));
//! ```

pub mod rate_limiter;
pub mod retry;
