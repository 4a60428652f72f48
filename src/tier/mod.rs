//! Processing tiers and the per-item fallback chain.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Tier`] | One processing strategy with a single `attempt` method |
//! | [`ExtractorTier`] | Binds an [`Extractor`](crate::collaborators::Extractor) with optional timeout and rate limit |
//! | [`TieredItemProcessor`] | Tries tiers in order, falling back only on retryable failures |

mod processor;

pub use processor::{ItemResolution, TierUsed, TieredItemProcessor};

use crate::collaborators::{Extraction, Extractor};
use crate::error_code::ErrorClass;
use crate::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A processing strategy. Tiers are tried in list order.
#[async_trait]
pub trait Tier: Send + Sync {
    fn name(&self) -> &str;

    async fn attempt(&self, payload: &Bytes) -> Result<Extraction>;
}

/// Tier backed by an [`Extractor`].
pub struct ExtractorTier {
    name: String,
    extractor: Arc<dyn Extractor>,
    attempt_timeout: Option<Duration>,
    limiter: Option<RateLimiter>,
    /// Skip instead of waiting when the limiter's wait reaches this.
    skip_threshold: Duration,
    rate_limit_cooldown: Duration,
}

impl ExtractorTier {
    pub fn new(name: impl Into<String>, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            name: name.into(),
            extractor,
            attempt_timeout: None,
            limiter: None,
            skip_threshold: Duration::from_secs(2),
            rate_limit_cooldown: Duration::from_secs(30),
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimiterConfig) -> Self {
        self.limiter = Some(RateLimiter::new(config));
        self
    }

    pub fn with_skip_threshold(mut self, threshold: Duration) -> Self {
        self.skip_threshold = threshold;
        self
    }

    pub fn with_rate_limit_cooldown(mut self, cooldown: Duration) -> Self {
        self.rate_limit_cooldown = cooldown;
        self
    }

    fn context(&self) -> ErrorContext {
        ErrorContext::new().with_source(format!("tier:{}", self.name))
    }
}

#[async_trait]
impl Tier for ExtractorTier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self, payload: &Bytes) -> Result<Extraction> {
        if let Some(limiter) = &self.limiter {
            if let Some(wait) = limiter.estimated_wait().await {
                if wait >= self.skip_threshold {
                    debug!(tier = self.name.as_str(), wait_ms = wait.as_millis() as u64, "tier saturated, skipping");
                    return Err(Error::upstream(
                        ErrorClass::RateLimited,
                        format!("rate limit: tier {} saturated", self.name),
                    )
                    .with_context(self.context()));
                }
            }
            limiter.acquire().await;
        }

        let result = match self.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.extractor.analyze(payload)).await {
                Ok(r) => r,
                Err(_) => Err(Error::timeout(limit).with_context(self.context())),
            },
            None => self.extractor.analyze(payload).await,
        };

        if let (Err(e), Some(limiter)) = (&result, &self.limiter) {
            if e.class() == ErrorClass::RateLimited {
                limiter.penalize(self.rate_limit_cooldown).await;
            }
        }
        result
    }
}
