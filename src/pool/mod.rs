//! Bounded pool of reusable handles.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`LeasePool`] | Keyed handle pool with scoped leases, retry and idle reaping |
//! | [`HandleFactory`] | Creates and closes pooled handles |
//! | [`HttpClientFactory`] | Builds `reqwest::Client`s for the downloader |

mod http;
mod lease;

pub use http::HttpClientFactory;
pub use lease::{HandleFactory, HandleState, Lease, LeasePool, PoolStats};

use crate::config::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Hard cap on live handles across all keys.
    pub max_handles: usize,
    #[serde(rename = "lease_timeout_ms", with = "duration_ms")]
    pub lease_timeout: Duration,
    #[serde(rename = "idle_timeout_ms", with = "duration_ms")]
    pub idle_timeout: Duration,
    #[serde(rename = "reaper_interval_ms", with = "duration_ms")]
    pub reaper_interval: Duration,
    /// Request timeout applied to HTTP clients built by [`HttpClientFactory`].
    #[serde(rename = "http_timeout_ms", with = "duration_ms")]
    pub http_timeout: Duration,
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_handles: 25,
            lease_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(60),
            http_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(5),
            user_agent: concat!("capture-batch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_handles(mut self, max: usize) -> Self {
        self.max_handles = max;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }
}
