use super::{HandleFactory, PoolConfig};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use reqwest::Proxy;
use std::env;
use tracing::warn;

/// Builds one `reqwest::Client` per pooled handle.
///
/// Honors `CAPTURE_PROXY_URL` and `CAPTURE_HTTP_POOL_MAX_IDLE_PER_HOST`.
pub struct HttpClientFactory {
    config: PoolConfig,
}

impl HttpClientFactory {
    pub fn new(config: PoolConfig) -> Self {
        Self { config }
    }

    fn build(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.config.http_timeout)
            .connect_timeout(self.config.connect_timeout)
            .user_agent(self.config.user_agent.clone())
            .pool_max_idle_per_host(
                env::var("CAPTURE_HTTP_POOL_MAX_IDLE_PER_HOST")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(4),
            )
            .pool_idle_timeout(Some(self.config.idle_timeout));

        if let Ok(proxy_url) = env::var("CAPTURE_PROXY_URL") {
            match Proxy::all(&proxy_url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => warn!(proxy = proxy_url.as_str(), error = %e, "ignoring invalid proxy url"),
            }
        }

        builder.build().map_err(|e| {
            Error::configuration_with_context(
                format!("failed to build HTTP client: {e}"),
                ErrorContext::new().with_source("http_client_factory"),
            )
        })
    }
}

#[async_trait]
impl HandleFactory<reqwest::Client> for HttpClientFactory {
    async fn create(&self, _key: &str) -> Result<reqwest::Client> {
        self.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::LeasePool;
    use crate::resilience::retry::RetryPolicy;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_factory_builds_leasable_clients() {
        let config = PoolConfig::new().with_max_handles(2);
        let pool = LeasePool::new(
            config.clone(),
            Arc::new(HttpClientFactory::new(config)),
            RetryPolicy::default(),
        );
        let lease = pool.lease("example.com").await.unwrap();
        assert!(lease.get("http://127.0.0.1:1/").build().is_ok());
        assert_eq!(pool.stats().created, 1);
    }
}
