//! Capture service: the one object the transport layer talks to.
//!
//! Owns the lease pool, collector, processor and aggregator, wires them on
//! [`CaptureService::start`] and tears them down on [`CaptureService::stop`].

use crate::batch::{
    BatchAddResult, BatchCollector, BatchHandler, BatchProcessor, CollectorStats, PendingItem,
    ProcessorStats, ProgressNotifier, SessionStatus,
};
use crate::collaborators::{Downloader, HttpDownloader, LogNotifier, MemoryStore, Notifier, Store};
use crate::config::CaptureConfig;
use crate::pool::{HttpClientFactory, LeasePool, PoolStats};
use crate::report::ResultAggregator;
use crate::resilience::retry::RetryPolicy;
use crate::tier::{Tier, TieredItemProcessor};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{info, warn};

/// Builder for [`CaptureService`].
pub struct CaptureServiceBuilder {
    config: CaptureConfig,
    tiers: Vec<Arc<dyn Tier>>,
    downloader: Option<Arc<dyn Downloader>>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
}

impl CaptureServiceBuilder {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            tiers: Vec::new(),
            downloader: None,
            store: Arc::new(MemoryStore::new()),
            notifier: Arc::new(LogNotifier),
        }
    }

    /// Append a tier. The first one added is the primary.
    pub fn tier(mut self, tier: Arc<dyn Tier>) -> Self {
        self.tiers.push(tier);
        self
    }

    /// Use a custom downloader instead of the pooled HTTP one.
    pub fn downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn build(self) -> Result<CaptureService> {
        self.config.validate()?;
        if self.tiers.is_empty() {
            return Err(Error::configuration_with_context(
                "at least one processing tier is required",
                ErrorContext::new().with_source("capture_service"),
            ));
        }
        let config = self.config;
        let policy = RetryPolicy::new(config.retry.clone());

        let (downloader, pool) = match self.downloader {
            Some(d) => (d, None),
            None => {
                let pool = Arc::new(LeasePool::new(
                    config.pool.clone(),
                    Arc::new(HttpClientFactory::new(config.pool.clone())),
                    policy.clone(),
                ));
                let downloader: Arc<dyn Downloader> = Arc::new(
                    HttpDownloader::new(pool.clone()).with_max_retries(config.retry.max_retries),
                );
                (downloader, Some(pool))
            }
        };

        let items = self.tiers.into_iter().fold(
            TieredItemProcessor::new(downloader, self.store)
                .with_fallback_enabled(config.processor.fallback_enabled)
                .with_min_confidence(config.processor.min_confidence)
                .with_retry_policy(policy),
            |p, tier| p.with_tier(tier),
        );
        let processor = Arc::new(BatchProcessor::new(Arc::new(items), config.processor.clone()));
        let aggregator = Arc::new(ResultAggregator::new(config.report.clone()));
        let collector = BatchCollector::new(config.collector.clone());

        Ok(CaptureService {
            config,
            collector,
            processor,
            aggregator,
            notifier: self.notifier,
            pool,
        })
    }
}

pub struct CaptureService {
    config: CaptureConfig,
    collector: BatchCollector,
    processor: Arc<BatchProcessor>,
    aggregator: Arc<ResultAggregator>,
    notifier: Arc<dyn Notifier>,
    pool: Option<Arc<LeasePool<reqwest::Client>>>,
}

impl CaptureService {
    pub fn builder(config: CaptureConfig) -> CaptureServiceBuilder {
        CaptureServiceBuilder::new(config)
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Register callbacks and start the collector and the pool reaper.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.collector.register_processor(Arc::new(ReportingHandler {
            processor: self.processor.clone(),
            aggregator: self.aggregator.clone(),
            notifier: self.notifier.clone(),
        }));
        if self.config.report.progress_feedback {
            let handle = Handle::try_current().map_err(|_| {
                Error::configuration("capture service must be started inside a tokio runtime")
            })?;
            self.collector.register_progress_notifier(Arc::new(ProgressRelay {
                aggregator: self.aggregator.clone(),
                notifier: self.notifier.clone(),
                handle,
            }));
        }
        self.collector.start()?;
        if let Some(pool) = &self.pool {
            pool.start_reaper();
        }
        info!(
            fallback_enabled = self.config.processor.fallback_enabled,
            concurrency = self.config.processor.concurrency_limit,
            "capture service started"
        );
        Ok(())
    }

    /// Flush pending sessions, wait for in-flight batches and close pooled handles.
    pub async fn stop(&self) {
        self.collector.stop().await;
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
        info!("capture service stopped");
    }

    /// Submit one inbound item.
    pub fn submit(
        &self,
        submitter: &str,
        item_ref: &str,
        target: &str,
        metadata: BTreeMap<String, String>,
    ) -> BatchAddResult {
        let item = PendingItem::new(submitter, item_ref, target).with_metadata_map(metadata);
        self.collector.add(submitter, item)
    }

    pub fn force_flush(&self, submitter: &str) -> bool {
        self.collector.force_flush(submitter)
    }

    pub fn session_status(&self, submitter: &str) -> Option<SessionStatus> {
        self.collector.session_status(submitter)
    }

    pub fn collector(&self) -> &BatchCollector {
        &self.collector
    }

    pub fn processor_stats(&self) -> ProcessorStats {
        self.processor.stats()
    }

    pub fn collector_stats(&self) -> CollectorStats {
        self.collector.stats()
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.as_ref().map(|p| p.stats())
    }
}

/// Runs a flushed batch, summarizes it and reports back to the first item's target.
struct ReportingHandler {
    processor: Arc<BatchProcessor>,
    aggregator: Arc<ResultAggregator>,
    notifier: Arc<dyn Notifier>,
}

#[async_trait]
impl BatchHandler for ReportingHandler {
    async fn handle_batch(&self, submitter: &str, items: Vec<PendingItem>) -> Result<()> {
        let Some(target) = items.first().map(|i| i.target().to_string()) else {
            return Ok(());
        };
        let result = self.processor.run(submitter, items).await;
        let message = self.aggregator.format(&result);
        self.notifier.send(&target, &message).await.map_err(|e| {
            e.with_context(
                ErrorContext::new()
                    .with_source("notifier")
                    .with_submitter(submitter),
            )
        })
    }
}

/// Sends "received, waiting" acknowledgements without blocking `add`.
struct ProgressRelay {
    aggregator: Arc<ResultAggregator>,
    notifier: Arc<dyn Notifier>,
    handle: Handle,
}

impl ProgressNotifier for ProgressRelay {
    fn item_received(&self, submitter: &str, target: &str, count: usize) {
        let notifier = self.notifier.clone();
        let message = self.aggregator.progress_message(count);
        let target = target.to_string();
        let submitter = submitter.to_string();
        self.handle.spawn(async move {
            if let Err(e) = notifier.send(&target, &message).await {
                warn!(submitter = submitter.as_str(), error = %e, "progress notification failed");
            }
        });
    }
}
