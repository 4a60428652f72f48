//! Bounded batch processor.

use super::collector::PendingItem;
use super::outcome::{BatchResult, OutcomeStatus, ProcessingOutcome};
use crate::config::duration_ms;
use crate::report::FailureCategory;
use crate::tier::{ItemResolution, TierUsed, TieredItemProcessor};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Maximum items processed at once within one run.
    pub concurrency_limit: usize,
    #[serde(rename = "per_item_timeout_ms", with = "duration_ms")]
    pub per_item_timeout: Duration,
    #[serde(rename = "batch_timeout_ms", with = "duration_ms")]
    pub batch_timeout: Duration,
    /// Try the fallback tier after a retryable primary failure.
    pub fallback_enabled: bool,
    /// Extractions below this confidence are skipped.
    pub min_confidence: Option<f32>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 8,
            per_item_timeout: Duration::from_secs(120),
            batch_timeout: Duration::from_secs(600),
            fallback_enabled: true,
            min_confidence: None,
        }
    }
}

impl ProcessorConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_concurrency_limit(mut self, n: usize) -> Self {
        self.concurrency_limit = n;
        self
    }
    pub fn with_per_item_timeout(mut self, t: Duration) -> Self {
        self.per_item_timeout = t;
        self
    }
    pub fn with_batch_timeout(mut self, t: Duration) -> Self {
        self.batch_timeout = t;
        self
    }
    pub fn with_fallback_enabled(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }
    pub fn with_min_confidence(mut self, min: f32) -> Self {
        self.min_confidence = Some(min);
        self
    }
}

/// Limits for a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub concurrency: usize,
    pub per_item_timeout: Duration,
    pub batch_timeout: Duration,
}

impl From<&ProcessorConfig> for RunLimits {
    fn from(c: &ProcessorConfig) -> Self {
        Self {
            concurrency: c.concurrency_limit,
            per_item_timeout: c.per_item_timeout,
            batch_timeout: c.batch_timeout,
        }
    }
}

/// Processes one item to a terminal resolution.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process(&self, item: &PendingItem) -> ItemResolution;
}

#[async_trait]
impl ItemProcessor for TieredItemProcessor {
    async fn process(&self, item: &PendingItem) -> ItemResolution {
        TieredItemProcessor::process(self, item).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierUsage {
    pub primary: u64,
    pub fallback: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessorStats {
    pub batches: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub avg_latency: Duration,
    pub tier_usage: TierUsage,
    pub item_timeouts: u64,
    pub batch_timeouts: u64,
}

#[derive(Default)]
struct AtomicStats {
    batches: AtomicU64,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    latency_ms_total: AtomicU64,
    primary: AtomicU64,
    fallback: AtomicU64,
    item_timeouts: AtomicU64,
    batch_timeouts: AtomicU64,
}

impl AtomicStats {
    fn record(&self, result: &BatchResult) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        for o in result.outcomes() {
            self.processed.fetch_add(1, Ordering::Relaxed);
            self.latency_ms_total
                .fetch_add(o.duration().as_millis() as u64, Ordering::Relaxed);
            match o.status() {
                OutcomeStatus::Success => self.succeeded.fetch_add(1, Ordering::Relaxed),
                OutcomeStatus::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
                OutcomeStatus::Skipped => self.skipped.fetch_add(1, Ordering::Relaxed),
            };
            match o.tier() {
                TierUsed::Primary => {
                    self.primary.fetch_add(1, Ordering::Relaxed);
                }
                TierUsed::Fallback => {
                    self.fallback.fetch_add(1, Ordering::Relaxed);
                }
                TierUsed::None => {}
            }
        }
    }

    fn to_stats(&self) -> ProcessorStats {
        let processed = self.processed.load(Ordering::Relaxed);
        let total_ms = self.latency_ms_total.load(Ordering::Relaxed);
        ProcessorStats {
            batches: self.batches.load(Ordering::Relaxed),
            processed,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            avg_latency: if processed == 0 {
                Duration::ZERO
            } else {
                Duration::from_millis(total_ms / processed)
            },
            tier_usage: TierUsage {
                primary: self.primary.load(Ordering::Relaxed),
                fallback: self.fallback.load(Ordering::Relaxed),
            },
            item_timeouts: self.item_timeouts.load(Ordering::Relaxed),
            batch_timeouts: self.batch_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Fans a batch out to an [`ItemProcessor`] under a concurrency limit, a
/// per-item timeout and a batch timeout.
///
/// Every run returns exactly one outcome per input item. A batch timeout keeps
/// outcomes already recorded and stamps the rest `Failed(timeout)`.
pub struct BatchProcessor {
    items: Arc<dyn ItemProcessor>,
    config: ProcessorConfig,
    stats: AtomicStats,
}

impl BatchProcessor {
    pub fn new(items: Arc<dyn ItemProcessor>, config: ProcessorConfig) -> Self {
        Self {
            items,
            config,
            stats: AtomicStats::default(),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub async fn run(&self, submitter: &str, batch: Vec<PendingItem>) -> BatchResult {
        self.run_with(submitter, batch, RunLimits::from(&self.config)).await
    }

    pub async fn run_with(&self, submitter: &str, batch: Vec<PendingItem>, limits: RunLimits) -> BatchResult {
        let started_at = SystemTime::now();
        let start = Instant::now();
        info!(submitter, batch_size = batch.len(), concurrency = limits.concurrency, "batch run started");

        if limits.concurrency == 0 {
            error!(submitter, "concurrency gate has no capacity, failing every item");
            let outcomes = batch
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    ProcessingOutcome::failed(
                        i,
                        item.id(),
                        FailureCategory::Internal,
                        "processing gate unavailable",
                        TierUsed::None,
                        Duration::ZERO,
                    )
                })
                .collect();
            return self.finish(submitter, outcomes, started_at, start);
        }

        let mut slots: Vec<Option<ProcessingOutcome>> = vec![None; batch.len()];
        let processor = &self.items;
        let per_item = limits.per_item_timeout;
        let stats = &self.stats;

        let drive = async {
            // Items are cloned in: the run must stay `Send` inside spawned handler tasks.
            let mut runs = stream::iter(batch.iter().cloned().enumerate())
                .map(move |(index, item)| async move {
                    let item = &item;
                    let t0 = Instant::now();
                    let attempt = tokio::time::timeout(per_item, processor.process(item));
                    let outcome = match AssertUnwindSafe(attempt).catch_unwind().await {
                        Ok(Ok(resolution)) => to_outcome(index, item, resolution, t0.elapsed()),
                        Ok(Err(_)) => {
                            stats.item_timeouts.fetch_add(1, Ordering::Relaxed);
                            warn!(item_id = %item.id(), timeout_ms = per_item.as_millis() as u64, "item timed out");
                            ProcessingOutcome::failed(
                                index,
                                item.id(),
                                FailureCategory::Timeout,
                                format!("item timeout after {}ms", per_item.as_millis()),
                                TierUsed::None,
                                t0.elapsed(),
                            )
                        }
                        Err(panic) => {
                            let message = panic_message(panic.as_ref());
                            error!(item_id = %item.id(), panic = message.as_str(), "item processing panicked");
                            ProcessingOutcome::failed(
                                index,
                                item.id(),
                                FailureCategory::Internal,
                                message,
                                TierUsed::None,
                                t0.elapsed(),
                            )
                        }
                    };
                    (index, outcome)
                })
                .buffer_unordered(limits.concurrency);
            while let Some((index, outcome)) = runs.next().await {
                slots[index] = Some(outcome);
            }
        };

        if tokio::time::timeout(limits.batch_timeout, drive).await.is_err() {
            self.stats.batch_timeouts.fetch_add(1, Ordering::Relaxed);
            let pending = slots.iter().filter(|s| s.is_none()).count();
            warn!(
                submitter,
                pending,
                timeout_ms = limits.batch_timeout.as_millis() as u64,
                "batch timed out, stamping unfinished items"
            );
        }

        let elapsed = start.elapsed();
        let outcomes = slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    ProcessingOutcome::failed(
                        i,
                        batch[i].id(),
                        FailureCategory::Timeout,
                        format!("batch timeout after {}ms", limits.batch_timeout.as_millis()),
                        TierUsed::None,
                        elapsed,
                    )
                })
            })
            .collect();
        self.finish(submitter, outcomes, started_at, start)
    }

    fn finish(
        &self,
        submitter: &str,
        outcomes: Vec<ProcessingOutcome>,
        started_at: SystemTime,
        start: Instant,
    ) -> BatchResult {
        let result = BatchResult::from_outcomes(submitter, outcomes, started_at, start.elapsed());
        self.stats.record(&result);
        info!(
            submitter,
            batch_size = result.total(),
            succeeded = result.success_count(),
            failed = result.failure_count(),
            skipped = result.skipped_count(),
            duration_ms = result.elapsed().as_millis() as u64,
            "batch run finished"
        );
        result
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats.to_stats()
    }
}

fn to_outcome(index: usize, item: &PendingItem, resolution: ItemResolution, took: Duration) -> ProcessingOutcome {
    match resolution {
        ItemResolution::Stored {
            record,
            location,
            tier,
        } => ProcessingOutcome::success(index, item.id(), record, location, tier, took),
        ItemResolution::Skipped { reason, tier } => {
            ProcessingOutcome::skipped(index, item.id(), reason, tier, took)
        }
        ItemResolution::Failed { error, tier } => ProcessingOutcome::failed(
            index,
            item.id(),
            FailureCategory::from_error(&error),
            error.message(),
            tier,
            took,
        ),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("internal error: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("internal error: {s}")
    } else {
        "internal error".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ExtractedRecord;
    use crate::Error;

    struct Fixed;

    #[async_trait]
    impl ItemProcessor for Fixed {
        async fn process(&self, item: &PendingItem) -> ItemResolution {
            match item.item_ref() {
                "panic" => panic!("extractor exploded"),
                "bad" => ItemResolution::Failed {
                    error: Error::invalid_input("image too blurry"),
                    tier: TierUsed::Primary,
                },
                "skip" => ItemResolution::Skipped {
                    reason: "not a business card".into(),
                    tier: TierUsed::Primary,
                },
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    unreachable!("per-item timeout should fire first")
                }
                _ => ItemResolution::Stored {
                    record: ExtractedRecord::new(),
                    location: "loc".into(),
                    tier: TierUsed::Primary,
                },
            }
        }
    }

    fn items(refs: &[&str]) -> Vec<PendingItem> {
        refs.iter().map(|r| PendingItem::new("u1", *r, "chat")).collect()
    }

    #[tokio::test]
    async fn test_one_outcome_per_item_despite_panic() {
        let p = BatchProcessor::new(Arc::new(Fixed), ProcessorConfig::default());
        let r = p.run("u1", items(&["ok", "panic", "bad", "skip"])).await;
        assert_eq!(r.total(), 4);
        let statuses: Vec<OutcomeStatus> = r.outcomes().iter().map(|o| o.status()).collect();
        assert_eq!(
            statuses,
            vec![
                OutcomeStatus::Success,
                OutcomeStatus::Failed,
                OutcomeStatus::Failed,
                OutcomeStatus::Skipped
            ]
        );
        assert_eq!(r.outcomes()[1].failure().unwrap().0, FailureCategory::Internal);
        assert_eq!(r.outcomes()[2].failure().unwrap().0, FailureCategory::Quality);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_item_timeout_only_hits_slow_item() {
        let config = ProcessorConfig::new().with_per_item_timeout(Duration::from_secs(1));
        let p = BatchProcessor::new(Arc::new(Fixed), config);
        let r = p.run("u1", items(&["ok", "slow", "ok"])).await;
        assert_eq!(r.success_count(), 2);
        assert_eq!(r.outcomes()[1].failure().unwrap().0, FailureCategory::Timeout);
        assert_eq!(p.stats().item_timeouts, 1);
    }

    #[tokio::test]
    async fn test_zero_concurrency_fails_everything_internally() {
        let p = BatchProcessor::new(Arc::new(Fixed), ProcessorConfig::new().with_concurrency_limit(0));
        let r = p.run("u1", items(&["ok", "ok"])).await;
        assert_eq!(r.failure_count(), 2);
        assert!(r
            .outcomes()
            .iter()
            .all(|o| o.failure().map(|f| f.0) == Some(FailureCategory::Internal)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_can_be_spawned() {
        let p = Arc::new(BatchProcessor::new(Arc::new(Fixed), ProcessorConfig::default()));
        let batch = items(&["ok", "skip", "ok"]);
        let runner = p.clone();
        let r = tokio::spawn(async move { runner.run("u1", batch).await })
            .await
            .unwrap();
        assert_eq!(r.total(), 3);
        assert_eq!(r.success_count(), 2);
        assert_eq!(p.stats().batches, 1);
    }

    #[tokio::test]
    async fn test_stats_accumulate() {
        let p = BatchProcessor::new(Arc::new(Fixed), ProcessorConfig::default());
        p.run("u1", items(&["ok", "bad"])).await;
        p.run("u2", items(&["skip"])).await;
        let s = p.stats();
        assert_eq!(s.batches, 2);
        assert_eq!(s.processed, 3);
        assert_eq!(s.succeeded + s.failed + s.skipped, s.processed);
        assert_eq!(s.tier_usage.primary, 3);
        assert_eq!(s.tier_usage.fallback, 0);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let p = BatchProcessor::new(Arc::new(Fixed), ProcessorConfig::default());
        let r = p.run("u1", Vec::new()).await;
        assert_eq!(r.total(), 0);
        assert_eq!(p.stats().batches, 1);
    }
}
