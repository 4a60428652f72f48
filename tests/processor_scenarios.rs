//! Batch processor guarantees: bounded concurrency, complete outcomes,
//! batch timeouts and tier fallback.

use async_trait::async_trait;
use bytes::Bytes;
use capture_batch::batch::{BatchProcessor, ItemProcessor, OutcomeStatus, PendingItem, ProcessorConfig};
use capture_batch::collaborators::{Downloader, ExtractedRecord, Extraction, MemoryStore};
use capture_batch::report::FailureCategory;
use capture_batch::tier::{ItemResolution, Tier, TierUsed, TieredItemProcessor};
use capture_batch::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn batch(n: usize) -> Vec<PendingItem> {
    (0..n)
        .map(|i| PendingItem::new("u1", format!("item-{i}"), "chat-1"))
        .collect()
}

fn stored(name: &str) -> ItemResolution {
    ItemResolution::Stored {
        record: ExtractedRecord::new().with_name(name),
        location: format!("mem://{name}"),
        tier: TierUsed::Primary,
    }
}

/// Sleeps for `latency` and tracks how many calls overlap.
struct Sleeper {
    latency: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Sleeper {
    fn new(latency: Duration) -> Self {
        Self {
            latency,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ItemProcessor for Sleeper {
    async fn process(&self, item: &PendingItem) -> ItemResolution {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        stored(item.item_ref())
    }
}

#[tokio::test(start_paused = true)]
async fn never_exceeds_concurrency_limit() {
    let sleeper = Arc::new(Sleeper::new(Duration::from_millis(50)));
    let processor = BatchProcessor::new(sleeper.clone(), ProcessorConfig::new().with_concurrency_limit(3));

    let result = processor.run("u1", batch(10)).await;

    assert_eq!(result.success_count(), 10);
    assert_eq!(sleeper.peak.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn batch_timeout_keeps_finished_outcomes_and_stamps_the_rest() {
    let processor = BatchProcessor::new(
        Arc::new(Sleeper::new(Duration::from_millis(1500))),
        ProcessorConfig::new()
            .with_concurrency_limit(1)
            .with_per_item_timeout(Duration::from_secs(10))
            .with_batch_timeout(Duration::from_secs(2)),
    );

    let result = processor.run("u1", batch(3)).await;

    assert_eq!(result.total(), 3);
    assert_eq!(result.success_count(), 1);
    assert_eq!(result.failure_count(), 2);
    assert_eq!(result.outcomes()[0].status(), OutcomeStatus::Success);
    for o in &result.outcomes()[1..] {
        let (category, message) = o.failure().unwrap();
        assert_eq!(category, FailureCategory::Timeout);
        assert!(message.contains("batch timeout"), "{message}");
    }
    assert_eq!(processor.stats().batch_timeouts, 1);
}

/// Resolves by item position: panics, fails, skips or stores.
struct Mixed;

#[async_trait]
impl ItemProcessor for Mixed {
    async fn process(&self, item: &PendingItem) -> ItemResolution {
        match item.item_ref() {
            "item-1" => panic!("extractor exploded"),
            "item-2" => ItemResolution::Failed {
                error: Error::transient("connection reset"),
                tier: TierUsed::Primary,
            },
            "item-3" => ItemResolution::Skipped {
                reason: "not a business card".into(),
                tier: TierUsed::Primary,
            },
            other => stored(other),
        }
    }
}

#[tokio::test]
async fn every_item_gets_exactly_one_outcome_in_input_order() {
    let processor = BatchProcessor::new(Arc::new(Mixed), ProcessorConfig::new().with_concurrency_limit(2));
    let items = batch(6);
    let ids: Vec<_> = items.iter().map(|i| i.id()).collect();

    let result = processor.run("u1", items).await;

    assert_eq!(result.total(), 6);
    for (i, o) in result.outcomes().iter().enumerate() {
        assert_eq!(o.index(), i);
        assert_eq!(o.item_id(), ids[i]);
    }
    assert_eq!(result.outcomes()[1].failure().unwrap().0, FailureCategory::Internal);
    assert_eq!(result.outcomes()[2].failure().unwrap().0, FailureCategory::Network);
    assert_eq!(result.outcomes()[3].skip_reason(), Some("not a business card"));
    assert_eq!(result.success_count(), 3);
    assert_eq!(
        result.success_count() + result.failure_count() + result.skipped_count(),
        result.total()
    );

    let stats = processor.stats();
    assert_eq!(stats.processed, 6);
    assert_eq!(stats.succeeded + stats.failed + stats.skipped, stats.processed);
}

struct EchoDownloader;

#[async_trait]
impl Downloader for EchoDownloader {
    async fn fetch(&self, item_ref: &str) -> capture_batch::Result<Bytes> {
        Ok(Bytes::copy_from_slice(item_ref.as_bytes()))
    }
}

struct ScriptedTier {
    name: &'static str,
    fail_with: Option<fn() -> Error>,
    calls: AtomicUsize,
}

impl ScriptedTier {
    fn ok(name: &'static str) -> Self {
        Self {
            name,
            fail_with: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn failing(name: &'static str, fail_with: fn() -> Error) -> Self {
        Self {
            name,
            fail_with: Some(fail_with),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Tier for ScriptedTier {
    fn name(&self) -> &str {
        self.name
    }

    async fn attempt(&self, _payload: &Bytes) -> capture_batch::Result<Extraction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.fail_with {
            Some(f) => Err(f()),
            None => Ok(Extraction::Record(
                ExtractedRecord::new().with_name("Ada").with_company("Analytical"),
            )),
        }
    }
}

#[tokio::test]
async fn transient_primary_failure_falls_back_and_succeeds() {
    let primary = Arc::new(ScriptedTier::failing("fast", || Error::transient("upstream 503")));
    let fallback = Arc::new(ScriptedTier::ok("thorough"));
    let store = Arc::new(MemoryStore::new());
    let items = TieredItemProcessor::new(Arc::new(EchoDownloader), store.clone())
        .with_tier(primary.clone())
        .with_tier(fallback.clone());
    let processor = BatchProcessor::new(Arc::new(items), ProcessorConfig::new());

    let result = processor.run("u1", batch(1)).await;

    let outcome = &result.outcomes()[0];
    assert_eq!(outcome.status(), OutcomeStatus::Success);
    assert_eq!(outcome.tier(), TierUsed::Fallback);
    assert_eq!(outcome.location(), Some("memory://records/1"));
    assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.len(), 1);
    assert_eq!(processor.stats().tier_usage.fallback, 1);
}

#[tokio::test]
async fn permanent_primary_failure_never_reaches_fallback() {
    let primary = Arc::new(ScriptedTier::failing("fast", || {
        Error::invalid_input("unsupported format: image/tiff")
    }));
    let fallback = Arc::new(ScriptedTier::ok("thorough"));
    let items = TieredItemProcessor::new(Arc::new(EchoDownloader), Arc::new(MemoryStore::new()))
        .with_tier(primary.clone())
        .with_tier(fallback.clone());
    let processor = BatchProcessor::new(Arc::new(items), ProcessorConfig::new());

    let result = processor.run("u1", batch(1)).await;

    let outcome = &result.outcomes()[0];
    assert_eq!(outcome.status(), OutcomeStatus::Failed);
    assert_eq!(outcome.tier(), TierUsed::Primary);
    assert_eq!(outcome.failure().unwrap().0, FailureCategory::Format);
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
}
