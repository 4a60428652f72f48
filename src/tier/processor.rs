use super::Tier;
use crate::batch::PendingItem;
use crate::collaborators::{Downloader, ExtractedRecord, Extraction, Store};
use crate::resilience::retry::{with_retry, RetryPolicy};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which tier produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierUsed {
    Primary,
    Fallback,
    None,
}

impl TierUsed {
    fn for_index(index: usize) -> Self {
        if index == 0 {
            TierUsed::Primary
        } else {
            TierUsed::Fallback
        }
    }
}

/// Terminal result of running one item through the tier chain.
#[derive(Debug)]
pub enum ItemResolution {
    Stored {
        record: ExtractedRecord,
        location: String,
        tier: TierUsed,
    },
    Skipped {
        reason: String,
        tier: TierUsed,
    },
    Failed {
        error: Error,
        tier: TierUsed,
    },
}

/// Runs one item through an ordered list of tiers.
///
/// The payload is fetched before each tier's attempt. A tier failure whose
/// class is fallbackable moves on to the next tier when fallback is enabled;
/// anything else ends the chain.
pub struct TieredItemProcessor {
    downloader: Arc<dyn Downloader>,
    store: Arc<dyn Store>,
    tiers: Vec<Arc<dyn Tier>>,
    fallback_enabled: bool,
    min_confidence: Option<f32>,
    retry: RetryPolicy,
}

impl TieredItemProcessor {
    pub fn new(downloader: Arc<dyn Downloader>, store: Arc<dyn Store>) -> Self {
        Self {
            downloader,
            store,
            tiers: Vec::new(),
            fallback_enabled: true,
            min_confidence: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_tier(mut self, tier: Arc<dyn Tier>) -> Self {
        self.tiers.push(tier);
        self
    }

    pub fn with_fallback_enabled(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    /// Records below this confidence are skipped instead of stored.
    pub fn with_min_confidence(mut self, min: Option<f32>) -> Self {
        self.min_confidence = min;
        self
    }

    /// Policy used when persisting records.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    pub async fn process(&self, item: &PendingItem) -> ItemResolution {
        let mut last_failure: Option<(Error, TierUsed)> = None;

        for (index, tier) in self.tiers.iter().enumerate() {
            if index > 0 && !self.fallback_enabled {
                break;
            }
            let used = TierUsed::for_index(index);
            let has_next = index + 1 < self.tiers.len() && self.fallback_enabled;

            let attempt = match self.downloader.fetch(item.item_ref()).await {
                Ok(payload) => tier.attempt(&payload).await,
                Err(e) => Err(e),
            };

            match attempt {
                Ok(Extraction::Record(record)) => return self.finish(item, record, used).await,
                Ok(Extraction::Rejected { reason }) => {
                    debug!(item_id = %item.id(), tier = tier.name(), reason = reason.as_str(), "item rejected");
                    return ItemResolution::Skipped { reason, tier: used };
                }
                Err(error) if error.is_fallbackable() && has_next => {
                    warn!(
                        item_id = %item.id(),
                        tier = tier.name(),
                        error_class = error.class().name(),
                        "tier failed, falling back"
                    );
                    last_failure = Some((error, used));
                }
                Err(error) => {
                    debug!(item_id = %item.id(), tier = tier.name(), error = %error, "tier chain ended");
                    return ItemResolution::Failed { error, tier: used };
                }
            }
        }

        match last_failure {
            Some((error, tier)) => ItemResolution::Failed { error, tier },
            None => ItemResolution::Failed {
                error: Error::internal("no processing tier configured"),
                tier: TierUsed::None,
            },
        }
    }

    async fn finish(&self, item: &PendingItem, record: ExtractedRecord, tier: TierUsed) -> ItemResolution {
        if let (Some(min), Some(conf)) = (self.min_confidence, record.confidence) {
            if conf < min {
                return ItemResolution::Skipped {
                    reason: format!("low confidence ({conf:.2})"),
                    tier,
                };
            }
        }
        let store = &self.store;
        let rec = &record;
        let persisted: Result<String> = with_retry(
            &self.retry,
            self.retry.config().max_retries,
            "persist",
            move |_| store.persist(rec),
        )
        .await;
        match persisted {
            Ok(location) => {
                debug!(item_id = %item.id(), location = location.as_str(), "record stored");
                ItemResolution::Stored {
                    record,
                    location,
                    tier,
                }
            }
            Err(error) => ItemResolution::Failed { error, tier },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{Extractor, MemoryStore};
    use crate::error_code::ErrorClass;
    use crate::resilience::retry::RetryConfig;
    use crate::tier::ExtractorTier;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct StaticDownloader;

    #[async_trait]
    impl Downloader for StaticDownloader {
        async fn fetch(&self, _item_ref: &str) -> Result<Bytes> {
            Ok(Bytes::from_static(b"jpeg"))
        }
    }

    struct Scripted {
        calls: AtomicU32,
        respond: fn() -> Result<Extraction>,
    }

    impl Scripted {
        fn new(respond: fn() -> Result<Extraction>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                respond,
            })
        }
    }

    #[async_trait]
    impl Extractor for Scripted {
        async fn analyze(&self, _payload: &Bytes) -> Result<Extraction> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.respond)()
        }
    }

    fn record() -> Result<Extraction> {
        Ok(Extraction::Record(
            ExtractedRecord::new().with_name("Ada").with_confidence(0.95),
        ))
    }

    fn processor(primary: Arc<Scripted>, fallback: Arc<Scripted>) -> TieredItemProcessor {
        TieredItemProcessor::new(Arc::new(StaticDownloader), Arc::new(MemoryStore::new()))
            .with_tier(Arc::new(ExtractorTier::new("fast", primary)))
            .with_tier(Arc::new(ExtractorTier::new("thorough", fallback)))
            .with_retry_policy(RetryPolicy::new(
                RetryConfig::new()
                    .with_delays(Duration::from_millis(1), Duration::from_millis(2))
                    .with_jitter(false),
            ))
    }

    fn item() -> PendingItem {
        PendingItem::new("u1", "file-1", "chat-1")
    }

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let (p, f) = (Scripted::new(record), Scripted::new(record));
        let out = processor(p.clone(), f.clone()).process(&item()).await;
        assert!(matches!(out, ItemResolution::Stored { tier: TierUsed::Primary, .. }));
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_falls_back() {
        let p = Scripted::new(|| Err(Error::transient("503 from upstream")));
        let f = Scripted::new(record);
        let out = processor(p, f.clone()).process(&item()).await;
        match out {
            ItemResolution::Stored { tier, location, .. } => {
                assert_eq!(tier, TierUsed::Fallback);
                assert_eq!(location, "memory://records/1");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_short_circuits() {
        let p = Scripted::new(|| Err(Error::invalid_input("malformed image")));
        let f = Scripted::new(record);
        let out = processor(p, f.clone()).process(&item()).await;
        match out {
            ItemResolution::Failed { error, tier } => {
                assert_eq!(tier, TierUsed::Primary);
                assert_eq!(error.class(), ErrorClass::InvalidInput);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fallback_disabled() {
        let p = Scripted::new(|| Err(Error::transient("network reset")));
        let f = Scripted::new(record);
        let out = processor(p, f.clone())
            .with_fallback_enabled(false)
            .process(&item())
            .await;
        assert!(matches!(out, ItemResolution::Failed { tier: TierUsed::Primary, .. }));
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_both_tiers_fail_reports_fallback() {
        let p = Scripted::new(|| Err(Error::transient("network reset")));
        let f = Scripted::new(|| Err(Error::transient("network reset")));
        let out = processor(p, f).process(&item()).await;
        assert!(matches!(out, ItemResolution::Failed { tier: TierUsed::Fallback, .. }));
    }

    #[tokio::test]
    async fn test_rejected_and_low_confidence_are_skipped() {
        let p = Scripted::new(|| {
            Ok(Extraction::Rejected {
                reason: "not a business card".into(),
            })
        });
        let out = processor(p, Scripted::new(record)).process(&item()).await;
        assert!(matches!(out, ItemResolution::Skipped { .. }));

        let low = Scripted::new(|| Ok(Extraction::Record(ExtractedRecord::new().with_confidence(0.2))));
        let out = processor(low, Scripted::new(record))
            .with_min_confidence(Some(0.5))
            .process(&item())
            .await;
        match out {
            ItemResolution::Skipped { reason, .. } => assert!(reason.starts_with("low confidence")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_tiers_is_internal() {
        let p = TieredItemProcessor::new(Arc::new(StaticDownloader), Arc::new(MemoryStore::new()));
        assert!(matches!(
            p.process(&item()).await,
            ItemResolution::Failed { tier: TierUsed::None, .. }
        ));
    }
}
