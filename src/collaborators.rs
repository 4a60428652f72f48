//! Narrow interfaces to the systems around the pipeline, plus the stock
//! implementations shipped with the crate.
//!
//! | Trait | Stock implementations |
//! |-------|-----------------------|
//! | [`Downloader`] | [`HttpDownloader`] (lease pool + reqwest) |
//! | [`Extractor`] | none; bound to a tier via [`crate::tier::ExtractorTier`] |
//! | [`Store`] | [`MemoryStore`] |
//! | [`Notifier`] | [`LogNotifier`], [`MemoryNotifier`] |

use crate::error_code::ErrorClass;
use crate::pool::LeasePool;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Structured record produced by an extractor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub name: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    /// Remaining extracted fields (email, phone, address, ...).
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Extractor confidence in `[0, 1]`.
    pub confidence: Option<f32>,
}

impl ExtractedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }
}

/// What an extractor made of a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Record(ExtractedRecord),
    /// The payload is readable but not something to extract (e.g. not a card).
    Rejected { reason: String },
}

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(&self, item_ref: &str) -> Result<Bytes>;
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn analyze(&self, payload: &Bytes) -> Result<Extraction>;
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a record and return where it lives.
    async fn persist(&self, record: &ExtractedRecord) -> Result<String>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, target: &str, message: &str) -> Result<()>;
}

/// Fetches item references as URLs through a pool of HTTP clients keyed by host.
pub struct HttpDownloader {
    pool: Arc<LeasePool<reqwest::Client>>,
    max_retries: u32,
    max_bytes: usize,
}

impl HttpDownloader {
    pub fn new(pool: Arc<LeasePool<reqwest::Client>>) -> Self {
        Self {
            pool,
            max_retries: 3,
            max_bytes: 5 * 1024 * 1024,
        }
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_max_bytes(mut self, n: usize) -> Self {
        self.max_bytes = n;
        self
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, item_ref: &str) -> Result<Bytes> {
        let url = reqwest::Url::parse(item_ref).map_err(|e| {
            Error::invalid_input(format!("unsupported item reference: {e}"))
                .with_context(ErrorContext::new().with_source("downloader").with_details(item_ref))
        })?;
        let key = url.host_str().unwrap_or("default").to_string();
        let max_bytes = self.max_bytes;

        let payload = self
            .pool
            .with_retry(&key, self.max_retries, |client| {
                let url = url.clone();
                async move {
                    let mut resp = client.get(url).send().await?;
                    let status = resp.status();
                    if !status.is_success() {
                        return Err(Error::upstream(
                            ErrorClass::from_http_status(status.as_u16()),
                            format!("download failed with status {}", status.as_u16()),
                        )
                        .with_context(ErrorContext::new().with_source("downloader")));
                    }
                    let too_large = |len: u64| {
                        Error::invalid_input(format!(
                            "payload too large: {len} bytes (max {max_bytes})"
                        ))
                        .with_context(ErrorContext::new().with_source("downloader"))
                    };
                    if let Some(len) = resp.content_length() {
                        if len > max_bytes as u64 {
                            return Err(too_large(len));
                        }
                    }
                    let mut body = BytesMut::new();
                    while let Some(chunk) = resp.chunk().await? {
                        if body.len() + chunk.len() > max_bytes {
                            return Err(too_large((body.len() + chunk.len()) as u64));
                        }
                        body.extend_from_slice(&chunk);
                    }
                    Ok(body.freeze())
                }
            })
            .await?;
        debug!(host = key.as_str(), bytes = payload.len(), "downloaded item payload");
        Ok(payload)
    }
}

/// Keeps records in memory; locations look like `memory://records/<n>`.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<ExtractedRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExtractedRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn persist(&self, record: &ExtractedRecord) -> Result<String> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| Error::internal("memory store lock poisoned"))?;
        records.push(record.clone());
        Ok(format!("memory://records/{}", records.len()))
    }
}

/// Writes every message to the `tracing` log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, target: &str, message: &str) -> Result<()> {
        info!(target_id = target, "{}", message);
        Ok(())
    }
}

/// Collects sent messages for inspection.
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(target, message)` pairs in send order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, target: &str, message: &str) -> Result<()> {
        self.sent
            .lock()
            .map_err(|_| Error::internal("memory notifier lock poisoned"))?
            .push((target.to_string(), message.to_string()));
        Ok(())
    }
}
