//! # capture-batch
//!
//! Debounced batch collection and bounded multi-tier processing for
//! chat-driven document capture.
//!
//! ## Overview
//!
//! Users send photos in quick succession. Instead of answering each photo, the
//! pipeline waits for the burst to go quiet, processes the whole burst with a
//! bounded number of parallel workers, and replies with one report.
//!
//! ## Core Behavior
//!
//! - **Debounced**: the quiet period after the *last* item closes a batch; a size cap closes it early
//! - **Bounded**: at most `concurrency_limit` items of a batch are processed at once
//! - **Tiered**: a fast primary tier, with a thorough fallback on retryable failures only
//! - **Complete**: every item of a batch yields exactly one outcome, even on timeout or panic
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use capture_batch::collaborators::Extractor;
//! use capture_batch::tier::ExtractorTier;
//! use capture_batch::{CaptureConfig, CaptureService};
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! # async fn run(fast: Arc<dyn Extractor>, thorough: Arc<dyn Extractor>) -> capture_batch::Result<()> {
//! let service = CaptureService::builder(CaptureConfig::load(None)?)
//!     .tier(Arc::new(ExtractorTier::new("fast", fast)))
//!     .tier(Arc::new(ExtractorTier::new("thorough", thorough)))
//!     .build()?;
//! service.start()?;
//!
//! service.submit("user-1", "https://files.example.com/card-1.jpg", "chat-1", BTreeMap::new());
//! // ... later
//! service.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`batch`] | Debounced collector and bounded batch processor |
//! | [`tier`] | Tier abstraction and the per-item fallback chain |
//! | [`report`] | Statistics, failure classification and report rendering |
//! | [`pool`] | Keyed lease pool of reusable handles |
//! | [`resilience`] | Retry with backoff and token-bucket rate limiting |
//! | [`collaborators`] | Downloader, extractor, store and notifier interfaces |
//! | [`service`] | Service object wiring everything together |
//! | [`config`] | YAML and environment configuration |
//! | [`telemetry`] | Tracing setup and stats logging |

pub mod batch;
pub mod collaborators;
pub mod config;
pub mod pool;
pub mod report;
pub mod resilience;
pub mod service;
pub mod telemetry;
pub mod tier;

// Re-export main types for convenience
pub use batch::{BatchAddResult, BatchCollector, BatchProcessor, BatchResult, PendingItem};
pub use config::CaptureConfig;
pub use report::{FailureCategory, Report, ResultAggregator};
pub use service::{CaptureService, CaptureServiceBuilder};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};

/// Error classes driving retry and fallback
pub mod error_code;
pub use error_code::ErrorClass;
