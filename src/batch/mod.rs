//! Batch collection and execution.
//!
//! # Batch Module
//!
//! Groups rapid-fire items from one submitter into a single batch and runs the
//! batch with bounded concurrency.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`BatchCollector`] | Per-submitter debounced collection, flush on quiet period or size cap |
//! | [`CollectorConfig`] | Debounce window, max batch size, session age and reaper interval |
//! | [`PendingItem`] | One submitted item with its delivery target and metadata |
//! | [`BatchProcessor`] | Runs a batch under concurrency, per-item and batch timeouts |
//! | [`BatchResult`] | Ordered outcomes plus counts, derived once per run |
//!
//! ## Example
//!
//! ```rust,no_run
//! use capture_batch::batch::{BatchCollector, CollectorConfig, PendingItem};
//! use std::time::Duration;
//!
//! # async fn demo(handler: std::sync::Arc<dyn capture_batch::batch::BatchHandler>) -> capture_batch::Result<()> {
//! let collector = BatchCollector::new(
//!     CollectorConfig::new().with_debounce_window(Duration::from_secs(2)),
//! );
//! collector.register_processor(handler);
//! collector.start()?;
//!
//! let added = collector.add("user-1", PendingItem::new("user-1", "file-42", "chat-7"));
//! assert!(added.accepted());
//! # Ok(())
//! # }
//! ```
//!
//! ## Flush triggers
//!
//! - **Debounce**: no new item for `debounce_window` since the last one
//! - **Size cap**: the item that reaches `max_batch_size` flushes inside `add`
//! - **Reaper**: sessions older than `max_session_age` are force-flushed
//! - **Forced / shutdown**: [`BatchCollector::force_flush`] and [`BatchCollector::stop`]

mod collector;
mod executor;
mod outcome;

pub use collector::{
    BatchAddResult, BatchCollector, BatchHandler, CollectorConfig, CollectorStats, PendingItem,
    ProgressNotifier, RejectReason, SessionStatus,
};
pub use executor::{
    BatchProcessor, ItemProcessor, ProcessorConfig, ProcessorStats, RunLimits, TierUsage,
};
pub use outcome::{BatchResult, OutcomeStatus, ProcessingOutcome};
