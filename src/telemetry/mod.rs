//! Logging setup and periodic stats reporting.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`init_tracing`] | Installs a `tracing-subscriber` fmt subscriber with `EnvFilter` |
//! | [`log_stats`] | Emits collector, processor and pool counters as one structured event |
//!
//! The filter comes from `RUST_LOG`, falling back to the given default
//! directive (`info` in the binary).

use crate::service::CaptureService;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

pub fn log_stats(service: &CaptureService) {
    let c = service.collector_stats();
    let p = service.processor_stats();
    info!(
        items_collected = c.items_collected,
        batches_flushed = c.batches_flushed,
        avg_batch_size = c.average_batch_size,
        active_sessions = c.active_sessions,
        failed_handoffs = c.failed_handoffs,
        processed = p.processed,
        succeeded = p.succeeded,
        failed = p.failed,
        skipped = p.skipped,
        avg_latency_ms = p.avg_latency.as_millis() as u64,
        primary_tier = p.tier_usage.primary,
        fallback_tier = p.tier_usage.fallback,
        "capture stats"
    );
    if let Some(pool) = service.pool_stats() {
        info!(
            created = pool.created,
            closed = pool.closed,
            idle = pool.idle,
            leased = pool.leased,
            lease_timeouts = pool.lease_timeouts,
            retries = pool.retries,
            "lease pool stats"
        );
    }
}
