//! Debounced per-submitter batch collector.

use crate::config::duration_ms;
use crate::{Error, ErrorContext, Result};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Quiet period after the last item before a batch closes.
    #[serde(rename = "debounce_window_ms", with = "duration_ms")]
    pub debounce_window: Duration,
    pub max_batch_size: usize,
    /// Sessions older than this are force-flushed by the reaper.
    #[serde(rename = "max_session_age_ms", with = "duration_ms")]
    pub max_session_age: Duration,
    #[serde(rename = "reaper_interval_ms", with = "duration_ms")]
    pub reaper_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_secs(5),
            max_batch_size: 20,
            max_session_age: Duration::from_secs(600),
            reaper_interval: Duration::from_secs(300),
        }
    }
}

impl CollectorConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_debounce_window(mut self, w: Duration) -> Self {
        self.debounce_window = w;
        self
    }
    pub fn with_max_batch_size(mut self, s: usize) -> Self {
        self.max_batch_size = s;
        self
    }
    pub fn with_max_session_age(mut self, a: Duration) -> Self {
        self.max_session_age = a;
        self
    }
    pub fn with_reaper_interval(mut self, i: Duration) -> Self {
        self.reaper_interval = i;
        self
    }
}

/// One inbound item. Immutable after creation.
#[derive(Debug, Clone)]
pub struct PendingItem {
    id: Uuid,
    submitter: String,
    item_ref: String,
    target: String,
    arrived_at: Instant,
    received_at: SystemTime,
    metadata: BTreeMap<String, String>,
}

impl PendingItem {
    pub fn new(submitter: impl Into<String>, item_ref: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            submitter: submitter.into(),
            item_ref: item_ref.into(),
            target: target.into(),
            arrived_at: Instant::now(),
            received_at: SystemTime::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata_map(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
    pub fn submitter(&self) -> &str {
        &self.submitter
    }
    /// Opaque payload handle (file id, URL).
    pub fn item_ref(&self) -> &str {
        &self.item_ref
    }
    /// Where results for this item are delivered.
    pub fn target(&self) -> &str {
        &self.target
    }
    pub fn arrived_at(&self) -> Instant {
        self.arrived_at
    }
    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

struct BatchSession {
    submitter: String,
    items: Vec<PendingItem>,
    created_at: Instant,
    updated_at: Instant,
    timer: Option<CancellationToken>,
    flushing: bool,
}

impl BatchSession {
    fn new(submitter: &str) -> Self {
        let now = Instant::now();
        Self {
            submitter: submitter.to_string(),
            items: Vec::new(),
            created_at: now,
            updated_at: now,
            timer: None,
            flushing: false,
        }
    }
}

type SessionCell = Arc<Mutex<BatchSession>>;

fn lock(cell: &SessionCell) -> MutexGuard<'_, BatchSession> {
    cell.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub count: usize,
    pub age: Duration,
    pub since_last_update: Duration,
    pub flushing: bool,
    pub has_timer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotStarted,
    Stopped,
    NoProcessor,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectReason::NotStarted => "collector not started",
            RejectReason::Stopped => "collector stopped",
            RejectReason::NoProcessor => "no batch processor registered",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchAddResult {
    /// Appended; the debounce timer was (re)armed.
    Added { count: usize },
    /// Appended and the size cap flushed the batch.
    Flushed { count: usize },
    Rejected { reason: RejectReason },
}

impl BatchAddResult {
    pub fn accepted(&self) -> bool {
        !matches!(self, BatchAddResult::Rejected { .. })
    }
    pub fn flushed(&self) -> bool {
        matches!(self, BatchAddResult::Flushed { .. })
    }
    pub fn count(&self) -> usize {
        match self {
            BatchAddResult::Added { count } | BatchAddResult::Flushed { count } => *count,
            BatchAddResult::Rejected { .. } => 0,
        }
    }
}

/// Receives flushed batches. Errors are logged and the batch is discarded.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, submitter: &str, items: Vec<PendingItem>) -> Result<()>;
}

/// Called for every accepted item that did not flush its batch.
pub trait ProgressNotifier: Send + Sync {
    fn item_received(&self, submitter: &str, target: &str, count: usize);
}

#[derive(Debug, Clone, Copy)]
enum FlushTrigger {
    Debounce,
    SizeCap,
    Forced,
    Reaper,
    Shutdown,
}

impl FlushTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Debounce => "debounce",
            FlushTrigger::SizeCap => "size_cap",
            FlushTrigger::Forced => "forced",
            FlushTrigger::Reaper => "reaper",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectorStats {
    pub items_collected: u64,
    pub batches_flushed: u64,
    pub single_item_batches: u64,
    pub multi_item_batches: u64,
    pub average_batch_size: f64,
    pub size_cap_flushes: u64,
    pub reaper_flushes: u64,
    pub failed_handoffs: u64,
    pub active_sessions: usize,
}

#[derive(Default)]
struct AtomicStats {
    items_collected: AtomicU64,
    items_flushed: AtomicU64,
    batches_flushed: AtomicU64,
    single_item_batches: AtomicU64,
    multi_item_batches: AtomicU64,
    size_cap_flushes: AtomicU64,
    reaper_flushes: AtomicU64,
    failed_handoffs: AtomicU64,
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

struct Inner {
    config: CollectorConfig,
    sessions: DashMap<String, SessionCell>,
    handler: ArcSwapOption<Arc<dyn BatchHandler>>,
    progress: ArcSwapOption<Arc<dyn ProgressNotifier>>,
    runtime: ArcSwapOption<Handle>,
    lifecycle: AtomicU8,
    tasks: TaskTracker,
    reaper: Mutex<Option<CancellationToken>>,
    stats: AtomicStats,
}

/// Groups items per submitter and flushes each group once it goes quiet for
/// `debounce_window` or reaches `max_batch_size`.
///
/// All work on one session (append, timer re-arm, flush) happens under that
/// session's lock. A flush marks the session flushing and removes it from the
/// live map in the same critical section, so an item arriving afterwards opens
/// a new session.
#[derive(Clone)]
pub struct BatchCollector {
    inner: Arc<Inner>,
}

impl BatchCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: DashMap::new(),
                handler: ArcSwapOption::empty(),
                progress: ArcSwapOption::empty(),
                runtime: ArcSwapOption::empty(),
                lifecycle: AtomicU8::new(IDLE),
                tasks: TaskTracker::new(),
                reaper: Mutex::new(None),
                stats: AtomicStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.inner.config
    }

    pub fn register_processor(&self, handler: Arc<dyn BatchHandler>) {
        self.inner.handler.store(Some(Arc::new(handler)));
    }

    pub fn register_progress_notifier(&self, notifier: Arc<dyn ProgressNotifier>) {
        self.inner.progress.store(Some(Arc::new(notifier)));
    }

    /// Capture the current runtime and spawn the stale-session reaper.
    pub fn start(&self) -> Result<()> {
        let handle = Handle::try_current().map_err(|_| {
            Error::configuration_with_context(
                "collector must be started inside a tokio runtime",
                ErrorContext::new().with_source("collector"),
            )
        })?;
        match self
            .inner
            .lifecycle
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(RUNNING) => return Ok(()),
            Err(_) => return Err(Error::configuration("collector cannot be restarted after stop")),
        }
        self.inner.runtime.store(Some(Arc::new(handle.clone())));

        let token = CancellationToken::new();
        *self.inner.reaper.lock().unwrap_or_else(|p| p.into_inner()) = Some(token.clone());
        let collector = self.clone();
        let interval = self.inner.config.reaper_interval;
        handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        collector.reap_stale();
                    }
                }
            }
            debug!("session reaper stopped");
        });
        info!(
            debounce_ms = self.inner.config.debounce_window.as_millis() as u64,
            max_batch_size = self.inner.config.max_batch_size,
            "batch collector started"
        );
        Ok(())
    }

    /// Stop accepting items, flush every live session and wait for in-flight handlers.
    pub async fn stop(&self) {
        if self.inner.lifecycle.swap(STOPPED, Ordering::AcqRel) == STOPPED {
            return;
        }
        if let Some(token) = self
            .inner
            .reaper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            token.cancel();
        }
        if let Some(handle) = self.inner.runtime.load_full() {
            for cell in self.live_cells() {
                self.inner.flush_cell(&handle, &cell, None, FlushTrigger::Shutdown);
            }
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("batch collector stopped");
    }

    /// Append an item to the submitter's session. Never awaits.
    pub fn add(&self, submitter: &str, item: PendingItem) -> BatchAddResult {
        let inner = &self.inner;
        match inner.lifecycle.load(Ordering::Acquire) {
            RUNNING => {}
            STOPPED => return reject(RejectReason::Stopped),
            _ => return reject(RejectReason::NotStarted),
        }
        let Some(handle) = inner.runtime.load_full() else {
            return reject(RejectReason::NotStarted);
        };
        if inner.handler.load().is_none() {
            return reject(RejectReason::NoProcessor);
        }

        let target = item.target().to_string();
        let window = inner.config.debounce_window;
        let mut item = Some(item);
        loop {
            let cell = inner
                .sessions
                .entry(submitter.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(BatchSession::new(submitter))))
                .value()
                .clone();
            let mut session = lock(&cell);
            if session.flushing {
                // Lost a race with a flush that already unlinked this session.
                continue;
            }
            // `stop` flushes every session it can see under that session's lock;
            // checking again here keeps late items out of a stopped collector.
            if inner.lifecycle.load(Ordering::Acquire) != RUNNING {
                if session.items.is_empty() {
                    inner
                        .sessions
                        .remove_if(&session.submitter, |_, v| Arc::ptr_eq(v, &cell));
                }
                return reject(RejectReason::Stopped);
            }
            // The quiet period already elapsed but its timer has not run yet.
            if !session.items.is_empty() && session.updated_at.elapsed() >= window {
                let items = inner.begin_flush(&cell, &mut session);
                inner.dispatch(&handle, submitter, items, FlushTrigger::Debounce);
                continue;
            }

            session.items.extend(item.take());
            session.updated_at = Instant::now();
            inner.stats.items_collected.fetch_add(1, Ordering::Relaxed);
            let count = session.items.len();

            if let Some(previous) = session.timer.take() {
                previous.cancel();
            }

            if count >= inner.config.max_batch_size {
                let items = inner.begin_flush(&cell, &mut session);
                inner.stats.size_cap_flushes.fetch_add(1, Ordering::Relaxed);
                inner.dispatch(&handle, submitter, items, FlushTrigger::SizeCap);
                return BatchAddResult::Flushed { count };
            }

            let token = CancellationToken::new();
            session.timer = Some(token.clone());
            let timer_inner = inner.clone();
            let timer_handle = handle.clone();
            let timer_cell = cell.clone();
            inner.tasks.spawn_on(
                async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(window) => {
                            timer_inner.flush_cell(&timer_handle, &timer_cell, Some(&token), FlushTrigger::Debounce);
                        }
                    }
                },
                &handle,
            );
            drop(session);

            debug!(submitter, count, "item added to batch");
            if let Some(progress) = inner.progress.load_full() {
                progress.item_received(submitter, &target, count);
            }
            return BatchAddResult::Added { count };
        }
    }

    /// Flush the submitter's session now. `false` if none exists or it is already flushing.
    pub fn force_flush(&self, submitter: &str) -> bool {
        let Some(handle) = self.inner.runtime.load_full() else {
            return false;
        };
        let Some(cell) = self.inner.sessions.get(submitter).map(|e| e.value().clone()) else {
            return false;
        };
        self.inner.flush_cell(&handle, &cell, None, FlushTrigger::Forced)
    }

    pub fn session_status(&self, submitter: &str) -> Option<SessionStatus> {
        let cell = self.inner.sessions.get(submitter).map(|e| e.value().clone())?;
        let s = lock(&cell);
        Some(SessionStatus {
            count: s.items.len(),
            age: s.created_at.elapsed(),
            since_last_update: s.updated_at.elapsed(),
            flushing: s.flushing,
            has_timer: s.timer.as_ref().is_some_and(|t| !t.is_cancelled()),
        })
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Force-flush sessions older than `max_session_age`. Returns how many were flushed.
    pub fn reap_stale(&self) -> usize {
        let Some(handle) = self.inner.runtime.load_full() else {
            return 0;
        };
        let max_age = self.inner.config.max_session_age;
        let mut flushed = 0;
        for cell in self.live_cells() {
            let stale = {
                let s = lock(&cell);
                !s.flushing && s.created_at.elapsed() >= max_age
            };
            if stale && self.inner.flush_cell(&handle, &cell, None, FlushTrigger::Reaper) {
                self.inner.stats.reaper_flushes.fetch_add(1, Ordering::Relaxed);
                flushed += 1;
            }
        }
        if flushed > 0 {
            warn!(flushed, "reaper flushed stale sessions");
        }
        flushed
    }

    pub fn stats(&self) -> CollectorStats {
        let s = &self.inner.stats;
        let batches = s.batches_flushed.load(Ordering::Relaxed);
        let flushed_items = s.items_flushed.load(Ordering::Relaxed);
        CollectorStats {
            items_collected: s.items_collected.load(Ordering::Relaxed),
            batches_flushed: batches,
            single_item_batches: s.single_item_batches.load(Ordering::Relaxed),
            multi_item_batches: s.multi_item_batches.load(Ordering::Relaxed),
            average_batch_size: if batches == 0 {
                0.0
            } else {
                flushed_items as f64 / batches as f64
            },
            size_cap_flushes: s.size_cap_flushes.load(Ordering::Relaxed),
            reaper_flushes: s.reaper_flushes.load(Ordering::Relaxed),
            failed_handoffs: s.failed_handoffs.load(Ordering::Relaxed),
            active_sessions: self.inner.sessions.len(),
        }
    }

    fn live_cells(&self) -> Vec<SessionCell> {
        self.inner
            .sessions
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }
}

fn reject(reason: RejectReason) -> BatchAddResult {
    debug!(%reason, "item rejected");
    BatchAddResult::Rejected { reason }
}

impl Inner {
    /// Mark flushing, take the items and unlink the session. Caller holds the session lock.
    fn begin_flush(&self, cell: &SessionCell, session: &mut BatchSession) -> Vec<PendingItem> {
        session.flushing = true;
        if let Some(timer) = session.timer.take() {
            timer.cancel();
        }
        self.sessions
            .remove_if(&session.submitter, |_, v| Arc::ptr_eq(v, cell));
        std::mem::take(&mut session.items)
    }

    /// Flush a session unless it is already flushing, empty, or (for timer
    /// flushes) the firing timer has been superseded.
    fn flush_cell(
        self: &Arc<Self>,
        handle: &Handle,
        cell: &SessionCell,
        timer: Option<&CancellationToken>,
        trigger: FlushTrigger,
    ) -> bool {
        let mut session = lock(cell);
        if session.flushing || session.items.is_empty() {
            return false;
        }
        if timer.is_some_and(|t| t.is_cancelled()) {
            return false;
        }
        let items = self.begin_flush(cell, &mut session);
        let submitter = session.submitter.clone();
        // Handed off before the lock is released so `stop` never misses it.
        self.dispatch(handle, &submitter, items, trigger);
        true
    }

    fn dispatch(self: &Arc<Self>, handle: &Handle, submitter: &str, items: Vec<PendingItem>, trigger: FlushTrigger) {
        let n = items.len() as u64;
        self.stats.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.stats.items_flushed.fetch_add(n, Ordering::Relaxed);
        if n == 1 {
            self.stats.single_item_batches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.multi_item_batches.fetch_add(1, Ordering::Relaxed);
        }
        info!(submitter, batch_size = n, trigger = trigger.as_str(), "flushing batch");

        let Some(handler) = self.handler.load_full() else {
            self.stats.failed_handoffs.fetch_add(1, Ordering::Relaxed);
            error!(submitter, batch_size = n, "no batch processor registered, batch discarded");
            return;
        };
        let inner = self.clone();
        let submitter = submitter.to_string();
        self.tasks.spawn_on(
            async move {
                let run = AssertUnwindSafe(handler.handle_batch(&submitter, items)).catch_unwind();
                let failure = match run.await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some("batch handler panicked".to_string()),
                };
                if let Some(reason) = failure {
                    inner.stats.failed_handoffs.fetch_add(1, Ordering::Relaxed);
                    warn!(submitter = submitter.as_str(), batch_size = n, error = reason.as_str(), "batch handler failed, batch discarded");
                }
            },
            handle,
        );
    }
}
