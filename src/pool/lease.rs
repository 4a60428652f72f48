//! Lease pool.

use super::PoolConfig;
use crate::error_code::ErrorClass;
use crate::resilience::retry::{Decision, RetryPolicy};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Creates and disposes of pooled handles.
#[async_trait]
pub trait HandleFactory<H: Send + 'static>: Send + Sync + 'static {
    async fn create(&self, key: &str) -> Result<H>;

    fn close(&self, _handle: H) {}

    /// Whether an operation error means the handle itself is broken.
    fn is_corrupting(&self, err: &Error) -> bool {
        err.class() == ErrorClass::Corrupted
    }
}

/// Handle lifecycle: `Created → Idle → Leased → Idle | Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Created,
    Idle,
    Leased,
    Closed,
}

impl HandleState {
    pub fn can_transition(self, next: HandleState) -> bool {
        matches!(
            (self, next),
            (HandleState::Created, HandleState::Idle)
                | (HandleState::Idle, HandleState::Leased)
                | (HandleState::Leased, HandleState::Idle)
                | (HandleState::Idle, HandleState::Closed)
        )
    }
}

struct Slot<H> {
    id: u64,
    key: String,
    handle: H,
    state: HandleState,
    last_used: Instant,
}

impl<H> Slot<H> {
    fn transition(&mut self, next: HandleState) {
        debug_assert!(
            self.state.can_transition(next),
            "illegal handle transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }
}

struct PoolState<H> {
    idle: Vec<Slot<H>>,
    leased: usize,
    /// Idle + leased + reserved-for-creation.
    total: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub created: u64,
    pub closed: u64,
    pub idle: usize,
    pub leased: usize,
    pub lease_timeouts: u64,
    pub retries: u64,
}

struct AtomicStats {
    created: AtomicU64,
    closed: AtomicU64,
    lease_timeouts: AtomicU64,
    retries: AtomicU64,
}

struct Shared<H: Send + 'static> {
    factory: Arc<dyn HandleFactory<H>>,
    config: PoolConfig,
    state: Mutex<PoolState<H>>,
    permits: Arc<Semaphore>,
    stats: AtomicStats,
    next_id: AtomicU64,
}

impl<H: Send + 'static> Shared<H> {
    fn lock(&self) -> MutexGuard<'_, PoolState<H>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn close_slot(&self, mut slot: Slot<H>) {
        slot.transition(HandleState::Closed);
        self.stats.closed.fetch_add(1, Ordering::Relaxed);
        debug!(handle_id = slot.id, key = slot.key.as_str(), "closing pooled handle");
        self.factory.close(slot.handle);
    }
}

/// Scoped checkout of a pooled handle. Returned to the pool on drop.
pub struct Lease<H: Send + 'static> {
    slot: Option<Slot<H>>,
    shared: Arc<Shared<H>>,
    corrupted: bool,
    _permit: OwnedSemaphorePermit,
}

impl<H: Send + 'static> Lease<H> {
    pub fn handle(&self) -> &H {
        match &self.slot {
            Some(slot) => &slot.handle,
            None => unreachable!("lease slot is only taken on drop"),
        }
    }

    pub fn id(&self) -> u64 {
        self.slot.as_ref().map(|s| s.id).unwrap_or_default()
    }

    /// Close the handle instead of returning it to the idle set.
    pub fn mark_corrupted(&mut self) {
        self.corrupted = true;
    }
}

impl<H: Send + 'static> fmt::Debug for Lease<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id())
            .field("key", &self.slot.as_ref().map(|s| s.key.as_str()))
            .field("corrupted", &self.corrupted)
            .finish_non_exhaustive()
    }
}

impl<H: Send + 'static> Deref for Lease<H> {
    type Target = H;
    fn deref(&self) -> &H {
        self.handle()
    }
}

impl<H: Send + 'static> Drop for Lease<H> {
    fn drop(&mut self) {
        let Some(mut slot) = self.slot.take() else {
            return;
        };
        slot.transition(HandleState::Idle);
        slot.last_used = Instant::now();
        let mut st = self.shared.lock();
        st.leased = st.leased.saturating_sub(1);
        if self.corrupted {
            st.total = st.total.saturating_sub(1);
            drop(st);
            warn!(handle_id = slot.id, "pooled handle corrupted, replacing on next lease");
            self.shared.close_slot(slot);
        } else if self.shared.permits.is_closed() {
            // The pool was shut down while this lease was out.
            st.total = st.total.saturating_sub(1);
            drop(st);
            self.shared.close_slot(slot);
        } else {
            st.idle.push(slot);
        }
    }
}

/// Undoes a capacity reservation if handle creation fails or is cancelled.
struct Reservation<'a, H: Send + 'static> {
    shared: &'a Shared<H>,
    armed: bool,
}

impl<H: Send + 'static> Drop for Reservation<'_, H> {
    fn drop(&mut self) {
        if self.armed {
            let mut st = self.shared.lock();
            st.total = st.total.saturating_sub(1);
            st.leased = st.leased.saturating_sub(1);
        }
    }
}

/// Bounded pool of reusable handles keyed by name.
pub struct LeasePool<H: Send + 'static> {
    shared: Arc<Shared<H>>,
    policy: RetryPolicy,
    reaper: Mutex<Option<CancellationToken>>,
}

impl<H: Send + 'static> LeasePool<H> {
    pub fn new(config: PoolConfig, factory: Arc<dyn HandleFactory<H>>, policy: RetryPolicy) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_handles.max(1)));
        Self {
            shared: Arc::new(Shared {
                factory,
                config,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    leased: 0,
                    total: 0,
                }),
                permits,
                stats: AtomicStats {
                    created: AtomicU64::new(0),
                    closed: AtomicU64::new(0),
                    lease_timeouts: AtomicU64::new(0),
                    retries: AtomicU64::new(0),
                },
                next_id: AtomicU64::new(1),
            }),
            policy,
            reaper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Check out a handle for `key`, reusing an idle one when possible.
    ///
    /// Waits at most `lease_timeout` when every handle is leased.
    pub async fn lease(&self, key: &str) -> Result<Lease<H>> {
        let shared = &self.shared;
        let wait = shared.config.lease_timeout;
        let permit = match tokio::time::timeout(wait, shared.permits.clone().acquire_owned()).await
        {
            Ok(Ok(p)) => p,
            Ok(Err(_)) => {
                return Err(Error::internal("lease pool is shut down")
                    .with_context(ErrorContext::new().with_source("lease_pool")))
            }
            Err(_) => {
                shared.stats.lease_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(key, waited_ms = wait.as_millis() as u64, "lease wait timed out");
                return Err(Error::PoolExhausted {
                    key: key.to_string(),
                    waited: wait,
                });
            }
        };

        let (reused, evicted) = {
            let mut st = shared.lock();
            if let Some(pos) = st.idle.iter().rposition(|s| s.key == key) {
                let mut slot = st.idle.remove(pos);
                slot.transition(HandleState::Leased);
                st.leased += 1;
                (Some(slot), None)
            } else {
                let mut evicted = None;
                if st.total >= shared.config.max_handles {
                    // At the cap every non-idle handle is leased, so an idle one exists.
                    if let Some(pos) = st
                        .idle
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, s)| s.last_used)
                        .map(|(i, _)| i)
                    {
                        evicted = Some(st.idle.remove(pos));
                        st.total -= 1;
                    }
                }
                st.total += 1;
                st.leased += 1;
                (None, evicted)
            }
        };
        if let Some(slot) = evicted {
            shared.close_slot(slot);
        }

        let slot = match reused {
            Some(slot) => slot,
            None => {
                let mut reservation = Reservation {
                    shared,
                    armed: true,
                };
                let handle = shared.factory.create(key).await?;
                reservation.armed = false;
                let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
                shared.stats.created.fetch_add(1, Ordering::Relaxed);
                debug!(handle_id = id, key, "created pooled handle");
                let mut slot = Slot {
                    id,
                    key: key.to_string(),
                    handle,
                    state: HandleState::Created,
                    last_used: Instant::now(),
                };
                slot.transition(HandleState::Idle);
                slot.transition(HandleState::Leased);
                slot
            }
        };

        Ok(Lease {
            slot: Some(slot),
            shared: self.shared.clone(),
            corrupted: false,
            _permit: permit,
        })
    }

    /// Run `op` with a leased handle, retrying transient failures with backoff.
    ///
    /// A fresh lease is taken for every attempt; a corrupting error closes the
    /// handle so the retry gets a new one.
    pub async fn with_retry<T, F, Fut>(&self, key: &str, max_retries: u32, mut op: F) -> Result<T>
    where
        H: Clone,
        F: FnMut(H) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let outcome = match self.lease(key).await {
                Ok(mut lease) => {
                    let res = op(lease.handle().clone()).await;
                    if let Err(ref e) = res {
                        if self.shared.factory.is_corrupting(e) {
                            lease.mark_corrupted();
                        }
                    }
                    res
                }
                Err(e) => Err(e),
            };
            match outcome {
                Ok(v) => return Ok(v),
                Err(e) => match self.policy.decide(&e, attempt, max_retries) {
                    Decision::Retry { delay } => {
                        self.shared.stats.retries.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            key,
                            attempt = attempt + 1,
                            error_class = e.class().name(),
                            delay_ms = delay.as_millis() as u64,
                            "retrying pooled operation"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Decision::GiveUp => return Err(e),
                },
            }
        }
    }

    /// Close idle handles unused for at least `idle_timeout`. Returns how many were closed.
    pub fn reap_idle(&self) -> usize {
        let threshold = self.shared.config.idle_timeout;
        let expired: Vec<Slot<H>> = {
            let mut st = self.shared.lock();
            let (expired, keep): (Vec<_>, Vec<_>) = st
                .idle
                .drain(..)
                .partition(|s| s.last_used.elapsed() >= threshold);
            st.idle = keep;
            st.total = st.total.saturating_sub(expired.len());
            expired
        };
        let n = expired.len();
        for slot in expired {
            self.shared.close_slot(slot);
        }
        if n > 0 {
            info!(closed = n, "reaped idle pooled handles");
        }
        n
    }

    /// Spawn the background reaper. Calling it twice is a no-op.
    pub fn start_reaper(&self) {
        let mut guard = self.reaper.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        let pool = LeasePool {
            shared: self.shared.clone(),
            policy: self.policy.clone(),
            reaper: Mutex::new(None),
        };
        let interval = self.shared.config.reaper_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        pool.reap_idle();
                    }
                }
            }
            debug!("lease pool reaper stopped");
        });
    }

    /// Stop the reaper, refuse new leases and close every idle handle.
    pub fn shutdown(&self) {
        if let Some(token) = self
            .reaper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            token.cancel();
        }
        self.shared.permits.close();
        let idle: Vec<Slot<H>> = {
            let mut st = self.shared.lock();
            let idle: Vec<_> = st.idle.drain(..).collect();
            st.total = st.total.saturating_sub(idle.len());
            idle
        };
        for slot in idle {
            self.shared.close_slot(slot);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.shared.lock();
        let s = &self.shared.stats;
        PoolStats {
            created: s.created.load(Ordering::Relaxed),
            closed: s.closed.load(Ordering::Relaxed),
            idle: st.idle.len(),
            leased: st.leased,
            lease_timeouts: s.lease_timeouts.load(Ordering::Relaxed),
            retries: s.retries.load(Ordering::Relaxed),
        }
    }

    pub fn lease_timeout(&self) -> Duration {
        self.shared.config.lease_timeout
    }
}
