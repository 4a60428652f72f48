use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct RateLimiterSnapshot {
    pub rps: f64,
    pub burst: f64,
    pub tokens: f64,
    /// Estimated wait until a token is available, if currently empty or cooling down.
    pub estimated_wait: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Tokens per second. `0` disables limiting.
    pub rps: f64,
    /// Maximum burst size (tokens).
    pub burst: f64,
}

impl RateLimiterConfig {
    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps < 0.0 {
            return None;
        }
        Some(Self {
            rps,
            burst: rps.max(1.0),
        })
    }

    /// Requests-per-minute quota, the unit upstream AI providers publish.
    pub fn per_minute(rpm: u32) -> Self {
        Self {
            rps: rpm as f64 / 60.0,
            burst: (rpm as f64 / 60.0).max(1.0),
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = (burst as f64).max(1.0);
        self
    }
}

#[derive(Debug)]
struct State {
    tokens: f64,
    last: Instant,
    /// Set after the upstream reported rate limiting.
    cooldown_until: Option<Instant>,
}

/// Token bucket guarding one extraction tier.
///
/// Callers ask [`RateLimiter::estimated_wait`] first so a saturated tier can be
/// skipped in favor of the next one instead of sleeping.
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        let state = Mutex::new(State {
            tokens: cfg.burst,
            last: Instant::now(),
            cooldown_until: None,
        });
        Self { cfg, state }
    }

    fn refill_locked(cfg: &RateLimiterConfig, st: &mut State, now: Instant) {
        let elapsed = now.duration_since(st.last).as_secs_f64();
        if elapsed > 0.0 {
            st.tokens = (st.tokens + elapsed * cfg.rps).min(cfg.burst);
            st.last = now;
        }
    }

    fn wait_locked(cfg: &RateLimiterConfig, st: &mut State, now: Instant) -> Option<Duration> {
        if let Some(until) = st.cooldown_until {
            if until > now {
                return Some(until - now);
            }
            st.cooldown_until = None;
        }
        if cfg.rps <= 0.0 {
            return None;
        }
        Self::refill_locked(cfg, st, now);
        if st.tokens >= 1.0 {
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - st.tokens) / cfg.rps))
        }
    }

    /// Acquire one token, sleeping as needed.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut st = self.state.lock().await;
                let now = Instant::now();
                match Self::wait_locked(&self.cfg, &mut st, now) {
                    None => {
                        if self.cfg.rps > 0.0 {
                            st.tokens -= 1.0;
                        }
                        return;
                    }
                    Some(w) => w,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token without waiting.
    pub async fn try_acquire(&self) -> bool {
        let mut st = self.state.lock().await;
        let now = Instant::now();
        if Self::wait_locked(&self.cfg, &mut st, now).is_some() {
            return false;
        }
        if self.cfg.rps > 0.0 {
            st.tokens -= 1.0;
        }
        true
    }

    pub async fn estimated_wait(&self) -> Option<Duration> {
        let mut st = self.state.lock().await;
        Self::wait_locked(&self.cfg, &mut st, Instant::now())
    }

    /// Block the bucket for `cooldown` after the upstream signalled rate limiting.
    pub async fn penalize(&self, cooldown: Duration) {
        let mut st = self.state.lock().await;
        let until = Instant::now() + cooldown;
        st.cooldown_until = Some(st.cooldown_until.map_or(until, |u| u.max(until)));
        st.tokens = 0.0;
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let mut st = self.state.lock().await;
        let estimated_wait = Self::wait_locked(&self.cfg, &mut st, Instant::now());
        RateLimiterSnapshot {
            rps: self.cfg.rps,
            burst: self.cfg.burst,
            tokens: st.tokens,
            estimated_wait,
        }
    }
}
