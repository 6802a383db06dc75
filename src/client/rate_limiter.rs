//! Per-provider admission control.
//!
//! Epistemic foundation:
//! - K_i: Each vendor enforces a requests-per-minute and a concurrency ceiling
//! - K_i: 429 responses require exponential backoff
//! - B_i: Vendor `retry-after` hints are accurate (used verbatim when present)
//! - I^B: Real account limits unknowable → conservative per-vendor defaults

use crate::models::{ProviderKind, RateLimitOverrides, Settings};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// First backoff step when the vendor gives no `retry-after`.
pub const BASE_BACKOFF: Duration = Duration::from_millis(1000);

/// Rolling window length for the per-minute ceiling.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Vendor hints beyond a day are treated as a day.
const MAX_RETRY_AFTER_SECS: f64 = 86_400.0;

/// Longest single sleep inside `wait_for_availability`.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Limits for one provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub max_requests_per_minute: u32,
    pub max_concurrent_requests: u32,
    /// Upper bound for computed backoff
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl RateLimitConfig {
    /// Defaults per vendor.
    pub fn for_provider(kind: ProviderKind) -> Self {
        let (rpm, concurrent, max_backoff_secs) = match kind {
            ProviderKind::OpenAi => (60, 10, 60),
            ProviderKind::Anthropic => (50, 5, 60),
            ProviderKind::Google => (60, 10, 30),
        };
        Self {
            max_requests_per_minute: rpm,
            max_concurrent_requests: concurrent,
            max_backoff: Duration::from_secs(max_backoff_secs),
            backoff_multiplier: 2.0,
        }
    }

    /// Apply caller overrides on top of these limits.
    pub fn with_overrides(mut self, overrides: RateLimitOverrides) -> Self {
        if let Some(rpm) = overrides.max_requests_per_minute {
            self.max_requests_per_minute = rpm;
        }
        if let Some(concurrent) = overrides.max_concurrent_requests {
            self.max_concurrent_requests = concurrent;
        }
        if let Some(ms) = overrides.max_backoff_ms {
            self.max_backoff = Duration::from_millis(ms);
        }
        if let Some(multiplier) = overrides.backoff_multiplier.filter(|m| *m >= 1.0) {
            self.backoff_multiplier = multiplier;
        }
        self
    }

    /// Computed backoff for the n-th consecutive 429 (n >= 1), capped.
    pub fn backoff_for(&self, consecutive_429s: u32) -> Duration {
        let exponent = i32::try_from(consecutive_429s.saturating_sub(1)).unwrap_or(i32::MAX);
        let ms = BASE_BACKOFF.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let cap = self.max_backoff.as_millis() as f64;
        Duration::from_millis(ms.min(cap).max(0.0) as u64)
    }
}

/// Counters for one provider.
#[derive(Debug)]
struct LimiterState {
    /// Requests admitted in the current window
    request_count: u32,
    window_start: Instant,
    /// In-flight requests
    active: u32,
    backoff_until: Option<Instant>,
    /// 429s since the last success
    consecutive_429s: u32,
}

impl LimiterState {
    fn new(now: Instant) -> Self {
        Self {
            request_count: 0,
            window_start: now,
            active: 0,
            backoff_until: None,
            consecutive_429s: 0,
        }
    }

    /// Reset the window if a full minute has passed since it started.
    fn roll_window(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= WINDOW {
            self.request_count = 0;
            self.window_start = now;
        }
    }

    fn can_proceed(&self, now: Instant, config: &RateLimitConfig) -> bool {
        if self.backoff_until.is_some_and(|t| now < t) {
            return false;
        }
        if self.active >= config.max_concurrent_requests {
            return false;
        }
        self.request_count < config.max_requests_per_minute
    }
}

/// Rate limiter for one provider.
///
/// State is only touched under a short synchronous lock; nothing awaits
/// while holding it.
#[derive(Debug)]
pub struct RateLimiter {
    provider: ProviderKind,
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
    total_requests: AtomicU64,
    total_429s: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl RateLimiter {
    pub fn new(provider: ProviderKind, config: RateLimitConfig) -> Self {
        Self {
            provider,
            config,
            state: Mutex::new(LimiterState::new(Instant::now())),
            total_requests: AtomicU64::new(0),
            total_429s: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        // counters stay consistent even if a holder panicked
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check if a request could be admitted now (rolls the window if due).
    pub fn can_make_request(&self) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        state.roll_window(now);
        state.can_proceed(now, &self.config)
    }

    /// Admit one request if possible.
    ///
    /// Check and both increments happen under the same lock.
    pub fn acquire_request(&self) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        state.roll_window(now);
        if !state.can_proceed(now, &self.config) {
            return false;
        }
        state.request_count += 1;
        state.active += 1;
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Return an in-flight slot (floored at zero).
    pub fn release_request(&self) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
    }

    /// Poll until a request could be admitted or `timeout` elapses.
    ///
    /// Returns whether the limiter became available. Does not acquire.
    pub async fn wait_for_availability(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.can_make_request() {
                self.record_wait(start.elapsed());
                return true;
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                self.record_wait(elapsed);
                debug!(
                    provider = %self.provider,
                    waited_ms = elapsed.as_millis() as u64,
                    "Rate limiter still unavailable"
                );
                return false;
            }

            tokio::time::sleep(MAX_POLL_INTERVAL.min(timeout - elapsed)).await;
        }
    }

    fn record_wait(&self, waited: Duration) {
        if !waited.is_zero() {
            self.total_wait_ms
                .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
        }
    }

    /// Enter backoff after a throttling signal.
    ///
    /// Uses the vendor's `retry-after` (seconds) when given, otherwise
    /// `BASE_BACKOFF × multiplier^(consecutive 429s − 1)` capped at the
    /// configured maximum. Returns the delay applied.
    pub fn handle_rate_limit_response(&self, retry_after_secs: Option<f64>) -> Duration {
        let now = Instant::now();
        let mut state = self.lock();
        state.roll_window(now);
        state.consecutive_429s = state.consecutive_429s.saturating_add(1);

        let delay = match retry_after_secs.filter(|s| s.is_finite() && *s >= 0.0) {
            Some(secs) => Duration::from_secs_f64(secs.min(MAX_RETRY_AFTER_SECS)),
            None => self.config.backoff_for(state.consecutive_429s),
        };

        state.backoff_until = Some(now + delay);
        self.total_429s.fetch_add(1, Ordering::Relaxed);

        warn!(
            provider = %self.provider,
            backoff_ms = delay.as_millis() as u64,
            consecutive_429s = state.consecutive_429s,
            retry_after = ?retry_after_secs,
            "Rate limited (429), backing off"
        );
        delay
    }

    /// Clear any backoff after a successful request.
    pub fn handle_successful_request(&self) {
        let mut state = self.lock();
        if state.consecutive_429s > 0 {
            debug!(
                provider = %self.provider,
                consecutive_429s = state.consecutive_429s,
                "Backoff cleared"
            );
        }
        state.backoff_until = None;
        state.consecutive_429s = 0;
    }

    /// Time left in the current backoff window, if any.
    pub fn current_backoff(&self) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .backoff_until
            .filter(|t| *t > now)
            .map(|t| t - now)
    }

    /// Get statistics.
    pub fn stats(&self) -> RateLimiterStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_429s = self.total_429s.load(Ordering::Relaxed);
        let total_wait_ms = self.total_wait_ms.load(Ordering::Relaxed);
        let (window_requests, active_requests) = {
            let state = self.lock();
            (state.request_count, state.active)
        };

        RateLimiterStats {
            provider: self.provider,
            total_requests,
            total_429s,
            total_wait_secs: total_wait_ms as f64 / 1000.0,
            rate_limit_ratio: if total_requests > 0 {
                total_429s as f64 / total_requests as f64
            } else {
                0.0
            },
            window_requests,
            active_requests,
            backoff_remaining: self.current_backoff(),
        }
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub provider: ProviderKind,
    pub total_requests: u64,
    pub total_429s: u64,
    pub total_wait_secs: f64,
    pub rate_limit_ratio: f64,
    pub window_requests: u32,
    pub active_requests: u32,
    pub backoff_remaining: Option<Duration>,
}

/// One limiter per provider, created on first use.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: DashMap<ProviderKind, Arc<RateLimiter>>,
    overrides: DashMap<ProviderKind, RateLimitOverrides>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that applies `[rate_limits.<provider>]` overrides.
    pub fn from_settings(settings: &Settings) -> Self {
        let registry = Self::new();
        for kind in ProviderKind::ALL {
            let overrides = settings.rate_limit_overrides(kind);
            if overrides != RateLimitOverrides::default() {
                registry.overrides.insert(kind, overrides);
            }
        }
        registry
    }

    /// Set overrides for a provider whose limiter has not been created yet.
    ///
    /// Returns false if the limiter already exists (its limits are fixed).
    pub fn set_overrides(&self, kind: ProviderKind, overrides: RateLimitOverrides) -> bool {
        if self.limiters.contains_key(&kind) {
            return false;
        }
        self.overrides.insert(kind, overrides);
        true
    }

    /// The provider's limiter, created with defaults + overrides on first call.
    pub fn get(&self, kind: ProviderKind) -> Arc<RateLimiter> {
        let limiter = self.limiters.entry(kind).or_insert_with(|| {
            let overrides = self
                .overrides
                .get(&kind)
                .map(|o| *o)
                .unwrap_or_default();
            let config = RateLimitConfig::for_provider(kind).with_overrides(overrides);
            info!(
                provider = %kind,
                rpm = config.max_requests_per_minute,
                concurrent = config.max_concurrent_requests,
                max_backoff_ms = config.max_backoff.as_millis() as u64,
                "Rate limiter created"
            );
            Arc::new(RateLimiter::new(kind, config))
        });
        Arc::clone(&limiter)
    }

    /// Stats for every limiter created so far.
    pub fn stats(&self) -> Vec<RateLimiterStats> {
        let mut stats: Vec<RateLimiterStats> =
            self.limiters.iter().map(|entry| entry.value().stats()).collect();
        stats.sort_by_key(|s| s.provider.as_str());
        stats
    }
}
