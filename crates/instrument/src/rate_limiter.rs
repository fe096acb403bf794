use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

use telemetry::now_unix_ms;

pub const DEFAULT_WINDOW_MS: u64 = 1_000;
pub const DEFAULT_THROTTLE_THRESHOLD: f64 = 0.8;

#[derive(Debug, Default)]
struct WindowState {
    window_start_ms: u64,
    global_count: u64,
    per_key: HashMap<String, u64>,
    throttled_keys: HashSet<String>,
    dropped: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimiterStats {
    pub total_checks: u64,
    pub total_allowed: u64,
    pub total_throttled: u64,
    pub current_global_count: u64,
    pub throttled_keys: usize,
}

/// Fixed-window admission counters, one global and one per subject
/// key. A key that exceeds its own limit is throttled alone; the rest
/// of the keys are untouched.
pub struct RateLimiter {
    global_limit: u64,
    per_key_limit: u64,
    window_ms: u64,
    throttle_threshold: f64,
    state: Mutex<WindowState>,
    total_checks: AtomicU64,
    total_allowed: AtomicU64,
    total_throttled: AtomicU64,
}

impl RateLimiter {
    pub fn new(global_limit: u64, per_key_limit: u64) -> Self {
        Self::with_window(global_limit, per_key_limit, DEFAULT_WINDOW_MS)
    }

    pub fn with_window(global_limit: u64, per_key_limit: u64, window_ms: u64) -> Self {
        Self {
            global_limit,
            per_key_limit,
            window_ms: window_ms.max(1),
            throttle_threshold: DEFAULT_THROTTLE_THRESHOLD,
            state: Mutex::new(WindowState::default()),
            total_checks: AtomicU64::new(0),
            total_allowed: AtomicU64::new(0),
            total_throttled: AtomicU64::new(0),
        }
    }

    pub fn check(&self, key: &str) -> bool {
        self.check_with_now(key, now_unix_ms())
    }

    pub fn check_with_now(&self, key: &str, now_ms: u64) -> bool {
        self.total_checks.fetch_add(1, Ordering::Relaxed);

        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.roll_window(&mut state, now_ms);

        if state.global_count >= self.global_limit {
            state.dropped = state.dropped.saturating_add(1);
            self.total_throttled.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let key_count = state.per_key.get(key).copied().unwrap_or(0);
        if key_count >= self.per_key_limit {
            state.throttled_keys.insert(key.to_string());
            state.dropped = state.dropped.saturating_add(1);
            self.total_throttled.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        state.global_count = state.global_count.saturating_add(1);
        *state.per_key.entry(key.to_string()).or_insert(0) += 1;
        self.total_allowed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Global-window utilization, 0.0..=1.0+.
    pub fn utilization(&self) -> f64 {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.global_limit == 0 {
            return 1.0;
        }
        state.global_count as f64 / self.global_limit as f64
    }

    pub fn should_throttle(&self) -> bool {
        self.utilization() >= self.throttle_threshold
    }

    /// Self-throttling feedback for the sampler: the closer the global
    /// window is to its limit, the harder the sampling cut.
    pub fn adjusted_sampling_rate(&self, base_rate: f64) -> f64 {
        let utilization = self.utilization();
        if utilization >= 1.0 {
            base_rate * 0.1
        } else if utilization >= 0.9 {
            base_rate * 0.5
        } else if utilization >= self.throttle_threshold {
            base_rate * 0.75
        } else {
            base_rate
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        RateLimiterStats {
            total_checks: self.total_checks.load(Ordering::Relaxed),
            total_allowed: self.total_allowed.load(Ordering::Relaxed),
            total_throttled: self.total_throttled.load(Ordering::Relaxed),
            current_global_count: state.global_count,
            throttled_keys: state.throttled_keys.len(),
        }
    }

    fn roll_window(&self, state: &mut WindowState, now_ms: u64) {
        if now_ms.saturating_sub(state.window_start_ms) < self.window_ms {
            return;
        }
        if state.dropped > 0 {
            info!(
                dropped = state.dropped,
                throttled_keys = state.throttled_keys.len(),
                "rate-limit window reset"
            );
        }
        state.window_start_ms = now_ms;
        state.global_count = 0;
        state.per_key.clear();
        state.throttled_keys.clear();
        state.dropped = 0;
    }
}
