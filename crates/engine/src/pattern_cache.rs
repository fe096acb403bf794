use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use telemetry::TelemetryEvent;

/// Behavioral fingerprint of a pattern this engine has already cleared.
#[derive(Debug, Clone)]
struct Fingerprint {
    duration_min: f64,
    duration_max: f64,
    arg_types: Vec<String>,
    last_seen_ms: u64,
    hits: u64,
}

impl Fingerprint {
    fn matches(&self, event: &TelemetryEvent) -> bool {
        // 20% tolerance around the observed duration band.
        let low = self.duration_min * 0.8;
        let high = self.duration_max * 1.2;
        if event.duration_ms < low || event.duration_ms > high {
            return false;
        }
        self.arg_types == event.args.arg_types
    }

    fn absorb(&mut self, event: &TelemetryEvent, now_ms: u64) {
        self.duration_min = self.duration_min.min(event.duration_ms);
        self.duration_max = self.duration_max.max(event.duration_ms);
        self.last_seen_ms = now_ms;
    }
}

/// Fast path for known-legitimate traffic: an event matching a cached
/// fingerprint skips scoring entirely. Entries age out on TTL and the
/// cache is size-capped.
pub struct PatternCache {
    inner: Mutex<HashMap<String, Fingerprint>>,
    ttl_ms: u64,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PatternCache {
    pub fn new(ttl_ms: u64, max_size: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl_ms,
            max_size: max_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn check_match(&self, event: &TelemetryEvent, now_ms: u64) -> bool {
        let key = event.subject.to_string();
        let mut inner = self.lock();

        let hit = match inner.get_mut(&key) {
            Some(fp) if now_ms.saturating_sub(fp.last_seen_ms) < self.ttl_ms => {
                if fp.matches(event) {
                    fp.hits = fp.hits.saturating_add(1);
                    fp.last_seen_ms = now_ms;
                    true
                } else {
                    false
                }
            }
            _ => false,
        };

        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    pub fn add_pattern(&self, event: &TelemetryEvent, now_ms: u64) {
        let key = event.subject.to_string();
        let mut inner = self.lock();

        if let Some(fp) = inner.get_mut(&key) {
            fp.absorb(event, now_ms);
            return;
        }

        if inner.len() >= self.max_size {
            // Evict the stalest fingerprint to stay under the cap.
            if let Some(stalest) = inner
                .iter()
                .min_by_key(|(_, fp)| fp.last_seen_ms)
                .map(|(k, _)| k.clone())
            {
                inner.remove(&stalest);
            }
        }

        inner.insert(
            key,
            Fingerprint {
                duration_min: event.duration_ms,
                duration_max: event.duration_ms,
                arg_types: event.args.arg_types.clone(),
                last_seen_ms: now_ms,
                hits: 0,
            },
        );
    }

    pub fn evict_expired(&self, now_ms: u64) -> usize {
        let mut inner = self.lock();
        let before = inner.len();
        inner.retain(|_, fp| now_ms.saturating_sub(fp.last_seen_ms) < self.ttl_ms);
        before - inner.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Fingerprint>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
