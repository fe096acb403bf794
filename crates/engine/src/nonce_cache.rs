use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

/// Nonce → first-seen timestamp, capacity-bounded with LRU eviction.
/// A nonce seen again inside its TTL is a replay; past the TTL the
/// value may be reused (the freshness window rejects such events
/// anyway).
pub struct NonceCache {
    inner: Mutex<LruCache<String, u64>>,
    ttl_ms: u64,
}

impl NonceCache {
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl_ms,
        }
    }

    pub fn is_replay(&self, nonce: &str, now_ms: u64) -> bool {
        let mut cache = self.lock();
        match cache.get(nonce) {
            Some(first_seen) => now_ms.saturating_sub(*first_seen) < self.ttl_ms,
            None => false,
        }
    }

    pub fn record(&self, nonce: &str, now_ms: u64) {
        let mut cache = self.lock();
        cache.put(nonce.to_string(), now_ms);
    }

    /// Drop every entry past its TTL; returns how many were removed.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let mut cache = self.lock();
        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, first_seen)| now_ms.saturating_sub(**first_seen) >= self.ttl_ms)
            .map(|(nonce, _)| nonce.clone())
            .collect();
        for nonce in &expired {
            cache.pop(nonce);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, u64>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_use_inside_ttl_is_a_replay() {
        let cache = NonceCache::new(100, 1_000);
        assert!(!cache.is_replay("n1", 10_000));
        cache.record("n1", 10_000);
        assert!(cache.is_replay("n1", 10_500));
    }

    #[test]
    fn expired_nonce_is_reusable() {
        let cache = NonceCache::new(100, 1_000);
        cache.record("n1", 10_000);
        assert!(!cache.is_replay("n1", 11_000));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = NonceCache::new(2, 60_000);
        cache.record("n1", 1_000);
        cache.record("n2", 1_001);
        cache.record("n3", 1_002);

        assert_eq!(cache.len(), 2);
        assert!(!cache.is_replay("n1", 1_003));
        assert!(cache.is_replay("n3", 1_003));
    }

    #[test]
    fn sweep_removes_only_expired() {
        let cache = NonceCache::new(100, 1_000);
        cache.record("old", 1_000);
        cache.record("fresh", 1_900);

        assert_eq!(cache.sweep(2_000), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.is_replay("fresh", 2_000));
    }
}
