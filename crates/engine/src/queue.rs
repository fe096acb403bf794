use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use telemetry::BackpressureSignal;

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub len: usize,
    pub capacity: usize,
    pub utilization: f64,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_dropped: u64,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO between admission and the scoring workers. Never grows
/// past `capacity`: at the bound, the oldest item is dropped to make
/// room (drop-oldest policy).
pub struct EventQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    capacity: usize,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
}

impl<T> EventQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns false when the item was refused (queue closed) or an
    /// older item had to be dropped to admit this one.
    pub fn enqueue(&self, item: T) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }

        let mut clean = true;
        while state.items.len() >= self.capacity {
            state.items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            clean = false;
        }
        if !clean {
            warn!(capacity = self.capacity, "event queue full, dropped oldest");
        }

        state.items.push_back(item);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        drop(state);
        self.available.notify_one();
        clean
    }

    /// Block up to `timeout` for the next item. `None` on timeout or
    /// when the queue is closed and drained.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.dequeued.fetch_add(1, Ordering::Relaxed);
                return Some(item);
            }
            if state.closed {
                return None;
            }
            let (next, result) = match self.available.wait_timeout(state, timeout) {
                Ok((guard, result)) => (guard, result),
                Err(poisoned) => {
                    let (guard, result) = poisoned.into_inner();
                    (guard, result)
                }
            };
            state = next;
            if result.timed_out() && state.items.is_empty() {
                return None;
            }
        }
    }

    pub fn try_dequeue(&self) -> Option<T> {
        let mut state = self.lock();
        let item = state.items.pop_front();
        if item.is_some() {
            self.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Stop accepting new items and wake every waiting consumer.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        drop(state);
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn utilization(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            len: self.len(),
            capacity: self.capacity,
            utilization: self.utilization(),
            total_enqueued: self.enqueued.load(Ordering::Relaxed),
            total_dequeued: self.dequeued.load(Ordering::Relaxed),
            total_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Watches queue utilization and tells producers how hard to back off.
pub struct BackpressureController {
    threshold: f64,
    active: AtomicBool,
    activations: AtomicU64,
}

impl BackpressureController {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            active: AtomicBool::new(false),
            activations: AtomicU64::new(0),
        }
    }

    pub fn check(&self, utilization: f64) -> BackpressureSignal {
        let active = utilization >= self.threshold;
        let was_active = self.active.swap(active, Ordering::Relaxed);

        if active && !was_active {
            self.activations.fetch_add(1, Ordering::Relaxed);
            warn!(utilization, "backpressure activated");
        } else if !active && was_active {
            info!(utilization, "backpressure cleared");
        }

        if !active {
            return BackpressureSignal::inactive();
        }
        BackpressureSignal {
            active: true,
            recommended_rate: recommended_rate(utilization),
            utilization,
            reason: format!("queue utilization {:.0}%", utilization * 100.0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::Relaxed)
    }
}

fn recommended_rate(utilization: f64) -> f64 {
    if utilization >= 0.95 {
        0.10
    } else if utilization >= 0.90 {
        0.25
    } else if utilization >= 0.80 {
        0.50
    } else if utilization >= 0.70 {
        0.75
    } else {
        1.0
    }
}
