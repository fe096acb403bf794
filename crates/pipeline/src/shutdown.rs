use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Shared cancellation token for the worker and maintenance threads.
/// `wait_timeout` doubles as the periodic-task sleep so a stop request
/// interrupts the wait instead of finishing the interval.
#[derive(Default)]
pub struct ShutdownToken {
    stopped: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.wake.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`; returns true when stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (_guard, _result) = match self.wake.wait_timeout(guard, timeout) {
            Ok(pair) => pair,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.is_stopped()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    #[test]
    fn wait_times_out_when_not_stopped() {
        let token = ShutdownToken::new();
        let started = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn stop_interrupts_waiters() {
        let token = Arc::new(ShutdownToken::new());
        let waiter = {
            let token = token.clone();
            std::thread::spawn(move || token.wait_timeout(Duration::from_secs(10)))
        };

        std::thread::sleep(Duration::from_millis(20));
        token.stop();
        assert!(waiter.join().expect("join"));
    }
}
