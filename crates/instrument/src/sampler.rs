use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use telemetry::BackpressureSignal;

/// Deterministic 1-in-N sampler. The effective rate can be pushed down
/// by backpressure or rate-limit feedback and restored afterwards; the
/// configured base rate never changes.
pub struct Sampler {
    base_bits: AtomicU64,
    rate_bits: AtomicU64,
    counter: AtomicU64,
}

impl Sampler {
    pub fn new(rate: f64) -> Self {
        let rate = clamp_rate(rate);
        Self {
            base_bits: AtomicU64::new(rate.to_bits()),
            rate_bits: AtomicU64::new(rate.to_bits()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn base_rate(&self) -> f64 {
        f64::from_bits(self.base_bits.load(Ordering::Relaxed))
    }

    /// Hot-reload entry point: replaces the configured rate the
    /// throttling feedback works from.
    pub fn set_base_rate(&self, rate: f64) {
        self.base_bits
            .store(clamp_rate(rate).to_bits(), Ordering::Relaxed);
    }

    pub fn current_rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    pub fn set_rate(&self, rate: f64) {
        self.rate_bits
            .store(clamp_rate(rate).to_bits(), Ordering::Relaxed);
    }

    pub fn restore(&self) {
        self.set_rate(self.base_rate());
    }

    pub fn should_sample(&self) -> bool {
        let rate = self.current_rate();
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        let interval = (1.0 / rate).round().max(1.0) as u64;
        let n = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        n % interval == 0
    }

    /// The recommended rate is a multiplier on the base rate, so a
    /// 0.5 recommendation halves sampling regardless of the base.
    pub fn apply_backpressure(&self, signal: &BackpressureSignal) {
        if signal.active {
            let old = self.current_rate();
            let new = clamp_rate(self.base_rate() * signal.recommended_rate);
            if (new - old).abs() > f64::EPSILON {
                self.set_rate(new);
                info!(
                    old_rate = old,
                    new_rate = new,
                    utilization = signal.utilization,
                    "backpressure active: sampling rate reduced"
                );
            }
        } else if (self.current_rate() - self.base_rate()).abs() > f64::EPSILON {
            self.restore();
            info!(
                rate = self.base_rate(),
                "backpressure cleared: sampling rate restored"
            );
        }
    }
}

fn clamp_rate(rate: f64) -> f64 {
    if rate.is_nan() {
        return 0.0;
    }
    rate.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_rate_samples_everything() {
        let sampler = Sampler::new(1.0);
        assert!((0..100).all(|_| sampler.should_sample()));
    }

    #[test]
    fn zero_rate_samples_nothing() {
        let sampler = Sampler::new(0.0);
        assert!((0..100).all(|_| !sampler.should_sample()));
    }

    #[test]
    fn tenth_rate_samples_one_in_ten() {
        let sampler = Sampler::new(0.1);
        let sampled = (0..1_000).filter(|_| sampler.should_sample()).count();
        assert_eq!(sampled, 100);
    }

    #[test]
    fn backpressure_reduces_then_restores() {
        let sampler = Sampler::new(0.5);

        sampler.apply_backpressure(&BackpressureSignal {
            active: true,
            recommended_rate: 0.5,
            utilization: 0.85,
            reason: "queue utilization high".to_string(),
        });
        assert!((sampler.current_rate() - 0.25).abs() < 1e-9);

        sampler.apply_backpressure(&BackpressureSignal::inactive());
        assert!((sampler.current_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn rates_are_clamped() {
        let sampler = Sampler::new(7.0);
        assert!((sampler.current_rate() - 1.0).abs() < 1e-9);
        sampler.set_rate(-3.0);
        assert!((sampler.current_rate() - 0.0).abs() < 1e-9);
    }
}
