use std::collections::VecDeque;

use telemetry::{BaselineProfile, SubjectKey};

/// Sliding window of recent durations for one subject. Baselines are
/// computed from this window, not from lifetime history, so retraining
/// follows the workload as it shifts.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    durations: VecDeque<f64>,
    window_limit: usize,
    total_observed: u64,
}

impl SampleWindow {
    pub fn new(window_limit: usize) -> Self {
        Self {
            durations: VecDeque::new(),
            window_limit: window_limit.max(1),
            total_observed: 0,
        }
    }

    pub fn push(&mut self, duration_ms: f64) {
        if !duration_ms.is_finite() {
            return;
        }
        self.durations.push_back(duration_ms);
        while self.durations.len() > self.window_limit {
            self.durations.pop_front();
        }
        self.total_observed = self.total_observed.saturating_add(1);
    }

    pub fn len(&self) -> usize {
        self.durations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }

    pub fn total_observed(&self) -> u64 {
        self.total_observed
    }

    fn sorted(&self) -> Vec<f64> {
        let mut values: Vec<f64> = self.durations.iter().copied().collect();
        values.sort_by(|a, b| a.total_cmp(b));
        values
    }
}

/// Builds versioned baseline profiles from sample windows.
pub struct BaselineProfiler {
    min_samples: u64,
}

impl BaselineProfiler {
    pub fn new(min_samples: u64) -> Self {
        Self {
            min_samples: min_samples.max(1),
        }
    }

    pub fn min_samples(&self) -> u64 {
        self.min_samples
    }

    pub fn has_sufficient_samples(&self, window: &SampleWindow) -> bool {
        window.len() as u64 >= self.min_samples
    }

    /// Compute a fresh profile from the window; `None` below the
    /// minimum sample threshold.
    pub fn build_profile(
        &self,
        subject: &SubjectKey,
        window: &SampleWindow,
        previous: Option<&BaselineProfile>,
        now_ms: u64,
    ) -> Option<BaselineProfile> {
        if !self.has_sufficient_samples(window) {
            return None;
        }

        let sorted = window.sorted();
        let n = sorted.len() as f64;

        // Welford's online recurrence over the window, then the sample
        // standard deviation.
        let mut mean = 0.0;
        let mut m2 = 0.0;
        for (i, value) in sorted.iter().enumerate() {
            let delta = value - mean;
            mean += delta / (i as f64 + 1.0);
            m2 += delta * (value - mean);
        }
        let std = if sorted.len() > 1 {
            (m2 / (n - 1.0)).sqrt()
        } else {
            0.0
        };

        Some(BaselineProfile {
            subject: subject.clone(),
            version: previous.map(|p| p.version.saturating_add(1)).unwrap_or(1),
            created_ts_ms: previous.map(|p| p.created_ts_ms).unwrap_or(now_ms),
            updated_ts_ms: now_ms,
            sample_count: window.len() as u64,
            mean_duration_ms: mean,
            std_duration_ms: std,
            p50_duration_ms: percentile_sorted(&sorted, 50.0),
            p95_duration_ms: percentile_sorted(&sorted, 95.0),
            p99_duration_ms: percentile_sorted(&sorted, 99.0),
            historical_distances: previous
                .map(|p| p.historical_distances.clone())
                .unwrap_or_default(),
        })
    }
}

pub fn percentile_sorted(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * (values.len() - 1) as f64).round() as usize;
    values[rank.min(values.len() - 1)]
}
