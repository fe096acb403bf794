use telemetry::BaselineProfile;

use crate::normalizer::FeatureNormalizer;

/// Distance-to-percentile anomaly scoring.
///
/// Behavioral timing distributions are frequently multi-modal, so the
/// score is the percentile rank of the observed distance within the
/// subject's own recent distance history rather than a fixed z-score
/// cutoff. Until enough history exists, a standard-normal mapping of
/// the z-distance stands in.
pub struct AnomalyDetector {
    normalizer: FeatureNormalizer,
    min_history: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredEvent {
    /// L2 distance between the normalized feature and the normalized
    /// baseline mean.
    pub distance: f64,
    /// Percentile-rank anomaly score, 0..=100.
    pub score: f64,
}

impl AnomalyDetector {
    pub fn new(min_history: usize) -> Self {
        Self {
            normalizer: FeatureNormalizer::new(),
            min_history: min_history.max(1),
        }
    }

    pub fn score(&self, duration_ms: f64, baseline: &BaselineProfile) -> ScoredEvent {
        let feature = self.normalizer.minmax_scale(duration_ms, baseline);
        let center = self
            .normalizer
            .minmax_scale(baseline.mean_duration_ms, baseline);
        let distance = (feature - center).abs();

        let score = if baseline.historical_distances.len() >= self.min_history {
            percentile_rank(distance, &baseline.historical_distances)
        } else {
            let z = self
                .normalizer
                .z_score(
                    duration_ms,
                    baseline.mean_duration_ms,
                    baseline.std_duration_ms,
                )
                .abs();
            distance_to_percentile(z)
        };

        ScoredEvent {
            distance,
            score: score.clamp(0.0, 100.0),
        }
    }
}

/// Midrank percentile of `distance` within the history: strictly
/// smaller values count fully, ties count half. Monotone
/// non-decreasing in `distance`, and a repeat of a constant history
/// ranks at 50 rather than 100.
fn percentile_rank(distance: f64, history: &[f64]) -> f64 {
    if history.is_empty() {
        return 50.0;
    }
    let below = history.iter().filter(|d| **d < distance).count();
    let ties = history.iter().filter(|d| **d == distance).count();
    ((below as f64 + ties as f64 * 0.5) / history.len() as f64) * 100.0
}

/// Standard-normal approximation: 0σ→50, 1σ→84, 2σ→97.5, 3σ→99.9,
/// linearly interpolated between the anchor points.
fn distance_to_percentile(distance: f64) -> f64 {
    if distance <= 0.0 {
        50.0
    } else if distance <= 1.0 {
        50.0 + distance * 34.0
    } else if distance <= 2.0 {
        84.0 + (distance - 1.0) * 13.5
    } else if distance <= 3.0 {
        97.5 + (distance - 2.0) * 2.4
    } else {
        (99.9 + (distance - 3.0) * 0.01).min(100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry::SubjectKey;

    fn baseline(history: Vec<f64>) -> BaselineProfile {
        BaselineProfile {
            subject: SubjectKey::new("pay", "transfer"),
            version: 1,
            created_ts_ms: 0,
            updated_ts_ms: 0,
            sample_count: 50,
            mean_duration_ms: 10.0,
            std_duration_ms: 2.0,
            p50_duration_ms: 10.0,
            p95_duration_ms: 14.0,
            p99_duration_ms: 16.0,
            historical_distances: history,
        }
    }

    #[test]
    fn extreme_duration_scores_above_95() {
        let detector = AnomalyDetector::new(20);
        let scored = detector.score(200.0, &baseline(Vec::new()));
        assert!(scored.score >= 95.0, "score {}", scored.score);
    }

    #[test]
    fn mean_duration_scores_at_the_floor() {
        let detector = AnomalyDetector::new(20);
        let scored = detector.score(10.0, &baseline(Vec::new()));
        assert!((scored.score - 50.0).abs() < 1e-9);
        assert!(scored.distance.abs() < 1e-9);
    }

    #[test]
    fn score_is_monotone_in_distance() {
        let detector = AnomalyDetector::new(20);
        let history: Vec<f64> = (0..100).map(|i| i as f64 / 100.0).collect();
        let b = baseline(history);

        let mut last = -1.0;
        for duration in [10.0, 11.0, 12.0, 14.0, 16.0, 30.0] {
            let scored = detector.score(duration, &b);
            assert!(
                scored.score >= last,
                "score regressed at duration {}",
                duration
            );
            last = scored.score;
        }
    }

    #[test]
    fn percentile_rank_uses_own_history() {
        let detector = AnomalyDetector::new(4);
        // History of small distances: anything larger ranks at 100.
        let b = baseline(vec![0.01, 0.02, 0.03, 0.04]);
        let scored = detector.score(15.9, &b);
        assert!((scored.score - 100.0).abs() < 1e-9);

        // A distance inside the historical bulk ranks low.
        let b = baseline(vec![0.2, 0.3, 0.4, 0.5]);
        let scored = detector.score(10.5, &b);
        assert!(scored.score <= 25.0, "score {}", scored.score);
    }

    #[test]
    fn normal_approximation_anchor_points() {
        assert!((distance_to_percentile(0.0) - 50.0).abs() < 1e-9);
        assert!((distance_to_percentile(1.0) - 84.0).abs() < 1e-9);
        assert!((distance_to_percentile(2.0) - 97.5).abs() < 1e-9);
        assert!((distance_to_percentile(3.0) - 99.9).abs() < 1e-9);
        assert!(distance_to_percentile(50.0) <= 100.0);
    }

    #[test]
    fn zero_std_baseline_is_neutral() {
        let detector = AnomalyDetector::new(20);
        let mut b = baseline(Vec::new());
        b.std_duration_ms = 0.0;
        let scored = detector.score(100.0, &b);
        assert!((scored.score - 50.0).abs() < 1e-9);
    }
}
