use telemetry::BaselineProfile;

/// Scales raw features against a baseline before scoring.
#[derive(Debug, Default, Clone)]
pub struct FeatureNormalizer;

impl FeatureNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Standard-deviation units from the mean; 0 when the baseline has
    /// no spread (degenerate, never an error).
    pub fn z_score(&self, value: f64, mean: f64, std: f64) -> f64 {
        if std == 0.0 || !std.is_finite() {
            return 0.0;
        }
        (value - mean) / std
    }

    /// Min-max scale into [0, 1] against the baseline: outliers capped
    /// at p99, missing values filled with the median.
    pub fn minmax_scale(&self, value: f64, baseline: &BaselineProfile) -> f64 {
        let value = if value.is_finite() {
            value
        } else {
            baseline.p50_duration_ms
        };

        let max = baseline.p99_duration_ms;
        if max <= 0.0 || !max.is_finite() {
            return 0.0;
        }

        (value.min(max).max(0.0)) / max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry::SubjectKey;

    fn baseline() -> BaselineProfile {
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
            p99_duration_ms: 20.0,
            historical_distances: Vec::new(),
        }
    }

    #[test]
    fn z_score_in_std_units() {
        let n = FeatureNormalizer::new();
        assert!((n.z_score(14.0, 10.0, 2.0) - 2.0).abs() < 1e-9);
        assert!((n.z_score(6.0, 10.0, 2.0) + 2.0).abs() < 1e-9);
    }

    #[test]
    fn zero_std_never_divides() {
        let n = FeatureNormalizer::new();
        assert_eq!(n.z_score(100.0, 10.0, 0.0), 0.0);
    }

    #[test]
    fn minmax_caps_outliers_at_p99() {
        let n = FeatureNormalizer::new();
        let b = baseline();
        assert!((n.minmax_scale(10.0, &b) - 0.5).abs() < 1e-9);
        assert!((n.minmax_scale(200.0, &b) - 1.0).abs() < 1e-9);
        assert_eq!(n.minmax_scale(-5.0, &b), 0.0);
    }

    #[test]
    fn missing_value_falls_back_to_median() {
        let n = FeatureNormalizer::new();
        let b = baseline();
        assert!((n.minmax_scale(f64::NAN, &b) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn degenerate_baseline_scales_to_zero() {
        let n = FeatureNormalizer::new();
        let mut b = baseline();
        b.p99_duration_ms = 0.0;
        assert_eq!(n.minmax_scale(10.0, &b), 0.0);
    }
}
