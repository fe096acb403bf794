use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use connector::FailMode;

/// Every option the pipeline recognizes, as named typed fields.
/// Loading merges three layers: built-in defaults, then a TOML file,
/// then `CELLGUARD_*` environment overrides. Invalid values are load
/// errors, not first-use surprises.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sampling_rate: f64,
    pub global_rate_limit: u64,
    pub per_key_rate_limit: u64,
    pub queue_capacity: usize,
    pub backpressure_threshold: f64,
    pub candidate_threshold: f64,
    pub min_samples: u64,
    pub nonce_ttl_secs: u64,
    pub freshness_window_secs: u64,
    pub fail_mode: FailMode,
    pub decision_deadline_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub worker_count: usize,
    pub maintenance_interval_ms: u64,
    pub retrain_interval_secs: u64,
    pub key_rotation_interval_secs: u64,
    pub pattern_cache_enabled: bool,
    /// Key material directory; in-memory ephemeral keys when unset.
    pub key_dir: Option<PathBuf>,
    /// Audit log file; in-memory sink when unset.
    pub audit_log_path: Option<PathBuf>,
    /// Sqlite state database; in-memory store when unset.
    pub state_db_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 0.1,
            global_rate_limit: 10_000,
            per_key_rate_limit: 1_000,
            queue_capacity: 10_000,
            backpressure_threshold: 0.8,
            candidate_threshold: 80.0,
            min_samples: 20,
            nonce_ttl_secs: 300,
            freshness_window_secs: 300,
            fail_mode: FailMode::Open,
            decision_deadline_ms: 10,
            retry_max_attempts: 3,
            retry_backoff_ms: 5,
            worker_count: 2,
            maintenance_interval_ms: 1_000,
            retrain_interval_secs: 6 * 3_600,
            key_rotation_interval_secs: 30 * 24 * 3_600,
            pattern_cache_enabled: true,
            key_dir: None,
            audit_log_path: None,
            state_db_path: None,
        }
    }
}

/// File layer: every field optional, unknown keys rejected.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    sampling_rate: Option<f64>,
    global_rate_limit: Option<u64>,
    per_key_rate_limit: Option<u64>,
    queue_capacity: Option<usize>,
    backpressure_threshold: Option<f64>,
    candidate_threshold: Option<f64>,
    min_samples: Option<u64>,
    nonce_ttl_secs: Option<u64>,
    freshness_window_secs: Option<u64>,
    fail_mode: Option<String>,
    decision_deadline_ms: Option<u64>,
    retry_max_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
    worker_count: Option<usize>,
    maintenance_interval_ms: Option<u64>,
    retrain_interval_secs: Option<u64>,
    key_rotation_interval_secs: Option<u64>,
    pattern_cache_enabled: Option<bool>,
    key_dir: Option<PathBuf>,
    audit_log_path: Option<PathBuf>,
    state_db_path: Option<PathBuf>,
}

impl PipelineConfig {
    /// Defaults, then the file at `CELLGUARD_CONFIG` (if set), then
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(path) = env_non_empty("CELLGUARD_CONFIG") {
            cfg.apply_file(Path::new(&path))?;
        }
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_file(path)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn decision_deadline(&self) -> Duration {
        Duration::from_millis(self.decision_deadline_ms)
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        let file: FileConfig = toml::from_str(&raw)
            .with_context(|| format!("failed parsing config file {}", path.display()))?;

        self.sampling_rate = file.sampling_rate.unwrap_or(self.sampling_rate);
        self.global_rate_limit = file.global_rate_limit.unwrap_or(self.global_rate_limit);
        self.per_key_rate_limit = file.per_key_rate_limit.unwrap_or(self.per_key_rate_limit);
        self.queue_capacity = file.queue_capacity.unwrap_or(self.queue_capacity);
        self.backpressure_threshold = file
            .backpressure_threshold
            .unwrap_or(self.backpressure_threshold);
        self.candidate_threshold = file.candidate_threshold.unwrap_or(self.candidate_threshold);
        self.min_samples = file.min_samples.unwrap_or(self.min_samples);
        self.nonce_ttl_secs = file.nonce_ttl_secs.unwrap_or(self.nonce_ttl_secs);
        self.freshness_window_secs = file
            .freshness_window_secs
            .unwrap_or(self.freshness_window_secs);
        self.decision_deadline_ms = file
            .decision_deadline_ms
            .unwrap_or(self.decision_deadline_ms);
        self.retry_max_attempts = file.retry_max_attempts.unwrap_or(self.retry_max_attempts);
        self.retry_backoff_ms = file.retry_backoff_ms.unwrap_or(self.retry_backoff_ms);
        self.worker_count = file.worker_count.unwrap_or(self.worker_count);
        self.maintenance_interval_ms = file
            .maintenance_interval_ms
            .unwrap_or(self.maintenance_interval_ms);
        self.retrain_interval_secs = file
            .retrain_interval_secs
            .unwrap_or(self.retrain_interval_secs);
        self.key_rotation_interval_secs = file
            .key_rotation_interval_secs
            .unwrap_or(self.key_rotation_interval_secs);
        self.pattern_cache_enabled = file
            .pattern_cache_enabled
            .unwrap_or(self.pattern_cache_enabled);

        if let Some(raw) = file.fail_mode {
            self.fail_mode = parse_fail_mode(&raw)?;
        }
        if file.key_dir.is_some() {
            self.key_dir = file.key_dir;
        }
        if file.audit_log_path.is_some() {
            self.audit_log_path = file.audit_log_path;
        }
        if file.state_db_path.is_some() {
            self.state_db_path = file.state_db_path;
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(raw) = env_non_empty("CELLGUARD_SAMPLING_RATE") {
            self.sampling_rate = parse_env("CELLGUARD_SAMPLING_RATE", &raw)?;
        }
        if let Some(raw) = env_non_empty("CELLGUARD_GLOBAL_RATE_LIMIT") {
            self.global_rate_limit = parse_env("CELLGUARD_GLOBAL_RATE_LIMIT", &raw)?;
        }
        if let Some(raw) = env_non_empty("CELLGUARD_PER_KEY_RATE_LIMIT") {
            self.per_key_rate_limit = parse_env("CELLGUARD_PER_KEY_RATE_LIMIT", &raw)?;
        }
        if let Some(raw) = env_non_empty("CELLGUARD_QUEUE_CAPACITY") {
            self.queue_capacity = parse_env("CELLGUARD_QUEUE_CAPACITY", &raw)?;
        }
        if let Some(raw) = env_non_empty("CELLGUARD_BACKPRESSURE_THRESHOLD") {
            self.backpressure_threshold = parse_env("CELLGUARD_BACKPRESSURE_THRESHOLD", &raw)?;
        }
        if let Some(raw) = env_non_empty("CELLGUARD_CANDIDATE_THRESHOLD") {
            self.candidate_threshold = parse_env("CELLGUARD_CANDIDATE_THRESHOLD", &raw)?;
        }
        if let Some(raw) = env_non_empty("CELLGUARD_MIN_SAMPLES") {
            self.min_samples = parse_env("CELLGUARD_MIN_SAMPLES", &raw)?;
        }
        if let Some(raw) = env_non_empty("CELLGUARD_NONCE_TTL_SECS") {
            self.nonce_ttl_secs = parse_env("CELLGUARD_NONCE_TTL_SECS", &raw)?;
        }
        if let Some(raw) = env_non_empty("CELLGUARD_FRESHNESS_WINDOW_SECS") {
            self.freshness_window_secs = parse_env("CELLGUARD_FRESHNESS_WINDOW_SECS", &raw)?;
        }
        if let Some(raw) = env_non_empty("CELLGUARD_FAIL_MODE") {
            self.fail_mode = parse_fail_mode(&raw)?;
        }
        if let Some(raw) = env_non_empty("CELLGUARD_DECISION_DEADLINE_MS") {
            self.decision_deadline_ms = parse_env("CELLGUARD_DECISION_DEADLINE_MS", &raw)?;
        }
        if let Some(raw) = env_non_empty("CELLGUARD_WORKER_COUNT") {
            self.worker_count = parse_env("CELLGUARD_WORKER_COUNT", &raw)?;
        }
        if let Some(raw) = env_non_empty("CELLGUARD_KEY_DIR") {
            self.key_dir = Some(PathBuf::from(raw));
        }
        if let Some(raw) = env_non_empty("CELLGUARD_AUDIT_LOG") {
            self.audit_log_path = Some(PathBuf::from(raw));
        }
        if let Some(raw) = env_non_empty("CELLGUARD_STATE_DB") {
            self.state_db_path = Some(PathBuf::from(raw));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.sampling_rate > 0.0 && self.sampling_rate <= 1.0) {
            bail!(
                "sampling_rate must be in (0, 1], got {}",
                self.sampling_rate
            );
        }
        if !(0.0..=100.0).contains(&self.candidate_threshold) {
            bail!(
                "candidate_threshold must be in [0, 100], got {}",
                self.candidate_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.backpressure_threshold) {
            bail!(
                "backpressure_threshold must be in [0, 1], got {}",
                self.backpressure_threshold
            );
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be nonzero");
        }
        if self.global_rate_limit == 0 || self.per_key_rate_limit == 0 {
            bail!("rate limits must be nonzero");
        }
        if self.min_samples == 0 {
            bail!("min_samples must be nonzero");
        }
        if self.worker_count == 0 {
            bail!("worker_count must be nonzero");
        }
        if self.retry_max_attempts == 0 {
            bail!("retry_max_attempts must be nonzero");
        }
        Ok(())
    }
}

fn parse_fail_mode(raw: &str) -> Result<FailMode> {
    FailMode::parse(raw).with_context(|| format!("unknown fail_mode {:?}", raw))
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|err| anyhow::anyhow!("invalid {}={:?}: {}", name, raw, err))
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
