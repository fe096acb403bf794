use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the unix epoch; 0 if the clock reads pre-epoch.
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Identifies the monitored call site: one profile, one rate-limit
/// bucket, one baseline per subject.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectKey {
    pub module: String,
    pub function: String,
}

impl SubjectKey {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
        }
    }

    /// Parse a `"module.function"` rendering; the last dot splits.
    pub fn parse(raw: &str) -> Option<Self> {
        let (module, function) = raw.rsplit_once('.')?;
        if module.is_empty() || function.is_empty() {
            return None;
        }
        Some(Self::new(module, function))
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.function)
    }
}

/// Argument shape metadata only; raw values never leave the call site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArgMetadata {
    pub arg_count: usize,
    pub arg_types: Vec<String>,
    pub arg_hashes: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTags {
    pub io_operations: u64,
    pub network_calls: u64,
    pub file_access: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_id: String,
    pub subject: SubjectKey,
    pub ts_unix_ms: u64,
    pub duration_ms: f64,
    pub args: ArgMetadata,
    pub resource_tags: ResourceTags,
    pub redaction_applied: bool,
    pub sampling_rate: f64,
}

impl TelemetryEvent {
    pub fn canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Block,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub event_id: String,
    pub verdict: Verdict,
    pub score: f64,
    pub reason: String,
    pub ts_unix_ms: u64,
}

impl Decision {
    pub fn allow(
        event_id: impl Into<String>,
        reason: impl Into<String>,
        score: f64,
        ts_unix_ms: u64,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            verdict: Verdict::Allow,
            score,
            reason: reason.into(),
            ts_unix_ms,
        }
    }

    pub fn block(
        event_id: impl Into<String>,
        reason: impl Into<String>,
        score: f64,
        ts_unix_ms: u64,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            verdict: Verdict::Block,
            score,
            reason: reason.into(),
            ts_unix_ms,
        }
    }

    pub fn is_allow(&self) -> bool {
        self.verdict == Verdict::Allow
    }

    pub fn is_block(&self) -> bool {
        self.verdict == Verdict::Block
    }

    pub fn canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Telemetry event plus nonce and HMAC signature. The signature covers
/// the exact canonical bytes from `event_signing_payload`; any mutation
/// of event, nonce, or timestamp invalidates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEvent {
    pub event: TelemetryEvent,
    pub nonce: String,
    pub ts_unix_ms: u64,
    pub signature: String,
}

impl SignedEvent {
    pub fn signing_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        event_signing_payload(&self.event, &self.nonce, self.ts_unix_ms)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

pub fn event_signing_payload(
    event: &TelemetryEvent,
    nonce: &str,
    ts_unix_ms: u64,
) -> Result<Vec<u8>, serde_json::Error> {
    let event_json = event.canonical_json()?;
    Ok(format!("{}|{}|{}", event_json, nonce, ts_unix_ms).into_bytes())
}

/// Decision plus HMAC signature, verified by the enforcement side
/// before any verdict is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedDecision {
    pub decision: Decision,
    pub signature: String,
}

impl SignedDecision {
    pub fn signing_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        decision_signing_payload(&self.decision)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

pub fn decision_signing_payload(decision: &Decision) -> Result<Vec<u8>, serde_json::Error> {
    Ok(decision.canonical_json()?.into_bytes())
}

/// Learned statistical profile of a subject's normal behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineProfile {
    pub subject: SubjectKey,
    pub version: u32,
    pub created_ts_ms: u64,
    pub updated_ts_ms: u64,
    pub sample_count: u64,
    pub mean_duration_ms: f64,
    pub std_duration_ms: f64,
    pub p50_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub p99_duration_ms: f64,
    /// Recent L2 distances observed for this subject, oldest first.
    /// Bounded by the profiler; backs the percentile-rank score.
    pub historical_distances: Vec<f64>,
}

impl BaselineProfile {
    pub fn is_sufficient(&self, min_samples: u64) -> bool {
        self.sample_count >= min_samples
    }
}

/// An active detection kept in the state store for review/export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorRecord {
    pub id: String,
    pub subject: SubjectKey,
    pub score: f64,
    pub reason: String,
    pub created_ts_ms: u64,
    pub expires_ts_ms: u64,
}

impl DetectorRecord {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_ts_ms
    }
}

/// Consumer-to-producer flow-control signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackpressureSignal {
    pub active: bool,
    pub recommended_rate: f64,
    pub utilization: f64,
    pub reason: String,
}

impl BackpressureSignal {
    pub fn inactive() -> Self {
        Self {
            active: false,
            recommended_rate: 1.0,
            utilization: 0.0,
            reason: "normal operation".to_string(),
        }
    }
}

#[cfg(test)]
mod tests;
