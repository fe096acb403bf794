use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crypto_core::{generate_nonce, KeyHandle};
use telemetry::{
    decision_signing_payload, event_signing_payload, now_unix_ms, Decision, SignedDecision,
    SignedEvent, TelemetryEvent,
};

mod retry;

pub use retry::RetryPolicy;

#[derive(Debug)]
pub enum ServiceError {
    Timeout,
    Unavailable(String),
    Rejected(String),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "decision service timeout"),
            Self::Unavailable(msg) => write!(f, "decision service unavailable: {}", msg),
            Self::Rejected(msg) => write!(f, "decision service rejected event: {}", msg),
        }
    }
}

impl std::error::Error for ServiceError {}

/// The seam between the producer side and the decision engine. The
/// engine implements this in-process; tests plug in doubles.
pub trait DecisionService: Send + Sync {
    fn decide(&self, event: &SignedEvent) -> Result<SignedDecision, ServiceError>;
}

/// What to do when the decision engine cannot answer in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    Open,
    Closed,
}

impl FailMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" | "fail-open" => Some(Self::Open),
            "closed" | "fail-closed" => Some(Self::Closed),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Closed => 1,
        }
    }

    fn from_u8(raw: u8) -> Self {
        if raw == 1 {
            Self::Closed
        } else {
            Self::Open
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectorStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub degraded_decisions: u64,
}

/// Outcome handed back to the enforcement side. `degraded` marks a
/// decision synthesized by the fail mode rather than the engine.
#[derive(Debug, Clone)]
pub struct ConnectorOutcome {
    pub decision: SignedDecision,
    pub degraded: bool,
    pub attempts: u32,
}

/// Signs telemetry events and delivers them to the decision service
/// under a deadline, retrying with exponential backoff before falling
/// back to the configured fail mode.
pub struct Connector {
    service: Arc<dyn DecisionService>,
    keys: KeyHandle,
    deadline: Duration,
    retry: RetryPolicy,
    fail_mode: AtomicU8,
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    degraded: AtomicU64,
}

impl Connector {
    pub fn new(
        service: Arc<dyn DecisionService>,
        keys: KeyHandle,
        deadline: Duration,
        retry: RetryPolicy,
        fail_mode: FailMode,
    ) -> Self {
        Self {
            service,
            keys,
            deadline,
            retry,
            fail_mode: AtomicU8::new(fail_mode.as_u8()),
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
        }
    }

    pub fn fail_mode(&self) -> FailMode {
        FailMode::from_u8(self.fail_mode.load(Ordering::Relaxed))
    }

    /// Takes effect for the next call; no restart needed.
    pub fn set_fail_mode(&self, mode: FailMode) {
        self.fail_mode.store(mode.as_u8(), Ordering::Relaxed);
    }

    pub fn sign_event(&self, event: TelemetryEvent) -> Result<SignedEvent, serde_json::Error> {
        let nonce = generate_nonce();
        let ts_unix_ms = now_unix_ms();
        let payload = event_signing_payload(&event, &nonce, ts_unix_ms)?;
        let signature = self.keys.sign(&payload);
        Ok(SignedEvent {
            event,
            nonce,
            ts_unix_ms,
            signature,
        })
    }

    /// Sign and deliver `event`, returning the engine's decision or a
    /// fail-mode fallback. Never returns an error: the caller always
    /// gets an enforceable decision.
    pub fn decide(&self, event: TelemetryEvent) -> ConnectorOutcome {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let mut last_error = String::new();
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                self.retries.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(self.retry.next_delay(attempt - 1));
            }

            // Fresh nonce per attempt: a delivery that timed out after
            // validation has already burned its nonce in the replay
            // cache, so the retry must not reuse it.
            let signed = match self.sign_event(event.clone()) {
                Ok(signed) => signed,
                Err(err) => {
                    last_error = format!("event serialization failed: {}", err);
                    warn!(error = %last_error, "connector could not sign event");
                    continue;
                }
            };

            let started = Instant::now();
            match self.service.decide(&signed) {
                Ok(decision) => {
                    let elapsed = started.elapsed();
                    if elapsed > self.deadline {
                        last_error = format!(
                            "decision exceeded deadline: {:.2}ms",
                            elapsed.as_secs_f64() * 1000.0
                        );
                        warn!(
                            attempt,
                            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                            "decision service exceeded deadline"
                        );
                        continue;
                    }
                    self.successes.fetch_add(1, Ordering::Relaxed);
                    return ConnectorOutcome {
                        decision,
                        degraded: false,
                        attempts: attempt + 1,
                    };
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(attempt, error = %last_error, "decision service call failed");
                }
            }
        }

        self.failures.fetch_add(1, Ordering::Relaxed);
        self.degraded.fetch_add(1, Ordering::Relaxed);
        self.fallback_outcome(&event.event_id, &last_error)
    }

    fn fallback_outcome(&self, event_id: &str, error: &str) -> ConnectorOutcome {
        let now = now_unix_ms();
        let decision = match self.fail_mode() {
            FailMode::Open => {
                warn!(event_id, error, "fail-open: allowing without decision");
                Decision::allow(event_id, format!("fail-open: {}", error), 0.0, now)
            }
            FailMode::Closed => {
                warn!(event_id, error, "fail-closed: blocking without decision");
                Decision::block(event_id, format!("fail-closed: {}", error), 100.0, now)
            }
        };

        let signature = decision_signing_payload(&decision)
            .map(|payload| self.keys.sign(&payload))
            .unwrap_or_default();

        ConnectorOutcome {
            decision: SignedDecision {
                decision,
                signature,
            },
            degraded: true,
            attempts: self.retry.max_attempts,
        }
    }

    pub fn stats(&self) -> ConnectorStats {
        ConnectorStats {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            degraded_decisions: self.degraded.load(Ordering::Relaxed),
        }
    }
}
