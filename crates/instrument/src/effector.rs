use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{error, warn};

use connector::ConnectorOutcome;
use crypto_core::KeyHandle;
use telemetry::Verdict;

#[derive(Debug, Clone, PartialEq)]
pub enum Enforcement {
    Allow { degraded: bool },
    Block { reason: String, score: f64 },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EffectorStats {
    pub allows: u64,
    pub blocks: u64,
    pub verify_failures: u64,
    pub internal_errors: u64,
}

/// Applies verified decisions at the call site. Enforcement must never
/// take the application down: an unverifiable or malformed decision
/// degrades to allow, counted and logged.
pub struct Effector {
    keys: KeyHandle,
    allows: AtomicU64,
    blocks: AtomicU64,
    verify_failures: AtomicU64,
    internal_errors: AtomicU64,
}

impl Effector {
    pub fn new(keys: KeyHandle) -> Self {
        Self {
            keys,
            allows: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
            verify_failures: AtomicU64::new(0),
            internal_errors: AtomicU64::new(0),
        }
    }

    pub fn apply(&self, outcome: &ConnectorOutcome) -> Enforcement {
        let signed = &outcome.decision;

        let payload = match signed.signing_payload() {
            Ok(payload) => payload,
            Err(err) => {
                self.internal_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %err, "decision payload unserializable; allowing");
                return Enforcement::Allow { degraded: true };
            }
        };

        if !self.keys.verify(&payload, &signed.signature) {
            self.verify_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                event_id = %signed.decision.event_id,
                "decision signature failed verification; allowing"
            );
            return Enforcement::Allow { degraded: true };
        }

        match signed.decision.verdict {
            Verdict::Allow => {
                self.allows.fetch_add(1, Ordering::Relaxed);
                Enforcement::Allow {
                    degraded: outcome.degraded,
                }
            }
            Verdict::Block => {
                self.blocks.fetch_add(1, Ordering::Relaxed);
                Enforcement::Block {
                    reason: signed.decision.reason.clone(),
                    score: signed.decision.score,
                }
            }
        }
    }

    pub fn stats(&self) -> EffectorStats {
        EffectorStats {
            allows: self.allows.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            verify_failures: self.verify_failures.load(Ordering::Relaxed),
            internal_errors: self.internal_errors.load(Ordering::Relaxed),
        }
    }
}
