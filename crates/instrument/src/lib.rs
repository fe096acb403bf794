use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::warn;

use audit_log::{AuditEntry, AuditKind, AuditSink};
use connector::Connector;
use crypto_core::{generate_nonce, KeyHandle};
use telemetry::{
    now_unix_ms, ArgMetadata, BackpressureSignal, ResourceTags, SubjectKey, TelemetryEvent,
};

mod effector;
mod rate_limiter;
mod redaction;
mod sampler;

pub use effector::{Effector, EffectorStats, Enforcement};
pub use rate_limiter::{RateLimiter, RateLimiterStats};
pub use redaction::{ArgDigest, PiiRedactor};
pub use sampler::Sampler;

/// A monitored call was denied by the decision engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Blocked {
    pub subject: String,
    pub reason: String,
    pub score: f64,
}

impl fmt::Display for Blocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "call to {} blocked: {} (score {:.1})",
            self.subject, self.reason, self.score
        )
    }
}

impl std::error::Error for Blocked {}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub sampling_rate: f64,
    pub global_rate_limit: u64,
    pub per_key_rate_limit: u64,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            sampling_rate: 0.1,
            global_rate_limit: 10_000,
            per_key_rate_limit: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStats {
    pub observed_calls: u64,
    pub sampled_calls: u64,
    pub throttled_calls: u64,
    pub blocked_calls: u64,
    pub degraded_decisions: u64,
    pub instrumentation_errors: u64,
    pub current_sampling_rate: f64,
    pub rate_limiter: RateLimiterStats,
    pub effector: EffectorStats,
}

/// The call-site entry point. Monitored code calls one of the
/// `observe*` methods; the agent samples, redacts, ships, and enforces.
///
/// Hard contract: no internal failure of the agent may escape into the
/// monitored call path. Every fallible step inside `observe_inner`
/// resolves to "run the call untouched" plus a log line.
pub struct Agent {
    redactor: PiiRedactor,
    rate_limiter: RateLimiter,
    sampler: Sampler,
    connector: Arc<Connector>,
    effector: Effector,
    audit: Arc<dyn AuditSink>,
    last_backpressure: Mutex<BackpressureSignal>,
    observed: AtomicU64,
    sampled: AtomicU64,
    throttled: AtomicU64,
    blocked: AtomicU64,
    degraded: AtomicU64,
    errors: AtomicU64,
}

impl Agent {
    pub fn new(
        connector: Arc<Connector>,
        keys: KeyHandle,
        audit: Arc<dyn AuditSink>,
        options: AgentOptions,
    ) -> Self {
        Self {
            redactor: PiiRedactor::new(),
            rate_limiter: RateLimiter::new(
                options.global_rate_limit,
                options.per_key_rate_limit,
            ),
            sampler: Sampler::new(options.sampling_rate),
            connector,
            effector: Effector::new(keys),
            audit,
            last_backpressure: Mutex::new(BackpressureSignal::inactive()),
            observed: AtomicU64::new(0),
            sampled: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn redactor(&self) -> &PiiRedactor {
        &self.redactor
    }

    /// Run `call` under monitoring; a block verdict surfaces as an
    /// error and the call's result is discarded.
    pub fn observe<R>(
        &self,
        module: &str,
        function: &str,
        call: impl FnOnce() -> R,
    ) -> Result<R, Blocked> {
        self.observe_with_args(module, function, ArgMetadata::default(), call)
    }

    pub fn observe_with_args<R>(
        &self,
        module: &str,
        function: &str,
        args: ArgMetadata,
        call: impl FnOnce() -> R,
    ) -> Result<R, Blocked> {
        let (value, blocked) = self.observe_inner(SubjectKey::new(module, function), args, call);
        match blocked {
            Some(blocked) => Err(blocked),
            None => Ok(value),
        }
    }

    /// Block verdicts substitute the type's default value, the
    /// zero/empty/false stand-in for the declared return shape.
    pub fn observe_or_default<R: Default>(
        &self,
        module: &str,
        function: &str,
        call: impl FnOnce() -> R,
    ) -> R {
        self.observe_or_else(module, function, R::default, call)
    }

    pub fn observe_or<R>(
        &self,
        module: &str,
        function: &str,
        fallback: R,
        call: impl FnOnce() -> R,
    ) -> R {
        self.observe_or_else(module, function, move || fallback, call)
    }

    pub fn observe_or_else<R>(
        &self,
        module: &str,
        function: &str,
        fallback: impl FnOnce() -> R,
        call: impl FnOnce() -> R,
    ) -> R {
        let (value, blocked) =
            self.observe_inner(SubjectKey::new(module, function), ArgMetadata::default(), call);
        match blocked {
            Some(_) => fallback(),
            None => value,
        }
    }

    fn observe_inner<R>(
        &self,
        subject: SubjectKey,
        args: ArgMetadata,
        call: impl FnOnce() -> R,
    ) -> (R, Option<Blocked>) {
        self.observed.fetch_add(1, Ordering::Relaxed);
        let key = subject.to_string();

        if !self.rate_limiter.check(&key) {
            self.throttled.fetch_add(1, Ordering::Relaxed);
            return (call(), None);
        }

        if !self.sampler.should_sample() {
            return (call(), None);
        }
        self.sampled.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let value = call();
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let event = TelemetryEvent {
            event_id: generate_nonce(),
            subject,
            ts_unix_ms: now_unix_ms(),
            duration_ms,
            args,
            resource_tags: ResourceTags::default(),
            redaction_applied: true,
            sampling_rate: self.sampler.current_rate(),
        };
        let event_id = event.event_id.clone();

        let outcome = self.connector.decide(event);

        if outcome.degraded {
            self.degraded.fetch_add(1, Ordering::Relaxed);
            self.audit_entry(AuditEntry {
                ts_unix_ms: now_unix_ms(),
                kind: AuditKind::Degraded,
                actor: "connector".to_string(),
                action: outcome.decision.decision.verdict.as_str().to_string(),
                subject: Some(key.clone()),
                result: outcome.decision.decision.reason.clone(),
                score: None,
            });
        }

        match self.effector.apply(&outcome) {
            Enforcement::Allow { .. } => (value, None),
            Enforcement::Block { reason, score } => {
                self.blocked.fetch_add(1, Ordering::Relaxed);
                self.audit_entry(AuditEntry {
                    ts_unix_ms: now_unix_ms(),
                    kind: AuditKind::Enforcement,
                    actor: "effector".to_string(),
                    action: "block".to_string(),
                    subject: Some(key.clone()),
                    result: reason.clone(),
                    score: Some(score),
                });
                warn!(subject = %key, event_id = %event_id, score, "call blocked");
                (
                    value,
                    Some(Blocked {
                        subject: key,
                        reason,
                        score,
                    }),
                )
            }
        }
    }

    /// Store the consumer-side flow-control signal and recompute the
    /// effective sampling rate.
    pub fn apply_backpressure(&self, signal: BackpressureSignal) {
        match self.last_backpressure.lock() {
            Ok(mut last) => *last = signal,
            Err(poisoned) => *poisoned.into_inner() = signal,
        }
        self.refresh_sampling();
    }

    /// Recompute the effective sampling rate from the backpressure
    /// signal and the rate limiter's window load. Called once per
    /// window by maintenance, and on every backpressure edge.
    pub fn refresh_sampling(&self) {
        let signal = match self.last_backpressure.lock() {
            Ok(last) => last.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        self.sampler.apply_backpressure(&signal);

        let adjusted = self
            .rate_limiter
            .adjusted_sampling_rate(self.sampler.current_rate());
        self.sampler.set_rate(adjusted);
    }

    pub fn current_sampling_rate(&self) -> f64 {
        self.sampler.current_rate()
    }

    /// Hot-reload the configured sampling rate; backpressure and load
    /// feedback re-apply on top of the new base.
    pub fn set_base_sampling_rate(&self, rate: f64) {
        self.sampler.set_base_rate(rate);
        self.refresh_sampling();
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            observed_calls: self.observed.load(Ordering::Relaxed),
            sampled_calls: self.sampled.load(Ordering::Relaxed),
            throttled_calls: self.throttled.load(Ordering::Relaxed),
            blocked_calls: self.blocked.load(Ordering::Relaxed),
            degraded_decisions: self.degraded.load(Ordering::Relaxed),
            instrumentation_errors: self.errors.load(Ordering::Relaxed),
            current_sampling_rate: self.sampler.current_rate(),
            rate_limiter: self.rate_limiter.stats(),
            effector: self.effector.stats(),
        }
    }

    fn audit_entry(&self, entry: AuditEntry) {
        if let Err(err) = self.audit.append(entry) {
            self.errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "audit append failed");
        }
    }
}
