use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use audit_log::{AuditEntry, AuditKind, AuditSink};
use connector::{DecisionService, ServiceError};
use crypto_core::KeyHandle;
use state_store::StateStore;
use telemetry::{
    decision_signing_payload, now_unix_ms, BackpressureSignal, BaselineProfile, Decision,
    DetectorRecord, SignedDecision, SignedEvent, TelemetryEvent,
};

mod detector;
mod nonce_cache;
mod normalizer;
mod pattern_cache;
mod profiler;
mod queue;
mod validator;

pub use detector::{AnomalyDetector, ScoredEvent};
pub use nonce_cache::NonceCache;
pub use normalizer::FeatureNormalizer;
pub use pattern_cache::PatternCache;
pub use profiler::{BaselineProfiler, SampleWindow};
pub use queue::{BackpressureController, EventQueue, QueueStats};
pub use validator::{SecurityValidator, ValidationError, ValidatorStats};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub min_samples: u64,
    pub candidate_threshold: f64,
    pub freshness_window_ms: u64,
    pub clock_skew_ms: u64,
    pub nonce_ttl_ms: u64,
    pub nonce_capacity: usize,
    pub queue_capacity: usize,
    pub backpressure_threshold: f64,
    pub decision_deadline: Duration,
    pub window_limit: usize,
    pub history_limit: usize,
    pub min_history: usize,
    pub detector_record_ttl_ms: u64,
    pub pattern_cache_enabled: bool,
    pub pattern_ttl_ms: u64,
    pub pattern_capacity: usize,
    pub shard_count: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            min_samples: 20,
            candidate_threshold: 80.0,
            freshness_window_ms: 300_000,
            clock_skew_ms: 5_000,
            nonce_ttl_ms: 300_000,
            nonce_capacity: 100_000,
            queue_capacity: 10_000,
            backpressure_threshold: 0.8,
            decision_deadline: Duration::from_millis(10),
            window_limit: 1_024,
            history_limit: 512,
            min_history: 20,
            detector_record_ttl_ms: 3_600_000,
            pattern_cache_enabled: true,
            pattern_ttl_ms: 1_800_000,
            pattern_capacity: 10_000,
            shard_count: 16,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub events_processed: u64,
    pub training_events: u64,
    pub scored_events: u64,
    pub allows: u64,
    pub blocks: u64,
    pub security_violations: u64,
    pub statistical_errors: u64,
    pub pattern_cache_hits: u64,
    pub queue: QueueStats,
    pub validator: ValidatorStats,
}

struct KeyState {
    window: SampleWindow,
    profile: Option<BaselineProfile>,
}

struct PendingEvent {
    event: TelemetryEvent,
    responder: SyncSender<SignedDecision>,
}

/// The decision engine: validates signed events, runs them through the
/// bounded queue to scoring workers, maintains per-subject baselines,
/// and issues signed verdicts.
///
/// Per-subject state lives in key-sharded maps so concurrent workers
/// never race on one subject's statistics.
pub struct Engine {
    options: EngineOptions,
    keys: KeyHandle,
    validator: SecurityValidator,
    queue: EventQueue<PendingEvent>,
    backpressure: BackpressureController,
    profiler: BaselineProfiler,
    detector: AnomalyDetector,
    patterns: PatternCache,
    store: Arc<dyn StateStore>,
    audit: Arc<dyn AuditSink>,
    shards: Vec<Mutex<HashMap<String, KeyState>>>,
    processed: AtomicU64,
    training: AtomicU64,
    scored: AtomicU64,
    allows: AtomicU64,
    blocks: AtomicU64,
    violations: AtomicU64,
    stat_errors: AtomicU64,
}

impl Engine {
    pub fn new(
        keys: KeyHandle,
        store: Arc<dyn StateStore>,
        audit: Arc<dyn AuditSink>,
        options: EngineOptions,
    ) -> Self {
        let validator = SecurityValidator::new(
            keys.clone(),
            options.nonce_capacity,
            options.nonce_ttl_ms,
            options.freshness_window_ms,
            options.clock_skew_ms,
        );
        let shard_count = options.shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();

        Self {
            queue: EventQueue::new(options.queue_capacity),
            backpressure: BackpressureController::new(options.backpressure_threshold),
            profiler: BaselineProfiler::new(options.min_samples),
            detector: AnomalyDetector::new(options.min_history),
            patterns: PatternCache::new(options.pattern_ttl_ms, options.pattern_capacity),
            validator,
            keys,
            store,
            audit,
            shards,
            options,
            processed: AtomicU64::new(0),
            training: AtomicU64::new(0),
            scored: AtomicU64::new(0),
            allows: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
            violations: AtomicU64::new(0),
            stat_errors: AtomicU64::new(0),
        }
    }

    /// Pull one admitted event off the queue and score it. Returns
    /// false when nothing was processed within `timeout`.
    pub fn process_one(&self, timeout: Duration) -> bool {
        let Some(pending) = self.queue.dequeue_timeout(timeout) else {
            return false;
        };
        let decision = self.score_event(&pending.event);
        // The caller may have given up on its deadline already.
        if pending.responder.try_send(decision).is_err() {
            debug!("caller abandoned decision before it was ready");
        }
        true
    }

    /// Current flow-control signal; polled by maintenance and fed back
    /// to the producers.
    pub fn backpressure_signal(&self) -> BackpressureSignal {
        self.backpressure.check(self.queue.utilization())
    }

    pub fn sweep_nonces(&self, now_ms: u64) -> usize {
        self.validator.sweep_nonces(now_ms)
    }

    pub fn evict_patterns(&self, now_ms: u64) -> usize {
        self.patterns.evict_expired(now_ms)
    }

    pub fn expire_detector_records(&self, now_ms: u64) -> usize {
        match self.store.expire_old(now_ms) {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "detector record expiry failed");
                0
            }
        }
    }

    /// Rebuild every sufficient baseline from its current sliding
    /// window; returns how many profiles were versioned up.
    pub fn retrain(&self, now_ms: u64) -> usize {
        let mut retrained = 0;
        for shard in &self.shards {
            let mut shard = lock_shard(shard);
            for (key, state) in shard.iter_mut() {
                if !self.profiler.has_sufficient_samples(&state.window) {
                    continue;
                }
                let subject = match &state.profile {
                    Some(profile) => profile.subject.clone(),
                    None => match telemetry::SubjectKey::parse(key) {
                        Some(subject) => subject,
                        None => continue,
                    },
                };
                if let Some(profile) = self.profiler.build_profile(
                    &subject,
                    &state.window,
                    state.profile.as_ref(),
                    now_ms,
                ) {
                    if let Err(err) = self.store.store_baseline(&profile) {
                        warn!(subject = %key, error = %err, "baseline persist failed");
                    }
                    debug!(subject = %key, version = profile.version, "baseline retrained");
                    state.profile = Some(profile);
                    retrained += 1;
                }
            }
        }
        retrained
    }

    /// Stop admitting events and wake idle workers.
    pub fn shutdown(&self) {
        self.queue.close();
    }

    /// True once `shutdown` ran; workers exit when this is set and
    /// `process_one` finds the queue drained.
    pub fn is_shutdown(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            events_processed: self.processed.load(Ordering::Relaxed),
            training_events: self.training.load(Ordering::Relaxed),
            scored_events: self.scored.load(Ordering::Relaxed),
            allows: self.allows.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            security_violations: self.violations.load(Ordering::Relaxed),
            statistical_errors: self.stat_errors.load(Ordering::Relaxed),
            pattern_cache_hits: self.patterns.hit_count(),
            queue: self.queue.stats(),
            validator: self.validator.stats(),
        }
    }

    fn score_event(&self, event: &TelemetryEvent) -> SignedDecision {
        let now = now_unix_ms();
        self.processed.fetch_add(1, Ordering::Relaxed);
        let key = event.subject.to_string();

        let decision = {
            let shard = &self.shards[shard_index(&key, self.shards.len())];
            let mut shard = lock_shard(shard);
            let state = shard.entry(key.clone()).or_insert_with(|| {
                let profile = match self.store.get_baseline(&event.subject) {
                    Ok(profile) => profile,
                    Err(err) => {
                        warn!(subject = %key, error = %err, "baseline load failed");
                        self.stat_errors.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                };
                KeyState {
                    window: SampleWindow::new(self.options.window_limit),
                    profile,
                }
            });

            let is_trained = state
                .profile
                .as_ref()
                .map(|p| p.is_sufficient(self.options.min_samples))
                .unwrap_or(false);

            // The fast path only applies to trained subjects; during
            // the learning phase every event must reach the window.
            if is_trained
                && self.options.pattern_cache_enabled
                && self.patterns.check_match(event, now)
            {
                self.allows.fetch_add(1, Ordering::Relaxed);
                Decision::allow(
                    event.event_id.clone(),
                    "known legitimate pattern",
                    0.0,
                    now,
                )
            } else {
                state.window.push(event.duration_ms);
                if !is_trained {
                    self.train(event, state, now)
                } else {
                    self.score_against_baseline(event, state, now)
                }
            }
        };

        self.audit_decision(&key, &decision);
        self.sign_decision(decision)
    }

    fn train(&self, event: &TelemetryEvent, state: &mut KeyState, now: u64) -> Decision {
        self.training.fetch_add(1, Ordering::Relaxed);

        if self.profiler.has_sufficient_samples(&state.window) {
            if let Some(profile) = self.profiler.build_profile(
                &event.subject,
                &state.window,
                state.profile.as_ref(),
                now,
            ) {
                if let Err(err) = self.store.store_baseline(&profile) {
                    warn!(subject = %event.subject, error = %err, "baseline persist failed");
                }
                debug!(subject = %event.subject, version = profile.version, "baseline established");
                state.profile = Some(profile);
            }
        }

        if self.options.pattern_cache_enabled {
            self.patterns.add_pattern(event, now);
        }
        self.allows.fetch_add(1, Ordering::Relaxed);
        Decision::allow(event.event_id.clone(), "training", 0.0, now)
    }

    fn score_against_baseline(
        &self,
        event: &TelemetryEvent,
        state: &mut KeyState,
        now: u64,
    ) -> Decision {
        let Some(profile) = state.profile.as_mut() else {
            // Unreachable in practice; degrade to a neutral allow.
            self.stat_errors.fetch_add(1, Ordering::Relaxed);
            return Decision::allow(event.event_id.clone(), "missing baseline", 0.0, now);
        };

        self.scored.fetch_add(1, Ordering::Relaxed);
        let scored = self.detector.score(event.duration_ms, profile);

        profile.historical_distances.push(scored.distance);
        let excess = profile
            .historical_distances
            .len()
            .saturating_sub(self.options.history_limit);
        if excess > 0 {
            profile.historical_distances.drain(0..excess);
        }
        profile.updated_ts_ms = now;

        if scored.score >= self.options.candidate_threshold {
            self.blocks.fetch_add(1, Ordering::Relaxed);
            let reason = format!("anomaly detected (score {:.1})", scored.score);
            let record = DetectorRecord {
                id: format!("det-{}", event.event_id),
                subject: event.subject.clone(),
                score: scored.score,
                reason: reason.clone(),
                created_ts_ms: now,
                expires_ts_ms: now.saturating_add(self.options.detector_record_ttl_ms),
            };
            if let Err(err) = self.store.store_record(&record) {
                warn!(subject = %event.subject, error = %err, "detector record persist failed");
            }
            Decision::block(event.event_id.clone(), reason, scored.score, now)
        } else {
            self.allows.fetch_add(1, Ordering::Relaxed);
            if self.options.pattern_cache_enabled {
                self.patterns.add_pattern(event, now);
            }
            Decision::allow(
                event.event_id.clone(),
                "normal behavior",
                scored.score,
                now,
            )
        }
    }

    fn sign_decision(&self, decision: Decision) -> SignedDecision {
        let signature = match decision_signing_payload(&decision) {
            Ok(payload) => self.keys.sign(&payload),
            Err(err) => {
                // Unsignable decision degrades to allow at the effector.
                warn!(error = %err, "decision payload unserializable");
                self.stat_errors.fetch_add(1, Ordering::Relaxed);
                String::new()
            }
        };
        SignedDecision {
            decision,
            signature,
        }
    }

    fn audit_decision(&self, subject: &str, decision: &Decision) {
        let entry = AuditEntry {
            ts_unix_ms: decision.ts_unix_ms,
            kind: AuditKind::Decision,
            actor: "engine".to_string(),
            action: decision.verdict.as_str().to_string(),
            subject: Some(subject.to_string()),
            result: decision.reason.clone(),
            score: Some(decision.score),
        };
        if let Err(err) = self.audit.append(entry) {
            warn!(error = %err, "audit append failed");
        }
    }

    fn audit_violation(&self, signed: &SignedEvent, error: &ValidationError) {
        let entry = AuditEntry {
            ts_unix_ms: now_unix_ms(),
            kind: AuditKind::SecurityViolation,
            actor: "security_validator".to_string(),
            action: "reject".to_string(),
            // Only the event id crosses into the audit trail; the
            // payload itself is not re-emitted.
            subject: Some(signed.event.event_id.clone()),
            result: error.to_string(),
            score: None,
        };
        if let Err(err) = self.audit.append(entry) {
            warn!(error = %err, "audit append failed");
        }
    }
}

impl DecisionService for Engine {
    fn decide(&self, signed: &SignedEvent) -> Result<SignedDecision, ServiceError> {
        let now = now_unix_ms();

        if let Err(error) = self.validator.verify(signed, now) {
            self.violations.fetch_add(1, Ordering::Relaxed);
            self.audit_violation(signed, &error);
            // Security rejections are final: a block decision, never a
            // retryable transport error.
            let decision = Decision::block(
                signed.event.event_id.clone(),
                format!("security violation: {}", error),
                100.0,
                now,
            );
            return Ok(self.sign_decision(decision));
        }

        let (responder, receiver) = sync_channel(1);
        let admitted = self.queue.enqueue(PendingEvent {
            event: signed.event.clone(),
            responder,
        });
        if !admitted && self.queue.is_closed() {
            return Err(ServiceError::Unavailable("engine shut down".to_string()));
        }

        match receiver.recv_timeout(self.options.decision_deadline) {
            Ok(decision) => Ok(decision),
            Err(RecvTimeoutError::Timeout) => Err(ServiceError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ServiceError::Rejected(
                "event dropped under queue pressure".to_string(),
            )),
        }
    }
}

fn shard_index(key: &str, shard_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

fn lock_shard(
    shard: &Mutex<HashMap<String, KeyState>>,
) -> std::sync::MutexGuard<'_, HashMap<String, KeyState>> {
    match shard.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests;
