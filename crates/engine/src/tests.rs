use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::*;
use audit_log::MemoryAuditSink;
use crypto_core::SigningKey;
use state_store::{MemoryStore, StateStore};
use telemetry::{event_signing_payload, ArgMetadata, ResourceTags, SubjectKey, Verdict};

fn test_options() -> EngineOptions {
    EngineOptions {
        min_samples: 20,
        decision_deadline: Duration::from_millis(500),
        pattern_cache_enabled: false,
        ..EngineOptions::default()
    }
}

struct Harness {
    engine: Arc<Engine>,
    keys: KeyHandle,
    store: Arc<MemoryStore>,
    audit: Arc<MemoryAuditSink>,
    workers: Vec<thread::JoinHandle<()>>,
    next_event: std::sync::atomic::AtomicU64,
}

impl Harness {
    fn new(options: EngineOptions, worker_count: usize) -> Self {
        let keys = KeyHandle::ephemeral();
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditSink::new(SigningKey::generate()));
        let engine = Arc::new(Engine::new(
            keys.clone(),
            store.clone(),
            audit.clone(),
            options,
        ));

        let workers = (0..worker_count)
            .map(|_| {
                let engine = engine.clone();
                thread::spawn(move || loop {
                    if !engine.process_one(Duration::from_millis(20)) && engine.is_shutdown() {
                        break;
                    }
                })
            })
            .collect();

        Self {
            engine,
            keys,
            store,
            audit,
            workers,
            next_event: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn event(&self, duration_ms: f64) -> TelemetryEvent {
        let n = self
            .next_event
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        TelemetryEvent {
            event_id: format!("ev-{}", n),
            subject: SubjectKey::new("pay", "transfer"),
            ts_unix_ms: now_unix_ms(),
            duration_ms,
            args: ArgMetadata::default(),
            resource_tags: ResourceTags::default(),
            redaction_applied: true,
            sampling_rate: 1.0,
        }
    }

    fn sign(&self, event: TelemetryEvent) -> SignedEvent {
        let nonce = crypto_core::generate_nonce();
        let ts = now_unix_ms();
        let payload = event_signing_payload(&event, &nonce, ts).expect("payload");
        let signature = self.keys.sign(&payload);
        SignedEvent {
            event,
            nonce,
            ts_unix_ms: ts,
            signature,
        }
    }

    fn decide(&self, duration_ms: f64) -> SignedDecision {
        let signed = self.sign(self.event(duration_ms));
        self.engine.decide(&signed).expect("decision")
    }

    fn shutdown(mut self) {
        self.engine.shutdown();
        for worker in self.workers.drain(..) {
            worker.join().expect("worker join");
        }
    }
}

#[test]
fn training_events_are_allowed_and_build_a_baseline() {
    let harness = Harness::new(test_options(), 1);

    for i in 0..20 {
        let decision = harness.decide(10.0 + (i % 5) as f64 * 0.2);
        assert_eq!(decision.decision.verdict, Verdict::Allow);
        assert_eq!(decision.decision.reason, "training");
    }

    let baseline = harness
        .store
        .get_baseline(&SubjectKey::new("pay", "transfer"))
        .expect("store read")
        .expect("baseline exists");
    assert_eq!(baseline.version, 1);
    assert_eq!(baseline.sample_count, 20);

    assert_eq!(harness.engine.stats().training_events, 20);
    harness.shutdown();
}

#[test]
fn anomalous_duration_is_blocked_with_high_score() {
    let harness = Harness::new(test_options(), 1);

    // Train on 9..11ms durations (zero-mean jitter), then feed normal
    // mean-duration traffic so the distance history fills in.
    for i in 0..20 {
        let jitter = (i % 5) as f64 * 0.5 - 1.0;
        let decision = harness.decide(10.0 + jitter);
        assert_eq!(decision.decision.verdict, Verdict::Allow);
    }
    for i in 0..30 {
        let decision = harness.decide(10.0);
        assert_eq!(
            decision.decision.verdict,
            Verdict::Allow,
            "normal event {} blocked: {}",
            i,
            decision.decision.reason
        );
    }

    let decision = harness.decide(200.0);
    assert_eq!(decision.decision.verdict, Verdict::Block);
    assert!(decision.decision.score >= 95.0, "score {}", decision.decision.score);
    assert!(decision.decision.reason.contains("anomaly detected"));

    // A blocked detection leaves an active record behind.
    let records = harness
        .store
        .get_active_records(&SubjectKey::new("pay", "transfer"))
        .expect("records");
    assert_eq!(records.len(), 1);

    harness.shutdown();
}

#[test]
fn identical_resend_is_rejected_as_replay() {
    let harness = Harness::new(test_options(), 1);

    let signed = harness.sign(harness.event(10.0));
    let first = harness.engine.decide(&signed).expect("first decision");
    assert_eq!(first.decision.verdict, Verdict::Allow);

    let second = harness.engine.decide(&signed).expect("second decision");
    assert_eq!(second.decision.verdict, Verdict::Block);
    assert!(second.decision.reason.contains("replay"));

    let stats = harness.engine.stats();
    assert_eq!(stats.security_violations, 1);

    let audit = harness.audit.records();
    assert!(audit
        .iter()
        .any(|r| r.kind == audit_log::AuditKind::SecurityViolation));

    harness.shutdown();
}

#[test]
fn mutated_payload_is_rejected() {
    let harness = Harness::new(test_options(), 1);

    let mut signed = harness.sign(harness.event(10.0));
    signed.event.duration_ms = 9_999.0;

    let decision = harness.engine.decide(&signed).expect("decision");
    assert_eq!(decision.decision.verdict, Verdict::Block);
    assert!(decision.decision.reason.contains("invalid signature"));

    harness.shutdown();
}

#[test]
fn decisions_are_signed_with_the_engine_key() {
    let harness = Harness::new(test_options(), 1);

    let decision = harness.decide(10.0);
    let payload = decision.signing_payload().expect("payload");
    assert!(harness.keys.verify(&payload, &decision.signature));

    harness.shutdown();
}

#[test]
fn decide_times_out_without_workers() {
    let harness = Harness::new(
        EngineOptions {
            decision_deadline: Duration::from_millis(20),
            ..test_options()
        },
        0,
    );

    let signed = harness.sign(harness.event(10.0));
    match harness.engine.decide(&signed) {
        Err(ServiceError::Timeout) => {}
        other => panic!("expected timeout, got {:?}", other.map(|d| d.decision)),
    }

    harness.shutdown();
}

#[test]
fn trained_subject_hits_the_pattern_cache() {
    let harness = Harness::new(
        EngineOptions {
            pattern_cache_enabled: true,
            ..test_options()
        },
        1,
    );

    for _ in 0..25 {
        harness.decide(10.0);
    }

    let before = harness.engine.stats().pattern_cache_hits;
    let decision = harness.decide(10.0);
    assert_eq!(decision.decision.verdict, Verdict::Allow);
    assert!(harness.engine.stats().pattern_cache_hits > before);

    harness.shutdown();
}

#[test]
fn retrain_builds_a_new_baseline_version() {
    let harness = Harness::new(test_options(), 1);

    for _ in 0..30 {
        harness.decide(10.0);
    }

    let retrained = harness.engine.retrain(now_unix_ms());
    assert_eq!(retrained, 1);

    let baseline = harness
        .store
        .get_baseline(&SubjectKey::new("pay", "transfer"))
        .expect("store read")
        .expect("baseline exists");
    assert_eq!(baseline.version, 2);

    harness.shutdown();
}

#[test]
fn backpressure_signal_follows_queue_depth() {
    let harness = Harness::new(
        EngineOptions {
            queue_capacity: 10,
            backpressure_threshold: 0.5,
            ..test_options()
        },
        0,
    );

    let idle = harness.engine.backpressure_signal();
    assert!(!idle.active);

    // No workers: admitted events sit in the queue.
    let mut waiters = Vec::new();
    for _ in 0..8 {
        let signed = harness.sign(harness.event(10.0));
        let engine = harness.engine.clone();
        waiters.push(thread::spawn(move || {
            let _ = engine.decide(&signed);
        }));
    }
    for waiter in waiters {
        waiter.join().expect("join");
    }

    let signal = harness.engine.backpressure_signal();
    assert!(signal.active);
    assert!(signal.recommended_rate < 1.0);

    harness.shutdown();
}

#[test]
fn nonce_sweep_removes_expired_entries() {
    let harness = Harness::new(test_options(), 1);

    harness.decide(10.0);
    harness.decide(10.0);
    assert_eq!(harness.engine.sweep_nonces(now_unix_ms()), 0);

    let far_future = now_unix_ms() + 600_000;
    assert_eq!(harness.engine.sweep_nonces(far_future), 2);

    harness.shutdown();
}
