use super::*;

pub(crate) fn sample_event(id: &str, duration_ms: f64) -> TelemetryEvent {
    TelemetryEvent {
        event_id: id.to_string(),
        subject: SubjectKey::new("pay", "transfer"),
        ts_unix_ms: 1_700_000_000_000,
        duration_ms,
        args: ArgMetadata {
            arg_count: 2,
            arg_types: vec!["u64".to_string(), "String".to_string()],
            arg_hashes: vec!["aa".to_string(), "bb".to_string()],
        },
        resource_tags: ResourceTags::default(),
        redaction_applied: true,
        sampling_rate: 0.1,
    }
}

#[test]
fn subject_key_renders_and_parses() {
    let key = SubjectKey::new("billing.api", "charge");
    assert_eq!(key.to_string(), "billing.api.charge");

    let parsed = SubjectKey::parse("billing.api.charge").expect("parse");
    assert_eq!(parsed.module, "billing.api");
    assert_eq!(parsed.function, "charge");

    assert!(SubjectKey::parse("nodot").is_none());
    assert!(SubjectKey::parse(".f").is_none());
}

#[test]
fn signed_event_wire_roundtrip() {
    let signed = SignedEvent {
        event: sample_event("ev-1", 12.5),
        nonce: "abcd1234".to_string(),
        ts_unix_ms: 1_700_000_000_123,
        signature: "deadbeef".to_string(),
    };

    let json = signed.to_json().expect("encode");
    let decoded = SignedEvent::from_json(&json).expect("decode");
    assert_eq!(decoded, signed);
}

#[test]
fn signing_payload_changes_with_every_field() {
    let event = sample_event("ev-1", 12.5);
    let base = event_signing_payload(&event, "nonce-a", 1000).expect("payload");

    let mut mutated = event.clone();
    mutated.duration_ms = 12.6;
    assert_ne!(
        event_signing_payload(&mutated, "nonce-a", 1000).expect("payload"),
        base
    );
    assert_ne!(
        event_signing_payload(&event, "nonce-b", 1000).expect("payload"),
        base
    );
    assert_ne!(
        event_signing_payload(&event, "nonce-a", 1001).expect("payload"),
        base
    );
}

#[test]
fn decision_constructors_set_verdict() {
    let allow = Decision::allow("ev-1", "normal behavior", 12.0, 1000);
    assert!(allow.is_allow());
    assert_eq!(allow.verdict.as_str(), "allow");

    let block = Decision::block("ev-1", "anomaly detected", 97.0, 1000);
    assert!(block.is_block());
    assert_eq!(block.verdict.as_str(), "block");
}

#[test]
fn verdict_serializes_snake_case() {
    let json = serde_json::to_string(&Verdict::Block).expect("encode");
    assert_eq!(json, "\"block\"");
}

#[test]
fn baseline_sufficiency_threshold() {
    let profile = BaselineProfile {
        subject: SubjectKey::new("pay", "transfer"),
        version: 1,
        created_ts_ms: 0,
        updated_ts_ms: 0,
        sample_count: 19,
        mean_duration_ms: 10.0,
        std_duration_ms: 2.0,
        p50_duration_ms: 10.0,
        p95_duration_ms: 14.0,
        p99_duration_ms: 16.0,
        historical_distances: Vec::new(),
    };
    assert!(!profile.is_sufficient(20));

    let mut enough = profile.clone();
    enough.sample_count = 20;
    assert!(enough.is_sufficient(20));
}

#[test]
fn detector_record_expiry() {
    let record = DetectorRecord {
        id: "det-1".to_string(),
        subject: SubjectKey::new("pay", "transfer"),
        score: 96.0,
        reason: "anomaly detected".to_string(),
        created_ts_ms: 1_000,
        expires_ts_ms: 2_000,
    };
    assert!(!record.is_expired(1_999));
    assert!(record.is_expired(2_000));
}
