use super::*;

fn entry(action: &str, ts: u64) -> AuditEntry {
    AuditEntry {
        ts_unix_ms: ts,
        kind: AuditKind::Decision,
        actor: "engine".to_string(),
        action: action.to_string(),
        subject: Some("pay.transfer".to_string()),
        result: "success".to_string(),
        score: Some(12.0),
    }
}

fn open_log(dir: &tempfile::TempDir, key: &SigningKey) -> AuditLog {
    AuditLog::open(dir.path().join("audit.log"), key.clone()).expect("open log")
}

#[test]
fn chain_verifies_after_appends() {
    let key = SigningKey::generate();
    let dir = tempfile::tempdir().expect("tempdir");
    let log = open_log(&dir, &key);

    for i in 0..5 {
        log.append(entry("allow", 1_000 + i)).expect("append");
    }

    let report = log.verify_chain().expect("verify");
    assert!(report.is_valid());
    assert_eq!(report.records, 5);
}

#[test]
fn tampered_record_breaks_chain_from_that_seq() {
    let key = SigningKey::generate();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("audit.log");
    let log = AuditLog::open(&path, key.clone()).expect("open log");

    for i in 0..4 {
        log.append(entry("allow", 1_000 + i)).expect("append");
    }

    // Flip the action of record seq=2 on disk.
    let contents = std::fs::read_to_string(&path).expect("read");
    let rewritten: Vec<String> = contents
        .lines()
        .map(|line| {
            if line.contains("\"seq\":2") {
                line.replace("\"allow\"", "\"block\"")
            } else {
                line.to_string()
            }
        })
        .collect();
    std::fs::write(&path, rewritten.join("\n") + "\n").expect("write");

    let report = log.verify_chain().expect("verify");
    assert!(!report.is_valid());
    assert_eq!(report.first_break.expect("break").seq, 2);
}

#[test]
fn removed_record_breaks_chain() {
    let key = SigningKey::generate();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("audit.log");
    let log = AuditLog::open(&path, key.clone()).expect("open log");

    for i in 0..4 {
        log.append(entry("allow", 1_000 + i)).expect("append");
    }

    let contents = std::fs::read_to_string(&path).expect("read");
    let kept: Vec<&str> = contents
        .lines()
        .filter(|line| !line.contains("\"seq\":1"))
        .collect();
    std::fs::write(&path, kept.join("\n") + "\n").expect("write");

    let report = log.verify_chain().expect("verify");
    assert!(!report.is_valid());
    assert_eq!(report.first_break.expect("break").seq, 2);
}

#[test]
fn truncated_tail_is_detected() {
    let key = SigningKey::generate();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("audit.log");
    let log = AuditLog::open(&path, key.clone()).expect("open log");

    for i in 0..3 {
        log.append(entry("allow", 1_000 + i)).expect("append");
    }

    let contents = std::fs::read_to_string(&path).expect("read");
    let kept: Vec<&str> = contents.lines().take(2).collect();
    std::fs::write(&path, kept.join("\n") + "\n").expect("write");

    let report = log.verify_chain().expect("verify");
    assert!(!report.is_valid());
}

#[test]
fn reopened_log_continues_the_chain() {
    let key = SigningKey::generate();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("audit.log");

    {
        let log = AuditLog::open(&path, key.clone()).expect("open log");
        log.append(entry("allow", 1_000)).expect("append");
    }

    let log = AuditLog::open(&path, key.clone()).expect("reopen log");
    let record = log.append(entry("block", 2_000)).expect("append");
    assert_eq!(record.seq, 1);

    let report = log.verify_chain().expect("verify");
    assert!(report.is_valid());
    assert_eq!(report.records, 2);
}

#[test]
fn export_range_verifies_independently() {
    let key = SigningKey::generate();
    let dir = tempfile::tempdir().expect("tempdir");
    let log = open_log(&dir, &key);

    for i in 0..6 {
        log.append(entry("allow", 1_000 + i)).expect("append");
    }

    let export = log.export_range(2, 5).expect("export");
    assert_eq!(export.records.len(), 3);
    assert_eq!(export.records[0].seq, 2);

    let report = verify_export(&export, &key);
    assert!(report.is_valid());

    // A verifier with the wrong predecessor signature must reject.
    let mut bad = export;
    bad.prior_signature = "0000".to_string();
    assert!(!verify_export(&bad, &key).is_valid());
}

#[test]
fn memory_sink_chains_like_the_file_log() {
    let key = SigningKey::generate();
    let sink = MemoryAuditSink::new(key);

    for i in 0..3 {
        sink.append(entry("allow", 1_000 + i)).expect("append");
    }

    assert!(sink.verify_chain().is_valid());
    let records = sink.records();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].prev_sig, records[0].signature);
}
