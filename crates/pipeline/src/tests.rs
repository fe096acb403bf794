use super::*;

fn test_config() -> PipelineConfig {
    PipelineConfig {
        sampling_rate: 1.0,
        min_samples: 5,
        decision_deadline_ms: 500,
        maintenance_interval_ms: 50,
        worker_count: 2,
        ..PipelineConfig::default()
    }
}

#[test]
fn end_to_end_allow_path() {
    // min_samples above the call count keeps wall-clock jitter out of
    // the verdicts: every call trains, none is scored.
    let pipeline = Pipeline::start(PipelineConfig {
        min_samples: 100,
        ..test_config()
    })
    .expect("start");
    let agent = pipeline.agent();

    for i in 0..10u64 {
        let value = agent
            .observe("billing", "charge", move || i * 2)
            .expect("allowed");
        assert_eq!(value, i * 2);
    }

    let stats = pipeline.stats();
    assert_eq!(stats.agent.observed_calls, 10);
    assert_eq!(stats.engine.events_processed, 10);
    assert!(stats.audit_records >= 10);

    let report = pipeline.verify_audit_chain().expect("verify");
    assert!(report.is_valid());

    pipeline.shutdown().expect("shutdown");
}

#[test]
fn zero_threshold_blocks_every_scored_call() {
    let pipeline = Pipeline::start(PipelineConfig {
        candidate_threshold: 0.0,
        min_samples: 3,
        pattern_cache_enabled: false,
        ..test_config()
    })
    .expect("start");
    let agent = pipeline.agent();

    // Training phase: the first min_samples calls pass.
    for _ in 0..3 {
        agent
            .observe("billing", "charge", || "ok")
            .expect("training allows");
    }

    // Once trained, a zero threshold turns every score into a block
    // and the default stand-in is substituted.
    let mut blocked = 0;
    for _ in 0..5 {
        if agent.observe_or_default("billing", "charge", || 7u64) == 0 {
            blocked += 1;
        }
    }
    assert_eq!(blocked, 5);
    assert_eq!(pipeline.stats().agent.blocked_calls, 5);

    pipeline.shutdown().expect("shutdown");
}

#[test]
fn file_backed_pipeline_persists_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pipeline = Pipeline::start(PipelineConfig {
        key_dir: Some(dir.path().join("keys")),
        audit_log_path: Some(dir.path().join("audit.log")),
        state_db_path: Some(dir.path().join("state.db")),
        min_samples: 100,
        ..test_config()
    })
    .expect("start");
    let agent = pipeline.agent();

    for _ in 0..5 {
        agent.observe("billing", "charge", || 1u64).expect("allowed");
    }

    let report = pipeline.verify_audit_chain().expect("verify");
    assert!(report.is_valid());
    assert!(report.records >= 5);

    pipeline.shutdown().expect("shutdown");

    assert!(dir.path().join("keys/primary.key").exists());
    assert!(dir.path().join("keys/backup.key").exists());
    assert!(dir.path().join("audit.log").exists());
    assert!(dir.path().join("state.db").exists());
}

#[test]
fn calls_degrade_to_fail_mode_after_shutdown() {
    let pipeline = Pipeline::start(test_config()).expect("start");
    let agent = pipeline.agent();

    agent.observe("billing", "charge", || 1u64).expect("allowed");
    pipeline.shutdown().expect("shutdown");

    // The engine no longer admits events; fail-open keeps the
    // application running in observe-only degradation.
    let value = agent
        .observe("billing", "charge", || 2u64)
        .expect("fail-open allows");
    assert_eq!(value, 2);
    assert!(agent.stats().degraded_decisions >= 1);
}

#[test]
fn hot_reload_switches_fail_mode_and_sampling() {
    let pipeline = Pipeline::start(test_config()).expect("start");

    pipeline
        .apply_hot_reload(&PipelineConfig {
            fail_mode: connector::FailMode::Closed,
            sampling_rate: 0.5,
            ..test_config()
        })
        .expect("reload");

    assert_eq!(
        pipeline.connector().fail_mode(),
        connector::FailMode::Closed
    );
    assert!((pipeline.agent().current_sampling_rate() - 0.5).abs() < 1e-9);

    // Invalid values are rejected without touching the live config.
    assert!(pipeline
        .apply_hot_reload(&PipelineConfig {
            sampling_rate: 5.0,
            ..test_config()
        })
        .is_err());

    pipeline.shutdown().expect("shutdown");
}

#[test]
fn config_rejects_out_of_range_values() {
    let bad_rate = PipelineConfig {
        sampling_rate: 0.0,
        ..PipelineConfig::default()
    };
    assert!(bad_rate.validate().is_err());

    let bad_threshold = PipelineConfig {
        candidate_threshold: 150.0,
        ..PipelineConfig::default()
    };
    assert!(bad_threshold.validate().is_err());

    let no_workers = PipelineConfig {
        worker_count: 0,
        ..PipelineConfig::default()
    };
    assert!(no_workers.validate().is_err());
}

#[test]
fn config_rejects_unknown_file_keys_and_bad_fail_mode() {
    let dir = tempfile::tempdir().expect("tempdir");

    let unknown = dir.path().join("unknown.toml");
    std::fs::write(&unknown, "sampling_rate = 0.5\nmystery_knob = 3\n").expect("write");
    assert!(PipelineConfig::load_from_file(&unknown).is_err());

    let bad_mode = dir.path().join("bad_mode.toml");
    std::fs::write(&bad_mode, "fail_mode = \"sometimes\"\n").expect("write");
    assert!(PipelineConfig::load_from_file(&bad_mode).is_err());
}

#[test]
fn config_file_overrides_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "sampling_rate = 0.5\nqueue_capacity = 123\nfail_mode = \"closed\"\n",
    )
    .expect("write");

    let cfg = PipelineConfig::load_from_file(&path).expect("load");
    assert!((cfg.sampling_rate - 0.5).abs() < 1e-9);
    assert_eq!(cfg.queue_capacity, 123);
    assert_eq!(cfg.fail_mode, connector::FailMode::Closed);
    // Untouched fields keep their defaults.
    assert_eq!(cfg.min_samples, 20);
}

#[test]
fn config_env_overrides_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "sampling_rate = 0.5\n").expect("write");

    std::env::set_var("CELLGUARD_SAMPLING_RATE", "0.9");
    let cfg = PipelineConfig::load_from_file(&path);
    std::env::remove_var("CELLGUARD_SAMPLING_RATE");

    let cfg = cfg.expect("load");
    assert!((cfg.sampling_rate - 0.9).abs() < 1e-9);
}
