use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use audit_log::{AuditEntry, AuditKind, AuditSink};
use crypto_core::KeyHandle;
use engine::Engine;
use instrument::Agent;
use telemetry::now_unix_ms;

use crate::config::PipelineConfig;
use crate::shutdown::ShutdownToken;

/// Spawn the periodic maintenance tasks, each on its own thread,
/// all parked on the shared shutdown token:
/// window tick (backpressure + sampling feedback), nonce sweep, and
/// retrain (baselines, pattern eviction, record expiry, key rotation).
pub fn spawn_all(
    config: &PipelineConfig,
    engine: &Arc<Engine>,
    agent: &Arc<Agent>,
    keys: &KeyHandle,
    audit: Arc<dyn AuditSink>,
    shutdown: &Arc<ShutdownToken>,
) -> Result<Vec<JoinHandle<()>>> {
    let mut tasks = Vec::new();

    tasks.push(spawn_periodic(
        "cellguard-window-tick",
        Duration::from_millis(config.maintenance_interval_ms.max(10)),
        shutdown.clone(),
        {
            let engine = engine.clone();
            let agent = agent.clone();
            move || {
                let signal = engine.backpressure_signal();
                agent.apply_backpressure(signal);
            }
        },
    )?);

    tasks.push(spawn_periodic(
        "cellguard-nonce-sweep",
        Duration::from_secs(config.nonce_ttl_secs.clamp(1, 60)),
        shutdown.clone(),
        {
            let engine = engine.clone();
            move || {
                let removed = engine.sweep_nonces(now_unix_ms());
                if removed > 0 {
                    debug!(removed, "nonce sweep");
                }
            }
        },
    )?);

    tasks.push(spawn_periodic(
        "cellguard-retrain",
        Duration::from_secs(config.retrain_interval_secs.max(1)),
        shutdown.clone(),
        {
            let engine = engine.clone();
            let keys = keys.clone();
            move || {
                let now = now_unix_ms();
                let retrained = engine.retrain(now);
                let evicted = engine.evict_patterns(now);
                let expired = engine.expire_detector_records(now);
                debug!(retrained, evicted, expired, "retrain pass");

                if keys.should_rotate(now / 1_000) {
                    match keys.rotate() {
                        Ok(()) => {
                            let entry = AuditEntry {
                                ts_unix_ms: now,
                                kind: AuditKind::Maintenance,
                                actor: "key_manager".to_string(),
                                action: "rotate".to_string(),
                                subject: None,
                                result: keys.fingerprint(),
                                score: None,
                            };
                            if let Err(err) = audit.append(entry) {
                                warn!(error = %err, "audit append failed");
                            }
                        }
                        Err(err) => warn!(error = %err, "key rotation failed"),
                    }
                }
            }
        },
    )?);

    Ok(tasks)
}

fn spawn_periodic(
    name: &'static str,
    interval: Duration,
    shutdown: Arc<ShutdownToken>,
    mut task: impl FnMut() + Send + 'static,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            while !shutdown.wait_timeout(interval) {
                task();
            }
        })
        .with_context(|| format!("failed spawning {}", name))
}
