use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use audit_log::{AuditLog, AuditSink, ChainReport, MemoryAuditSink};
use connector::{Connector, ConnectorStats, DecisionService, RetryPolicy};
use crypto_core::{KeyHandle, KeyManager};
use engine::{Engine, EngineOptions, EngineStats};
use instrument::{Agent, AgentOptions, AgentStats};
use state_store::{MemoryStore, SqliteStore, StateStore};

mod config;
mod maintenance;
mod shutdown;

pub use config::PipelineConfig;
pub use shutdown::ShutdownToken;

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub agent: AgentStats,
    pub engine: EngineStats,
    pub connector: ConnectorStats,
    pub audit_records: u64,
}

enum AuditBackend {
    File(Arc<AuditLog>),
    Memory(Arc<MemoryAuditSink>),
}

impl AuditBackend {
    fn sink(&self) -> Arc<dyn AuditSink> {
        match self {
            Self::File(log) => log.clone(),
            Self::Memory(sink) => sink.clone(),
        }
    }

    fn record_count(&self) -> u64 {
        match self {
            Self::File(log) => log.record_count(),
            Self::Memory(sink) => sink.records().len() as u64,
        }
    }
}

/// One constructed pipeline: every component built once, wired
/// explicitly, and handed out by reference. No global state.
pub struct Pipeline {
    config: PipelineConfig,
    keys: KeyHandle,
    engine: Arc<Engine>,
    connector: Arc<Connector>,
    agent: Arc<Agent>,
    audit: AuditBackend,
    #[allow(dead_code)]
    store: Arc<dyn StateStore>,
    shutdown: Arc<ShutdownToken>,
    workers: Vec<JoinHandle<()>>,
    maintenance: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Build every component from `config` and start the consumer
    /// workers and maintenance tasks.
    pub fn start(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let keys = match &config.key_dir {
            Some(dir) => KeyHandle::new(
                KeyManager::open(dir, config.key_rotation_interval_secs)
                    .map_err(|err| anyhow::anyhow!("key manager init failed: {}", err))?,
            ),
            None => KeyHandle::new(KeyManager::ephemeral(config.key_rotation_interval_secs)),
        };

        let audit = match &config.audit_log_path {
            Some(path) => AuditBackend::File(Arc::new(
                AuditLog::open(path, keys.primary_key())
                    .map_err(|err| anyhow::anyhow!("audit log init failed: {}", err))?,
            )),
            None => AuditBackend::Memory(Arc::new(MemoryAuditSink::new(keys.primary_key()))),
        };
        let audit_sink = audit.sink();

        let store: Arc<dyn StateStore> = match &config.state_db_path {
            Some(path) => Arc::new(SqliteStore::open(path).context("state store init failed")?),
            None => Arc::new(MemoryStore::new()),
        };

        let engine = Arc::new(Engine::new(
            keys.clone(),
            store.clone(),
            audit_sink.clone(),
            EngineOptions {
                min_samples: config.min_samples,
                candidate_threshold: config.candidate_threshold,
                freshness_window_ms: config.freshness_window_secs * 1_000,
                nonce_ttl_ms: config.nonce_ttl_secs * 1_000,
                queue_capacity: config.queue_capacity,
                backpressure_threshold: config.backpressure_threshold,
                decision_deadline: config.decision_deadline(),
                pattern_cache_enabled: config.pattern_cache_enabled,
                ..EngineOptions::default()
            },
        ));

        let connector = Arc::new(Connector::new(
            engine.clone() as Arc<dyn DecisionService>,
            keys.clone(),
            // Covers the engine deadline plus handoff overhead.
            config.decision_deadline() * 2,
            RetryPolicy {
                min_backoff: Duration::from_millis(config.retry_backoff_ms),
                max_backoff: Duration::from_millis(config.retry_backoff_ms.saturating_mul(8)),
                multiplier: 2,
                max_attempts: config.retry_max_attempts,
            },
            config.fail_mode,
        ));

        let agent = Arc::new(Agent::new(
            connector.clone(),
            keys.clone(),
            audit_sink,
            AgentOptions {
                sampling_rate: config.sampling_rate,
                global_rate_limit: config.global_rate_limit,
                per_key_rate_limit: config.per_key_rate_limit,
            },
        ));

        let shutdown = Arc::new(ShutdownToken::new());
        let workers = spawn_workers(&engine, config.worker_count)?;
        let maintenance =
            maintenance::spawn_all(&config, &engine, &agent, &keys, audit.sink(), &shutdown)?;

        info!(
            workers = config.worker_count,
            fail_mode = ?config.fail_mode,
            sampling_rate = config.sampling_rate,
            "pipeline started"
        );

        Ok(Self {
            config,
            keys,
            engine,
            connector,
            agent,
            audit,
            store,
            shutdown,
            workers,
            maintenance,
        })
    }

    /// The call-site handle monitored code uses.
    pub fn agent(&self) -> Arc<Agent> {
        self.agent.clone()
    }

    pub fn connector(&self) -> Arc<Connector> {
        self.connector.clone()
    }

    pub fn engine(&self) -> Arc<Engine> {
        self.engine.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeyHandle {
        &self.keys
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            agent: self.agent.stats(),
            engine: self.engine.stats(),
            connector: self.connector.stats(),
            audit_records: self.audit.record_count(),
        }
    }

    /// Apply the hot-reloadable subset of a new configuration: fail
    /// mode and sampling rate take effect immediately. Structural
    /// options (queue capacity, worker count, storage paths) need a
    /// restart.
    pub fn apply_hot_reload(&self, config: &PipelineConfig) -> Result<()> {
        config.validate()?;
        self.connector.set_fail_mode(config.fail_mode);
        self.agent.set_base_sampling_rate(config.sampling_rate);
        info!(
            fail_mode = ?config.fail_mode,
            sampling_rate = config.sampling_rate,
            "hot reload applied"
        );
        Ok(())
    }

    pub fn verify_audit_chain(&self) -> Result<ChainReport> {
        match &self.audit {
            AuditBackend::File(log) => log
                .verify_chain()
                .map_err(|err| anyhow::anyhow!("chain verification failed: {}", err)),
            AuditBackend::Memory(sink) => Ok(sink.verify_chain()),
        }
    }

    /// Stop intake, drain in-flight events, and join every thread.
    pub fn shutdown(mut self) -> Result<()> {
        self.shutdown.stop();
        self.engine.shutdown();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("scoring worker panicked before shutdown");
            }
        }
        for task in self.maintenance.drain(..) {
            if task.join().is_err() {
                warn!("maintenance task panicked before shutdown");
            }
        }
        info!("pipeline stopped");
        Ok(())
    }
}

fn spawn_workers(engine: &Arc<Engine>, count: usize) -> Result<Vec<JoinHandle<()>>> {
    let mut workers = Vec::with_capacity(count);
    for i in 0..count {
        let engine = engine.clone();
        let handle = std::thread::Builder::new()
            .name(format!("cellguard-worker-{}", i))
            .spawn(move || loop {
                if !engine.process_one(Duration::from_millis(50)) && engine.is_shutdown() {
                    break;
                }
            })
            .context("failed spawning scoring worker")?;
        workers.push(handle);
    }
    Ok(workers)
}

#[cfg(test)]
mod tests;
