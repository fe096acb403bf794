use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;

use telemetry::{BaselineProfile, DetectorRecord, SubjectKey};

mod sqlite;

pub use sqlite::SqliteStore;

/// Abstract keyed store the pipeline persists through. The engine does
/// not care what backs it; anything with these five operations works.
pub trait StateStore: Send + Sync {
    fn store_baseline(&self, profile: &BaselineProfile) -> Result<()>;
    fn get_baseline(&self, subject: &SubjectKey) -> Result<Option<BaselineProfile>>;
    fn store_record(&self, record: &DetectorRecord) -> Result<()>;
    fn get_active_records(&self, subject: &SubjectKey) -> Result<Vec<DetectorRecord>>;
    /// Drop detector records whose expiry has passed; returns how many.
    fn expire_old(&self, now_ms: u64) -> Result<usize>;
}

#[derive(Default)]
struct MemoryInner {
    baselines: HashMap<String, BaselineProfile>,
    records: Vec<DetectorRecord>,
}

/// HashMap-backed store for tests and fully-embedded deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn store_baseline(&self, profile: &BaselineProfile) -> Result<()> {
        let mut inner = lock(&self.inner)?;
        inner
            .baselines
            .insert(profile.subject.to_string(), profile.clone());
        Ok(())
    }

    fn get_baseline(&self, subject: &SubjectKey) -> Result<Option<BaselineProfile>> {
        let inner = lock(&self.inner)?;
        Ok(inner.baselines.get(&subject.to_string()).cloned())
    }

    fn store_record(&self, record: &DetectorRecord) -> Result<()> {
        let mut inner = lock(&self.inner)?;
        inner.records.retain(|r| r.id != record.id);
        inner.records.push(record.clone());
        Ok(())
    }

    fn get_active_records(&self, subject: &SubjectKey) -> Result<Vec<DetectorRecord>> {
        let inner = lock(&self.inner)?;
        Ok(inner
            .records
            .iter()
            .filter(|r| &r.subject == subject)
            .cloned()
            .collect())
    }

    fn expire_old(&self, now_ms: u64) -> Result<usize> {
        let mut inner = lock(&self.inner)?;
        let before = inner.records.len();
        inner.records.retain(|r| !r.is_expired(now_ms));
        Ok(before - inner.records.len())
    }
}

fn lock(inner: &Mutex<MemoryInner>) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
    inner
        .lock()
        .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
}
