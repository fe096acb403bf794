use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use telemetry::{BaselineProfile, DetectorRecord, SubjectKey};

use crate::StateStore;

/// Sqlite-backed store: one row per baseline, one row per detector
/// record, JSON payload columns.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed creating sqlite parent dir {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed opening state store {}", path.display()))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            CREATE TABLE IF NOT EXISTS baselines (
                subject TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                updated_ts_ms INTEGER NOT NULL,
                profile_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS detector_records (
                id TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                expires_ts_ms INTEGER NOT NULL,
                record_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_detector_records_subject
                ON detector_records(subject);
            ",
        )
        .context("failed initializing state store schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("state store lock poisoned"))?;
        f(&conn)
    }
}

impl StateStore for SqliteStore {
    fn store_baseline(&self, profile: &BaselineProfile) -> Result<()> {
        let json = serde_json::to_string(profile).context("failed encoding baseline")?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO baselines(subject, version, updated_ts_ms, profile_json)
                 VALUES(?1, ?2, ?3, ?4)
                 ON CONFLICT(subject) DO UPDATE SET
                     version = excluded.version,
                     updated_ts_ms = excluded.updated_ts_ms,
                     profile_json = excluded.profile_json",
                params![
                    profile.subject.to_string(),
                    profile.version,
                    profile.updated_ts_ms as i64,
                    json
                ],
            )?;
            Ok(())
        })
    }

    fn get_baseline(&self, subject: &SubjectKey) -> Result<Option<BaselineProfile>> {
        self.with_conn(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT profile_json FROM baselines WHERE subject = ?1",
                    params![subject.to_string()],
                    |row| row.get(0),
                )
                .optional()?;

            match json {
                Some(json) => Ok(Some(
                    serde_json::from_str(&json).context("failed decoding baseline")?,
                )),
                None => Ok(None),
            }
        })
    }

    fn store_record(&self, record: &DetectorRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("failed encoding detector record")?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO detector_records(id, subject, expires_ts_ms, record_json)
                 VALUES(?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     subject = excluded.subject,
                     expires_ts_ms = excluded.expires_ts_ms,
                     record_json = excluded.record_json",
                params![
                    record.id,
                    record.subject.to_string(),
                    record.expires_ts_ms as i64,
                    json
                ],
            )?;
            Ok(())
        })
    }

    fn get_active_records(&self, subject: &SubjectKey) -> Result<Vec<DetectorRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT record_json FROM detector_records
                 WHERE subject = ?1 ORDER BY expires_ts_ms ASC",
            )?;
            let rows = stmt.query_map(params![subject.to_string()], |row| {
                row.get::<_, String>(0)
            })?;

            let mut out = Vec::new();
            for row in rows {
                let json = row?;
                out.push(serde_json::from_str(&json).context("failed decoding detector record")?);
            }
            Ok(out)
        })
    }

    fn expire_old(&self, now_ms: u64) -> Result<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM detector_records WHERE expires_ts_ms <= ?1",
                params![now_ms as i64],
            )?;
            Ok(deleted)
        })
    }
}
