use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crypto_core::{sha256_hex_str, SigningKey};

const GENESIS_TAG: &str = "cellguard-audit-genesis";

#[derive(Debug)]
pub enum AuditError {
    Io(std::io::Error),
    Serialize(String),
    Corrupt(String),
    Poisoned,
}

impl fmt::Display for AuditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {}", err),
            Self::Serialize(msg) => write!(f, "serialize error: {}", msg),
            Self::Corrupt(msg) => write!(f, "corrupt log: {}", msg),
            Self::Poisoned => write!(f, "audit log lock poisoned"),
        }
    }
}

impl std::error::Error for AuditError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for AuditError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

pub type AuditResult<T> = std::result::Result<T, AuditError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Decision,
    SecurityViolation,
    Degraded,
    Enforcement,
    Maintenance,
}

/// Unsigned audit content supplied by the caller; the sink assigns the
/// sequence number, chain link, and signature.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub ts_unix_ms: u64,
    pub kind: AuditKind,
    pub actor: String,
    pub action: String,
    pub subject: Option<String>,
    pub result: String,
    pub score: Option<f64>,
}

/// One immutable chain link. The signature covers every other field,
/// including `prev_sig`, so altering or removing any earlier record
/// breaks verification from that point on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub ts_unix_ms: u64,
    pub kind: AuditKind,
    pub actor: String,
    pub action: String,
    pub subject: Option<String>,
    pub result: String,
    pub score: Option<f64>,
    pub prev_sig: String,
    pub signature: String,
}

impl AuditRecord {
    fn signable_bytes(&self) -> AuditResult<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        serde_json::to_vec(&unsigned).map_err(|err| AuditError::Serialize(err.to_string()))
    }
}

pub trait AuditSink: Send + Sync {
    fn append(&self, entry: AuditEntry) -> AuditResult<AuditRecord>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainBreak {
    pub seq: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainReport {
    pub records: u64,
    pub first_break: Option<ChainBreak>,
}

impl ChainReport {
    pub fn is_valid(&self) -> bool {
        self.first_break.is_none()
    }
}

/// Record range plus the predecessor signature an independent verifier
/// needs to re-walk the chain.
#[derive(Debug, Clone)]
pub struct ChainExport {
    pub records: Vec<AuditRecord>,
    pub prior_signature: String,
}

struct Tail {
    next_seq: u64,
    prev_sig: String,
    file: std::fs::File,
}

/// Append-only JSON-lines audit log with a per-record HMAC chain.
pub struct AuditLog {
    path: PathBuf,
    key: SigningKey,
    tail: Mutex<Tail>,
}

impl AuditLog {
    pub fn open(path: impl Into<PathBuf>, key: SigningKey) -> AuditResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Recover the chain tail from the existing file, if any.
        let mut next_seq = 0u64;
        let mut prev_sig = genesis_link();
        if path.exists() {
            for record in read_records(&path)? {
                next_seq = record.seq.saturating_add(1);
                prev_sig = record.signature;
            }
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        restrict_permissions(&path)?;

        Ok(Self {
            path,
            key,
            tail: Mutex::new(Tail {
                next_seq,
                prev_sig,
                file,
            }),
        })
    }

    /// Walk the whole log and confirm every signature and chain link.
    pub fn verify_chain(&self) -> AuditResult<ChainReport> {
        let (expected_records, _) = {
            let tail = self.tail.lock().map_err(|_| AuditError::Poisoned)?;
            (tail.next_seq, tail.prev_sig.clone())
        };

        let records = read_records(&self.path)?;
        let mut report = verify_records(&records, &genesis_link(), 0, &self.key);

        if report.is_valid() && report.records < expected_records {
            report.first_break = Some(ChainBreak {
                seq: report.records,
                reason: format!(
                    "log truncated: {} records on disk, {} appended",
                    report.records, expected_records
                ),
            });
        }
        Ok(report)
    }

    /// Records with `start_seq <= seq < end_seq`, plus the predecessor
    /// signature needed to verify the range independently.
    pub fn export_range(&self, start_seq: u64, end_seq: u64) -> AuditResult<ChainExport> {
        let mut prior_signature = genesis_link();
        let mut out = Vec::new();
        for record in read_records(&self.path)? {
            if record.seq < start_seq {
                prior_signature = record.signature.clone();
                continue;
            }
            if record.seq >= end_seq {
                break;
            }
            out.push(record);
        }
        Ok(ChainExport {
            records: out,
            prior_signature,
        })
    }

    pub fn read_range(&self, start_seq: u64, end_seq: u64) -> AuditResult<Vec<AuditRecord>> {
        Ok(self.export_range(start_seq, end_seq)?.records)
    }

    pub fn record_count(&self) -> u64 {
        match self.tail.lock() {
            Ok(tail) => tail.next_seq,
            Err(_) => 0,
        }
    }
}

impl AuditSink for AuditLog {
    fn append(&self, entry: AuditEntry) -> AuditResult<AuditRecord> {
        let mut tail = self.tail.lock().map_err(|_| AuditError::Poisoned)?;

        let mut record = AuditRecord {
            seq: tail.next_seq,
            ts_unix_ms: entry.ts_unix_ms,
            kind: entry.kind,
            actor: entry.actor,
            action: entry.action,
            subject: entry.subject,
            result: entry.result,
            score: entry.score,
            prev_sig: tail.prev_sig.clone(),
            signature: String::new(),
        };
        record.signature = self.key.sign(&record.signable_bytes()?);

        let line =
            serde_json::to_string(&record).map_err(|err| AuditError::Serialize(err.to_string()))?;
        writeln!(tail.file, "{}", line)?;
        tail.file.flush()?;

        tail.next_seq = tail.next_seq.saturating_add(1);
        tail.prev_sig = record.signature.clone();
        Ok(record)
    }
}

/// In-memory sink for tests and embedded observe-only use.
pub struct MemoryAuditSink {
    key: SigningKey,
    inner: Mutex<(Vec<AuditRecord>, String)>,
}

impl MemoryAuditSink {
    pub fn new(key: SigningKey) -> Self {
        Self {
            key,
            inner: Mutex::new((Vec::new(), genesis_link())),
        }
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        match self.inner.lock() {
            Ok(inner) => inner.0.clone(),
            Err(_) => Vec::new(),
        }
    }

    pub fn verify_chain(&self) -> ChainReport {
        match self.inner.lock() {
            Ok(inner) => verify_records(&inner.0, &genesis_link(), 0, &self.key),
            Err(_) => ChainReport {
                records: 0,
                first_break: Some(ChainBreak {
                    seq: 0,
                    reason: "lock poisoned".to_string(),
                }),
            },
        }
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, entry: AuditEntry) -> AuditResult<AuditRecord> {
        let mut inner = self.inner.lock().map_err(|_| AuditError::Poisoned)?;
        let (records, prev_sig) = &mut *inner;

        let mut record = AuditRecord {
            seq: records.len() as u64,
            ts_unix_ms: entry.ts_unix_ms,
            kind: entry.kind,
            actor: entry.actor,
            action: entry.action,
            subject: entry.subject,
            result: entry.result,
            score: entry.score,
            prev_sig: prev_sig.clone(),
            signature: String::new(),
        };
        record.signature = self.key.sign(&record.signable_bytes()?);

        *prev_sig = record.signature.clone();
        records.push(record.clone());
        Ok(record)
    }
}

/// Verify an exported range against the predecessor signature it was
/// exported with. Works without access to the log file.
pub fn verify_export(export: &ChainExport, key: &SigningKey) -> ChainReport {
    let start_seq = export.records.first().map(|r| r.seq).unwrap_or(0);
    verify_records(&export.records, &export.prior_signature, start_seq, key)
}

fn verify_records(
    records: &[AuditRecord],
    initial_prev: &str,
    initial_seq: u64,
    key: &SigningKey,
) -> ChainReport {
    let mut expected_prev = initial_prev.to_string();
    let mut expected_seq = initial_seq;

    for record in records {
        let break_reason = if record.seq != expected_seq {
            Some(format!(
                "sequence gap: expected {}, found {}",
                expected_seq, record.seq
            ))
        } else if record.prev_sig != expected_prev {
            Some("chain link does not match previous signature".to_string())
        } else {
            match record.signable_bytes() {
                Ok(bytes) if key.verify(&bytes, &record.signature) => None,
                Ok(_) => Some("signature verification failed".to_string()),
                Err(err) => Some(format!("unserializable record: {}", err)),
            }
        };

        if let Some(reason) = break_reason {
            warn!(seq = record.seq, reason = %reason, "audit chain break");
            return ChainReport {
                records: records.len() as u64,
                first_break: Some(ChainBreak {
                    seq: record.seq,
                    reason,
                }),
            };
        }

        expected_prev = record.signature.clone();
        expected_seq = expected_seq.saturating_add(1);
    }

    ChainReport {
        records: records.len() as u64,
        first_break: None,
    }
}

fn read_records(path: &Path) -> AuditResult<Vec<AuditRecord>> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: AuditRecord = serde_json::from_str(&line).map_err(|err| {
            AuditError::Corrupt(format!("line {}: {}", line_no.saturating_add(1), err))
        })?;
        out.push(record);
    }
    Ok(out)
}

fn genesis_link() -> String {
    sha256_hex_str(GENESIS_TAG)
}

fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests;
