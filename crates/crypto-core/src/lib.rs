use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug)]
pub enum CryptoError {
    Io(std::io::Error),
    InvalidKey(String),
    Time(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {}", err),
            Self::InvalidKey(msg) => write!(f, "invalid key: {}", msg),
            Self::Time(msg) => write!(f, "time error: {}", msg),
        }
    }
}

impl std::error::Error for CryptoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CryptoError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

/// A 256-bit HMAC-SHA256 signing key.
#[derive(Clone)]
pub struct SigningKey {
    key: [u8; KEY_LEN],
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl SigningKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    pub fn load(path: &Path) -> CryptoResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Load the key at `path`, or generate and persist a fresh one
    /// with owner-only permissions.
    pub fn load_or_generate(path: &Path) -> CryptoResult<Self> {
        if path.exists() {
            return Self::load(path);
        }

        let key = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, key.key)?;
        restrict_permissions(path)?;
        debug!(path = %path.display(), "generated new signing key");
        Ok(key)
    }

    pub fn sign(&self, data: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac-sha256 accepts any key length");
        mac.update(data);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time signature check. Malformed hex is a plain mismatch.
    pub fn verify(&self, data: &[u8], signature: &str) -> bool {
        let Ok(sig_bytes) = hex::decode(signature) else {
            return false;
        };
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac-sha256 accepts any key length");
        mac.update(data);
        mac.verify_slice(&sig_bytes).is_ok()
    }

    pub fn fingerprint(&self) -> String {
        sha256_hex(&self.key)
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn sha256_hex_str(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// Single-use token for replay protection: 128 random bits, hex-encoded.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Primary/backup key pair with scheduled rotation.
///
/// Rotation demotes the primary key to backup and generates a fresh
/// primary, so signatures made shortly before a rotation still verify
/// through `verify_with_any_key`.
pub struct KeyManager {
    key_dir: Option<PathBuf>,
    primary: SigningKey,
    backup: SigningKey,
    rotation_interval_secs: u64,
    rotations: u64,
    last_rotation_unix: Option<u64>,
}

impl KeyManager {
    pub fn open(key_dir: impl Into<PathBuf>, rotation_interval_secs: u64) -> CryptoResult<Self> {
        let key_dir = key_dir.into();
        std::fs::create_dir_all(&key_dir)?;

        let primary = SigningKey::load_or_generate(&key_dir.join("primary.key"))?;
        let backup = SigningKey::load_or_generate(&key_dir.join("backup.key"))?;
        let last_rotation_unix = read_last_rotation(&key_dir.join("rotation.log"));

        Ok(Self {
            key_dir: Some(key_dir),
            primary,
            backup,
            rotation_interval_secs,
            rotations: 0,
            last_rotation_unix,
        })
    }

    /// Fresh random keys, nothing persisted. For tests and embedded
    /// observe-only deployments.
    pub fn ephemeral(rotation_interval_secs: u64) -> Self {
        Self {
            key_dir: None,
            primary: SigningKey::generate(),
            backup: SigningKey::generate(),
            rotation_interval_secs,
            rotations: 0,
            last_rotation_unix: None,
        }
    }

    pub fn sign_with_primary(&self, data: &[u8]) -> String {
        self.primary.sign(data)
    }

    /// Verify against the primary key first, then the backup key, so
    /// in-flight signatures survive a rotation.
    pub fn verify_with_any_key(&self, data: &[u8], signature: &str) -> bool {
        if self.primary.verify(data, signature) {
            return true;
        }
        if self.backup.verify(data, signature) {
            debug!("signature verified with backup key");
            return true;
        }
        false
    }

    pub fn primary(&self) -> &SigningKey {
        &self.primary
    }

    pub fn should_rotate(&self, now_unix: u64) -> bool {
        match self.last_rotation_unix {
            Some(last) => now_unix.saturating_sub(last) >= self.rotation_interval_secs,
            None => false,
        }
    }

    /// Demote the primary key to backup and generate a fresh primary.
    pub fn rotate(&mut self) -> CryptoResult<()> {
        self.backup = self.primary.clone();
        self.primary = SigningKey::generate();

        if let Some(dir) = &self.key_dir {
            let backup_path = dir.join("backup.key");
            std::fs::write(&backup_path, self.backup.key)?;
            restrict_permissions(&backup_path)?;

            let primary_path = dir.join("primary.key");
            std::fs::write(&primary_path, self.primary.key)?;
            restrict_permissions(&primary_path)?;
        }

        self.rotations = self.rotations.saturating_add(1);
        let now = now_unix()?;
        self.last_rotation_unix = Some(now);
        self.append_rotation_log(now)?;

        info!(
            rotation = self.rotations,
            primary_fingerprint = %self.primary.fingerprint(),
            "key rotation complete"
        );
        Ok(())
    }

    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    fn append_rotation_log(&self, now: u64) -> CryptoResult<()> {
        use std::io::Write;

        let Some(dir) = &self.key_dir else {
            return Ok(());
        };
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("rotation.log"))?;
        writeln!(file, "{} rotation", now)?;
        Ok(())
    }
}

/// Cloneable shared handle to the key manager; every component signs
/// and verifies through one of these so a rotation is visible
/// everywhere immediately.
#[derive(Clone)]
pub struct KeyHandle {
    inner: Arc<RwLock<KeyManager>>,
}

impl KeyHandle {
    pub fn new(manager: KeyManager) -> Self {
        Self {
            inner: Arc::new(RwLock::new(manager)),
        }
    }

    pub fn ephemeral() -> Self {
        Self::new(KeyManager::ephemeral(u64::MAX))
    }

    pub fn sign(&self, data: &[u8]) -> String {
        self.read().sign_with_primary(data)
    }

    pub fn verify(&self, data: &[u8], signature: &str) -> bool {
        self.read().verify_with_any_key(data, signature)
    }

    pub fn should_rotate(&self, now_unix: u64) -> bool {
        self.read().should_rotate(now_unix)
    }

    pub fn rotate(&self) -> CryptoResult<()> {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.rotate()
    }

    pub fn fingerprint(&self) -> String {
        self.read().primary().fingerprint()
    }

    /// Snapshot of the current primary key, for components that need a
    /// stable key of their own (e.g. the audit chain).
    pub fn primary_key(&self) -> SigningKey {
        self.read().primary().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, KeyManager> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn read_last_rotation(path: &Path) -> Option<u64> {
    let contents = std::fs::read_to_string(path).ok()?;
    let last = contents.lines().rev().find(|l| !l.trim().is_empty())?;
    last.split_whitespace().next()?.parse::<u64>().ok()
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

fn now_unix() -> CryptoResult<u64> {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| CryptoError::Time(err.to_string()))?;
    Ok(dur.as_secs())
}
