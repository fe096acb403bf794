use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::warn;

use crypto_core::KeyHandle;
use telemetry::SignedEvent;

use crate::nonce_cache::NonceCache;

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Expired { age_ms: u64 },
    FutureTimestamp { skew_ms: u64 },
    Replay,
    BadSignature,
    Malformed(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired { age_ms } => write!(f, "event expired (age {}ms)", age_ms),
            Self::FutureTimestamp { skew_ms } => {
                write!(f, "event timestamp {}ms in the future", skew_ms)
            }
            Self::Replay => write!(f, "replay"),
            Self::BadSignature => write!(f, "invalid signature"),
            Self::Malformed(msg) => write!(f, "malformed event: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidatorStats {
    pub total_validations: u64,
    pub valid_events: u64,
    pub invalid_signatures: u64,
    pub replays: u64,
    pub expired_events: u64,
    pub nonce_cache_size: usize,
}

/// Admission control for inbound signed events: freshness window,
/// replay check, constant-time signature verification. The nonce is
/// recorded only after the signature verifies, so forged events cannot
/// poison the replay cache.
pub struct SecurityValidator {
    keys: KeyHandle,
    nonces: NonceCache,
    freshness_window_ms: u64,
    clock_skew_ms: u64,
    total: AtomicU64,
    valid: AtomicU64,
    bad_signature: AtomicU64,
    replays: AtomicU64,
    expired: AtomicU64,
}

impl SecurityValidator {
    pub fn new(
        keys: KeyHandle,
        nonce_capacity: usize,
        nonce_ttl_ms: u64,
        freshness_window_ms: u64,
        clock_skew_ms: u64,
    ) -> Self {
        Self {
            keys,
            nonces: NonceCache::new(nonce_capacity, nonce_ttl_ms),
            freshness_window_ms,
            clock_skew_ms,
            total: AtomicU64::new(0),
            valid: AtomicU64::new(0),
            bad_signature: AtomicU64::new(0),
            replays: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn verify(&self, signed: &SignedEvent, now_ms: u64) -> Result<(), ValidationError> {
        self.total.fetch_add(1, Ordering::Relaxed);

        let age_ms = now_ms.saturating_sub(signed.ts_unix_ms);
        if age_ms > self.freshness_window_ms {
            self.expired.fetch_add(1, Ordering::Relaxed);
            return Err(ValidationError::Expired { age_ms });
        }
        let skew_ms = signed.ts_unix_ms.saturating_sub(now_ms);
        if skew_ms > self.clock_skew_ms {
            self.expired.fetch_add(1, Ordering::Relaxed);
            return Err(ValidationError::FutureTimestamp { skew_ms });
        }

        if self.nonces.is_replay(&signed.nonce, now_ms) {
            self.replays.fetch_add(1, Ordering::Relaxed);
            warn!(nonce = %signed.nonce, "replay detected");
            return Err(ValidationError::Replay);
        }

        let payload = signed
            .signing_payload()
            .map_err(|err| ValidationError::Malformed(err.to_string()))?;
        if !self.keys.verify(&payload, &signed.signature) {
            self.bad_signature.fetch_add(1, Ordering::Relaxed);
            warn!(event_id = %signed.event.event_id, "invalid event signature");
            return Err(ValidationError::BadSignature);
        }

        self.nonces.record(&signed.nonce, now_ms);
        self.valid.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn sweep_nonces(&self, now_ms: u64) -> usize {
        self.nonces.sweep(now_ms)
    }

    pub fn stats(&self) -> ValidatorStats {
        ValidatorStats {
            total_validations: self.total.load(Ordering::Relaxed),
            valid_events: self.valid.load(Ordering::Relaxed),
            invalid_signatures: self.bad_signature.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            expired_events: self.expired.load(Ordering::Relaxed),
            nonce_cache_size: self.nonces.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry::{
        event_signing_payload, ArgMetadata, ResourceTags, SubjectKey, TelemetryEvent,
    };

    fn signed_event(keys: &KeyHandle, nonce: &str, ts_ms: u64) -> SignedEvent {
        let event = TelemetryEvent {
            event_id: "ev-1".to_string(),
            subject: SubjectKey::new("pay", "transfer"),
            ts_unix_ms: ts_ms,
            duration_ms: 5.0,
            args: ArgMetadata::default(),
            resource_tags: ResourceTags::default(),
            redaction_applied: true,
            sampling_rate: 1.0,
        };
        let payload = event_signing_payload(&event, nonce, ts_ms).expect("payload");
        let signature = keys.sign(&payload);
        SignedEvent {
            event,
            nonce: nonce.to_string(),
            ts_unix_ms: ts_ms,
            signature,
        }
    }

    fn validator(keys: &KeyHandle) -> SecurityValidator {
        SecurityValidator::new(keys.clone(), 1_000, 300_000, 300_000, 5_000)
    }

    #[test]
    fn valid_event_is_admitted_once() {
        let keys = KeyHandle::ephemeral();
        let v = validator(&keys);
        let signed = signed_event(&keys, "n1", 10_000);

        assert_eq!(v.verify(&signed, 10_500), Ok(()));
        // Identical resend: replay.
        assert_eq!(v.verify(&signed, 11_000), Err(ValidationError::Replay));
        assert_eq!(v.stats().replays, 1);
    }

    #[test]
    fn mutated_payload_fails_verification() {
        let keys = KeyHandle::ephemeral();
        let v = validator(&keys);
        let mut signed = signed_event(&keys, "n1", 10_000);
        signed.event.duration_ms = 500.0;

        assert_eq!(
            v.verify(&signed, 10_500),
            Err(ValidationError::BadSignature)
        );
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let keys = KeyHandle::ephemeral();
        let v = validator(&keys);
        let signed = signed_event(&keys, "n1", 10_000);

        let result = v.verify(&signed, 10_000 + 300_001);
        assert!(matches!(result, Err(ValidationError::Expired { .. })));
    }

    #[test]
    fn far_future_timestamp_is_rejected() {
        let keys = KeyHandle::ephemeral();
        let v = validator(&keys);
        let signed = signed_event(&keys, "n1", 100_000);

        let result = v.verify(&signed, 10_000);
        assert!(matches!(result, Err(ValidationError::FutureTimestamp { .. })));
    }

    #[test]
    fn forged_event_does_not_burn_its_nonce() {
        let keys = KeyHandle::ephemeral();
        let v = validator(&keys);

        let mut forged = signed_event(&keys, "n1", 10_000);
        forged.signature = "00".repeat(32);
        assert_eq!(
            v.verify(&forged, 10_100),
            Err(ValidationError::BadSignature)
        );

        // The honest event with the same nonce still gets through.
        let honest = signed_event(&keys, "n1", 10_000);
        assert_eq!(v.verify(&honest, 10_200), Ok(()));
    }
}
