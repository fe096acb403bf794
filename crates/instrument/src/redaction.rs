use std::sync::OnceLock;

use regex::Regex;

use telemetry::ArgMetadata;

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")
            .expect("static pattern compiles")
    })
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:\+?1[-.\s]?)?\(?[0-9]{3}\)?[-.\s]?[0-9]{3}[-.]?[0-9]{4}\b")
            .expect("static pattern compiles")
    })
}

fn card_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(?:4[0-9]{12}(?:[0-9]{3})?|5[1-5][0-9]{14}|3[47][0-9]{13}|6(?:011|5[0-9]{2})[0-9]{12})\b",
        )
        .expect("static pattern compiles")
    })
}

fn national_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b[0-9]{3}-[0-9]{2}-[0-9]{4}\b").expect("static pattern compiles")
    })
}

fn ipv4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b").expect("static pattern compiles")
    })
}

/// Strips personally identifiable values out of telemetry text before
/// anything leaves the call site. Argument values are never shipped at
/// all; only type names and salted-free SHA-256 digests of the
/// redacted rendering.
#[derive(Debug, Default, Clone)]
pub struct PiiRedactor;

#[derive(Debug, Clone)]
pub struct ArgDigest {
    pub type_name: String,
    pub hash: String,
}

impl PiiRedactor {
    pub fn new() -> Self {
        Self
    }

    pub fn redact(&self, text: &str) -> String {
        let out = email_re().replace_all(text, "[EMAIL_REDACTED]");
        let out = card_re().replace_all(&out, "[CC_REDACTED]");
        let out = national_id_re().replace_all(&out, "[ID_REDACTED]");
        let out = phone_re().replace_all(&out, "[PHONE_REDACTED]");
        // IPv4: keep the /24 prefix, zero the host octet.
        ipv4_re()
            .replace_all(&out, |caps: &regex::Captures<'_>| {
                let ip = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
                match ip.rsplit_once('.') {
                    Some((prefix, _)) => format!("{}.0", prefix),
                    None => ip.to_string(),
                }
            })
            .into_owned()
    }

    /// Digest a single argument: redact its rendering, then hash it.
    pub fn digest_arg<T: std::fmt::Debug>(&self, value: &T) -> ArgDigest {
        let rendered = self.redact(&format!("{:?}", value));
        ArgDigest {
            type_name: short_type_name(std::any::type_name::<T>()),
            hash: crypto_core::sha256_hex_str(&rendered),
        }
    }

    pub fn arg_metadata(&self, digests: &[ArgDigest]) -> ArgMetadata {
        ArgMetadata {
            arg_count: digests.len(),
            arg_types: digests.iter().map(|d| d.type_name.clone()).collect(),
            arg_hashes: digests.iter().map(|d| d.hash.clone()).collect(),
        }
    }
}

fn short_type_name(full: &str) -> String {
    // "alloc::string::String" -> "String"; keep generics readable.
    match full.rsplit_once("::") {
        Some((_, last)) => last.to_string(),
        None => full.to_string(),
    }
}
