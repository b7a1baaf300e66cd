//! Canonical manifest encoding and HMAC sealing (spec §4.5, §8.3).
//!
//! `#[derive(Serialize)]` on a struct emits fields in declaration order, not
//! sorted order — only a `BTreeMap` field (like `files`) sorts on its own.
//! To get the same canonical form `evidence_sealing.py`'s `_canonical_json`
//! builds by hand with `sort_keys=True, separators=(",", ":")`,
//! [`canonical_json`] round-trips the value through `serde_json::Value`
//! first: `serde_json::Map` is itself a `BTreeMap` (this workspace never
//! enables the `preserve_order` feature), so every object at every nesting
//! level ends up with sorted keys, not just the top level. Hashing and
//! signing always run over this canonical encoding, never over whatever
//! bytes happen to be on disk.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Read;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::EvidenceError;

pub const EVIDENCE_VERSION: &str = "4.0";
pub const SEAL_VERSION: u32 = 1;

type HmacSha256 = Hmac<Sha256>;

/// The sealed manifest stored alongside the evidence it describes. `files`
/// maps a relative path (e.g. `auth/logs/compose.log`) to its SHA-256 hex
/// digest; `manifest.json` and `manifest.sig` are never members of this map
/// since a manifest cannot authenticate its own bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceManifest {
    pub lab_id: String,
    pub sealed_at: DateTime<Utc>,
    pub evidence_version: String,
    pub seal_version: u32,
    pub files: BTreeMap<String, String>,
}

impl EvidenceManifest {
    pub fn new(lab_id: String, files: BTreeMap<String, String>) -> Self {
        Self {
            lab_id,
            sealed_at: Utc::now(),
            evidence_version: EVIDENCE_VERSION.to_string(),
            seal_version: SEAL_VERSION,
            files,
        }
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>, EvidenceError> {
        canonical_json(self)
    }
}

/// Serializes `value` through `serde_json::Value` so every object key, at
/// every nesting level, ends up lexicographically sorted — not just the
/// top level or whichever fields happen to be `BTreeMap`s.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, EvidenceError> {
    let as_value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&as_value)?)
}

pub fn compute_file_hash(path: &Path) -> Result<String, EvidenceError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

pub fn compute_hmac(secret: &[u8], message: &[u8]) -> Result<String, EvidenceError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| EvidenceError::Internal(format!("hmac key: {e}")))?;
    mac.update(message);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Constant-time verification via `Mac::verify_slice` — never compares the
/// decoded signature with `==`.
pub fn verify_hmac(secret: &[u8], message: &[u8], signature_b64: &str) -> bool {
    let Ok(sig) = BASE64.decode(signature_b64) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(&sig).is_ok()
}

pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{:02x}", b).expect("write to String never fails");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_roundtrips() {
        let secret = b"topsecretkey";
        let msg = b"hello evidence";
        let sig = compute_hmac(secret, msg).unwrap();
        assert!(verify_hmac(secret, msg, &sig));
    }

    #[test]
    fn hmac_rejects_tampered_message() {
        let secret = b"topsecretkey";
        let sig = compute_hmac(secret, b"original").unwrap();
        assert!(!verify_hmac(secret, b"tampered", &sig));
    }

    #[test]
    fn hmac_rejects_wrong_secret() {
        let sig = compute_hmac(b"keyone", b"message").unwrap();
        assert!(!verify_hmac(b"keytwo", b"message", &sig));
    }

    #[test]
    fn canonical_encoding_sorts_keys_and_strips_whitespace() {
        let mut files = BTreeMap::new();
        files.insert("zeta.log".to_string(), "ff".to_string());
        files.insert("alpha.log".to_string(), "aa".to_string());
        let manifest = EvidenceManifest::new("lab-1".to_string(), files);
        let bytes = manifest.canonical_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.find("alpha.log").unwrap() < text.find("zeta.log").unwrap());
        assert!(!text.contains(' '));
    }

    #[test]
    fn canonical_encoding_sorts_top_level_fields_too() {
        // Declaration order is lab_id, sealed_at, evidence_version,
        // seal_version, files — sorted order is the reverse of that for
        // every pair here except sealed_at/evidence_version.
        let manifest = EvidenceManifest::new("lab-1".to_string(), BTreeMap::new());
        let bytes = manifest.canonical_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let pos = |key: &str| text.find(&format!("\"{key}\"")).unwrap();
        assert!(pos("evidence_version") < pos("files"));
        assert!(pos("files") < pos("lab_id"));
        assert!(pos("lab_id") < pos("seal_version"));
        assert!(pos("seal_version") < pos("sealed_at"));
    }
}
