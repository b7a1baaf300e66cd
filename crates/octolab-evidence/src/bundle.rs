//! Sealing, verification, and bundle assembly for lab evidence (spec §4.5).
//!
//! Grounded in `evidence_sealing.py`'s `seal_auth_evidence` /
//! `verify_auth_evidence` / `build_verified_evidence_bundle`: the
//! authoritative volume is extracted, hashed, and HMAC-signed at teardown;
//! later, building a downloadable bundle always re-extracts and
//! re-verifies from scratch rather than trusting the stored seal status —
//! a forged or corrupted volume must fail the download, not just the seal.

use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::artifacts::{build_artifact_presence, ArtifactPresence};
use crate::error::EvidenceError;
use crate::extract::{extract_auth_volume, extract_user_volume, write_file_into_volume, ExtractedFile};
use crate::manifest::{
    canonical_json, compute_file_hash, compute_hmac, hash_bytes, verify_hmac, EvidenceManifest, EVIDENCE_VERSION,
};

const MANIFEST_KEY: &str = "auth/manifest.json";
const SIGNATURE_KEY: &str = "auth/manifest.sig";

pub struct SealOutcome {
    pub manifest_sha256: String,
    pub sealed_at: chrono::DateTime<chrono::Utc>,
}

pub struct VerifyOutcome {
    pub ok: bool,
    pub reason: String,
}

/// Extracts the authoritative volume, hashes every file except the
/// manifest and its own signature, signs the canonical manifest, and
/// writes both back into the volume.
pub async fn seal_auth_evidence(
    auth_volume: &str,
    lab_id: &str,
    hmac_secret: &[u8],
    max_total_bytes: u64,
    max_member_bytes: u64,
    timeout: Duration,
) -> Result<SealOutcome, EvidenceError> {
    let tmp = tempfile::tempdir()?;
    let files =
        extract_auth_volume(auth_volume, tmp.path(), max_total_bytes, max_member_bytes, timeout)
            .await?;

    let mut hashes = BTreeMap::new();
    for file in &files {
        if file.manifest_key == MANIFEST_KEY || file.manifest_key == SIGNATURE_KEY {
            continue;
        }
        let hash = compute_file_hash(&tmp.path().join(&file.disk_path))?;
        hashes.insert(file.manifest_key.clone(), hash);
    }

    let manifest = EvidenceManifest::new(lab_id.to_string(), hashes);
    let canonical = manifest.canonical_bytes()?;
    let signature = compute_hmac(hmac_secret, &canonical)?;
    let manifest_sha256 = hash_bytes(&canonical);

    write_file_into_volume(auth_volume, "manifest.json", &canonical, timeout).await?;
    write_file_into_volume(auth_volume, "manifest.sig", signature.as_bytes(), timeout).await?;

    Ok(SealOutcome { manifest_sha256, sealed_at: manifest.sealed_at })
}

/// Re-extracts the authoritative volume and checks the seal from scratch:
/// the manifest is re-canonicalized from its parsed form (never the raw
/// bytes on disk), the signature is verified, and every listed file is
/// re-hashed and compared. A missing manifest/signature or any mismatch is
/// reported via `reason`, never by panicking or silently passing.
pub async fn verify_auth_evidence(
    auth_volume: &str,
    hmac_secret: &[u8],
    max_total_bytes: u64,
    max_member_bytes: u64,
    timeout: Duration,
) -> Result<VerifyOutcome, EvidenceError> {
    let tmp = tempfile::tempdir()?;
    let files =
        extract_auth_volume(auth_volume, tmp.path(), max_total_bytes, max_member_bytes, timeout)
            .await?;

    let Some(manifest_entry) = files.iter().find(|f| f.manifest_key == MANIFEST_KEY) else {
        return Ok(VerifyOutcome { ok: false, reason: "manifest.json not present in volume".into() });
    };
    let Some(sig_entry) = files.iter().find(|f| f.manifest_key == SIGNATURE_KEY) else {
        return Ok(VerifyOutcome { ok: false, reason: "manifest.sig not present in volume".into() });
    };

    let manifest_bytes = std::fs::read(tmp.path().join(&manifest_entry.disk_path))?;
    let manifest: EvidenceManifest = match serde_json::from_slice(&manifest_bytes) {
        Ok(m) => m,
        Err(e) => {
            return Ok(VerifyOutcome { ok: false, reason: format!("manifest.json is not valid: {e}") })
        }
    };
    let canonical = manifest.canonical_bytes()?;

    let signature = std::fs::read_to_string(tmp.path().join(&sig_entry.disk_path))?;
    if !verify_hmac(hmac_secret, &canonical, signature.trim()) {
        return Ok(VerifyOutcome { ok: false, reason: "HMAC signature does not match manifest".into() });
    }

    for (key, expected_hash) in &manifest.files {
        let Some(file) = files.iter().find(|f| &f.manifest_key == key) else {
            return Ok(VerifyOutcome { ok: false, reason: format!("file listed in manifest is missing: {key}") });
        };
        let actual_hash = compute_file_hash(&tmp.path().join(&file.disk_path))?;
        if &actual_hash != expected_hash {
            return Ok(VerifyOutcome { ok: false, reason: format!("hash mismatch for {key}") });
        }
    }

    Ok(VerifyOutcome { ok: true, reason: "ok".into() })
}

/// Extraction shared by the real verified-bundle builder and the
/// admin-only raw preview endpoint: both just need "everything currently
/// in these volumes, safely extracted," differing only in whether the
/// caller goes on to verify the seal.
pub async fn enumerate_bundle_entries(
    auth_volume: &str,
    user_volume: Option<&str>,
    dest: &Path,
    max_total_bytes: u64,
    max_member_bytes: u64,
    timeout: Duration,
) -> Result<Vec<ExtractedFile>, EvidenceError> {
    let mut entries =
        extract_auth_volume(auth_volume, dest, max_total_bytes, max_member_bytes, timeout).await?;
    if let Some(user_volume) = user_volume {
        entries.extend(
            extract_user_volume(user_volume, dest, max_total_bytes, max_member_bytes, timeout)
                .await?,
        );
    }
    Ok(entries)
}

/// Builds a downloadable ZIP of verified evidence. Always re-verifies the
/// seal before bundling (`build_verified_evidence_bundle` in the original
/// never trusts a stored `SEALED` status by itself); callers that need to
/// reject an unsealed lab before even attempting extraction should check
/// `EvidenceSealStatus` themselves and surface `EvidenceError::NotSealed`.
pub async fn build_verified_evidence_bundle(
    auth_volume: &str,
    user_volume: Option<&str>,
    hmac_secret: &[u8],
    include_user_volume: bool,
    max_total_bytes: u64,
    max_member_bytes: u64,
    timeout: Duration,
) -> Result<Vec<u8>, EvidenceError> {
    let verified =
        verify_auth_evidence(auth_volume, hmac_secret, max_total_bytes, max_member_bytes, timeout)
            .await?;
    if !verified.ok {
        return Err(EvidenceError::VerificationFailed(verified.reason));
    }

    let tmp = tempfile::tempdir()?;
    let user_volume = if include_user_volume { user_volume } else { None };
    let entries = enumerate_bundle_entries(
        auth_volume,
        user_volume,
        tmp.path(),
        max_total_bytes,
        max_member_bytes,
        timeout,
    )
    .await?;

    zip_entries(tmp.path(), &entries)
}

/// Outcome of building an unverified bundle: the zip bytes plus the exact
/// list of manifest keys that were actually written into it. `manifest.json`
/// inside the zip must list precisely these keys (spec §4.5, §8 testable
/// property #2) — never the set of files the extraction *attempted*, since a
/// partially-readable volume must not claim files it couldn't include.
pub struct UnverifiedBundle {
    pub zip: Vec<u8>,
    pub included_files: Vec<String>,
}

/// The manifest written into an unverified bundle's `manifest.json`. Unlike
/// [`EvidenceManifest`] (which carries per-file hashes under an HMAC seal),
/// this one exists to let a caller check, without downloading or re-hashing
/// anything, what actually made it into the zip — `included_files` and
/// `artifacts.<kind>.present` (spec §4.5, §8 testable property #2).
#[derive(Debug, Clone, Serialize)]
pub struct UnverifiedManifest {
    pub lab_id: String,
    pub generated_at: DateTime<Utc>,
    pub evidence_version: String,
    pub included_files: Vec<String>,
    pub artifacts: BTreeMap<String, ArtifactPresence>,
}

impl UnverifiedManifest {
    pub fn new(lab_id: String, included_files: Vec<String>) -> Self {
        let artifacts = build_artifact_presence(&included_files);
        Self { lab_id, generated_at: Utc::now(), evidence_version: EVIDENCE_VERSION.to_string(), included_files, artifacts }
    }
}

/// Builds a downloadable ZIP for a lab whose evidence may not be sealed yet
/// (READY, DEGRADED, or FINISHED-but-unsealed). Unlike
/// [`build_verified_evidence_bundle`], this never checks or requires a seal:
/// it extracts whatever is currently in the volumes, writes every file it
/// can read into the zip, and then emits its own best-effort manifest
/// describing exactly what made it in. A file that fails to read from disk
/// is skipped and simply absent from `included_files` rather than aborting
/// the whole bundle.
pub async fn build_unverified_evidence_bundle(
    auth_volume: &str,
    user_volume: Option<&str>,
    lab_id: &str,
    include_user_volume: bool,
    max_total_bytes: u64,
    max_member_bytes: u64,
    timeout: Duration,
) -> Result<UnverifiedBundle, EvidenceError> {
    let tmp = tempfile::tempdir()?;
    let user_volume = if include_user_volume { user_volume } else { None };
    let entries = enumerate_bundle_entries(
        auth_volume,
        user_volume,
        tmp.path(),
        max_total_bytes,
        max_member_bytes,
        timeout,
    )
    .await?;

    let cursor = Cursor::new(Vec::new());
    let mut writer = ZipWriter::new(cursor);
    let options = FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o600);

    let mut included_files = Vec::new();
    for entry in &entries {
        let Ok(data) = std::fs::read(tmp.path().join(&entry.disk_path)) else {
            continue;
        };
        writer.start_file(entry.manifest_key.clone(), options)?;
        writer.write_all(&data)?;
        included_files.push(entry.manifest_key.clone());
    }

    let manifest = UnverifiedManifest::new(lab_id.to_string(), included_files.clone());
    let manifest_bytes = canonical_json(&manifest)?;
    writer.start_file(MANIFEST_KEY, options)?;
    writer.write_all(&manifest_bytes)?;

    let zip = writer.finish()?.into_inner();
    Ok(UnverifiedBundle { zip, included_files })
}

fn zip_entries(root: &Path, entries: &[ExtractedFile]) -> Result<Vec<u8>, EvidenceError> {
    let cursor = Cursor::new(Vec::new());
    let mut writer = ZipWriter::new(cursor);
    let options = FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o600);

    for entry in entries {
        let data = std::fs::read(root.join(&entry.disk_path))?;
        writer.start_file(entry.manifest_key.clone(), options)?;
        writer.write_all(&data)?;
    }

    let cursor = writer.finish()?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_entries_produces_a_nonempty_archive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("compose.log"), b"hello").unwrap();
        let entries = vec![ExtractedFile {
            disk_path: Path::new("compose.log").to_path_buf(),
            manifest_key: "auth/logs/compose.log".to_string(),
        }];
        let bytes = zip_entries(dir.path(), &entries).unwrap();
        assert!(!bytes.is_empty());
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 1);
        let file = archive.by_index(0).unwrap();
        assert_eq!(file.name(), "auth/logs/compose.log");
    }
}
