pub mod artifacts;
pub mod bundle;
pub mod compose_logs;
pub mod error;
pub mod extract;
pub mod manifest;

pub use artifacts::{build_artifact_presence, classify_artifact_kind, ArtifactPresence};
pub use bundle::{
    build_unverified_evidence_bundle, build_verified_evidence_bundle, enumerate_bundle_entries,
    seal_auth_evidence, verify_auth_evidence, SealOutcome, UnverifiedBundle, UnverifiedManifest,
    VerifyOutcome,
};
pub use compose_logs::export_compose_logs_to_auth_volume;
pub use error::EvidenceError;
pub use extract::{extract_auth_volume, extract_user_volume, write_file_into_volume, ExtractedFile};
pub use manifest::{canonical_json, compute_hmac, verify_hmac, EvidenceManifest};
