//! Artifact-kind classification for evidence manifests (spec §4.5, §8
//! testable property #2 "Manifest truth").
//!
//! Grounded in `test_evidence_bundle.py`'s fixtures: a file counts as a
//! `terminal_logs` artifact when its path runs through a `tlog/` segment
//! (`evidence/tlog/<lab_id>/session.jsonl`, `.../commands.tsv`), and as a
//! `pcap` artifact when its path or name carries `pcap` (`pcap/capture.pcap`).

use std::collections::BTreeMap;

use serde::Serialize;

pub const ARTIFACT_KIND_TERMINAL_LOGS: &str = "terminal_logs";
pub const ARTIFACT_KIND_PCAP: &str = "pcap";

const KNOWN_KINDS: &[&str] = &[ARTIFACT_KIND_TERMINAL_LOGS, ARTIFACT_KIND_PCAP];

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ArtifactPresence {
    pub present: bool,
}

/// Classifies a manifest key into a known artifact kind, or `None` if it
/// doesn't belong to one (most evidence files are just logs with no
/// presence contract attached to them).
pub fn classify_artifact_kind(manifest_key: &str) -> Option<&'static str> {
    let lower = manifest_key.to_ascii_lowercase();
    if lower.contains("/tlog/") || lower.starts_with("tlog/") {
        Some(ARTIFACT_KIND_TERMINAL_LOGS)
    } else if lower.contains("pcap") {
        Some(ARTIFACT_KIND_PCAP)
    } else {
        None
    }
}

/// Builds the `artifacts.<kind>.present` map for a set of manifest keys
/// that actually made it into a bundle. Every known kind is always
/// present in the map, `present: false` when no matching file was found —
/// so a consumer never has to treat a missing key as "unknown" vs. "absent".
pub fn build_artifact_presence(included_files: &[String]) -> BTreeMap<String, ArtifactPresence> {
    let mut map: BTreeMap<String, ArtifactPresence> =
        KNOWN_KINDS.iter().map(|k| (k.to_string(), ArtifactPresence { present: false })).collect();
    for key in included_files {
        if let Some(kind) = classify_artifact_kind(key) {
            map.get_mut(kind).expect("classify_artifact_kind only returns known kinds").present = true;
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_tlog_and_pcap_paths() {
        assert_eq!(classify_artifact_kind("evidence/tlog/lab-1/session.jsonl"), Some(ARTIFACT_KIND_TERMINAL_LOGS));
        assert_eq!(classify_artifact_kind("pcap/capture.pcap"), Some(ARTIFACT_KIND_PCAP));
        assert_eq!(classify_artifact_kind("auth/logs/compose.log"), None);
    }

    #[test]
    fn presence_is_false_for_kinds_with_no_matching_file() {
        let map = build_artifact_presence(&["auth/logs/compose.log".to_string()]);
        assert!(!map[ARTIFACT_KIND_TERMINAL_LOGS].present);
        assert!(!map[ARTIFACT_KIND_PCAP].present);
    }

    #[test]
    fn presence_is_true_when_a_matching_file_is_included() {
        let map = build_artifact_presence(&[
            "evidence/tlog/lab-1/commands.tsv".to_string(),
            "pcap/capture.pcap".to_string(),
        ]);
        assert!(map[ARTIFACT_KIND_TERMINAL_LOGS].present);
        assert!(map[ARTIFACT_KIND_PCAP].present);
    }
}
