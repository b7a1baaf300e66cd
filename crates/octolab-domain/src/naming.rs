//! Deterministic resource naming and the name-safety invariant (spec §4.2, §8.1).
//!
//! Every container-runtime and microVM resource name is derived solely from
//! `lab.id`; nothing here ever accepts a caller-supplied name. Every name is
//! validated against [`PROJECT_PATTERN`] or [`TAP_PATTERN`] before use —
//! callers in `octolab-driver` re-validate at the point of every subprocess
//! invocation, not just here, since this module only defines the pattern.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::LabId;

/// `^octolab_<uuid>(_[a-z_]+)?$` — matches the project name itself and any
/// suffix-qualified derivative (network, volume).
pub static PROJECT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^octolab_[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}(_[a-z_]+)?$",
    )
    .expect("static regex")
});

/// `^tap-[0-9a-f]{8}$`
pub static TAP_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^tap-[0-9a-f]{8}$").expect("static regex")
});

pub fn project_name(id: &LabId) -> String {
    format!("octolab_{}", id.0)
}

pub fn lab_net_name(id: &LabId) -> String {
    format!("{}_lab_net", project_name(id))
}

pub fn egress_net_name(id: &LabId) -> String {
    format!("{}_egress_net", project_name(id))
}

pub fn evidence_auth_volume(id: &LabId) -> String {
    format!("{}_evidence_auth", project_name(id))
}

pub fn evidence_user_volume(id: &LabId) -> String {
    format!("{}_evidence_user", project_name(id))
}

pub fn lab_pcap_volume(id: &LabId) -> String {
    format!("{}_lab_pcap", project_name(id))
}

pub fn tap_name(id: &LabId) -> String {
    format!("tap-{}", id.short())
}

/// Refuses operations on names that don't match the strict project/volume/
/// network pattern — in particular this silently refuses infrastructure
/// project names like `octolab_mvp` or the gateway stack's own project,
/// since those never match the UUID-bearing pattern.
pub fn is_valid_project_name(name: &str) -> bool {
    PROJECT_PATTERN.is_match(name)
}

pub fn is_valid_tap_name(name: &str) -> bool {
    TAP_PATTERN.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_names_are_all_valid() {
        let id = LabId::new();
        assert!(is_valid_project_name(&project_name(&id)));
        assert!(is_valid_project_name(&lab_net_name(&id)));
        assert!(is_valid_project_name(&egress_net_name(&id)));
        assert!(is_valid_project_name(&evidence_auth_volume(&id)));
        assert!(is_valid_project_name(&evidence_user_volume(&id)));
        assert!(is_valid_project_name(&lab_pcap_volume(&id)));
        assert!(is_valid_tap_name(&tap_name(&id)));
    }

    #[test]
    fn infrastructure_project_names_are_rejected() {
        assert!(!is_valid_project_name("octolab_mvp"));
        assert!(!is_valid_project_name("octolab_gateway"));
        assert!(!is_valid_project_name("guacamole"));
    }

    #[test]
    fn arbitrary_suffix_is_not_enough() {
        // Well-formed prefix but not a real UUID must be refused.
        assert!(!is_valid_project_name("octolab_not-a-uuid"));
    }

    #[test]
    fn tap_name_requires_exactly_eight_hex_chars() {
        assert!(!is_valid_tap_name("tap-1234567"));
        assert!(!is_valid_tap_name("tap-123456789"));
        assert!(!is_valid_tap_name("tap-ZZZZZZZZ"));
    }
}
