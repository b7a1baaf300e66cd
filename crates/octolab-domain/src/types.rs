use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::naming;

// ── Identifiers ──────────────────────────────────────────────────────────────
//
// All three are server-owned UUIDs. LabId doubles as the sole input to every
// derived resource name (project, network, volume, TAP) — see `naming`.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabId(pub Uuid);

impl LabId {
    pub fn new() -> Self {
        LabId(Uuid::new_v4())
    }

    /// First 8 hex chars, used for gateway usernames/connection names and
    /// TAP interface names — never the full id (keeps derived OS-level names
    /// short and within kernel interface-name limits).
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for LabId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub Uuid);

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecipeId(pub Uuid);

impl std::fmt::Display for RecipeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Enums ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Container,
    #[serde(rename = "microvm")]
    MicroVm,
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Runtime::Container => write!(f, "container"),
            Runtime::MicroVm => write!(f, "microvm"),
        }
    }
}

/// Lab lifecycle status. See spec §4.1 for the legal transition graph.
///
/// DEGRADED is a peer of READY, not a point on the path to it: both accept
/// the same client operations (connect, evidence) and both transition to
/// ENDING the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabStatus {
    Requested,
    Provisioning,
    Ready,
    Degraded,
    Ending,
    Finished,
    Failed,
}

impl LabStatus {
    fn name(&self) -> &'static str {
        match self {
            LabStatus::Requested => "requested",
            LabStatus::Provisioning => "provisioning",
            LabStatus::Ready => "ready",
            LabStatus::Degraded => "degraded",
            LabStatus::Ending => "ending",
            LabStatus::Finished => "finished",
            LabStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LabStatus::Finished | LabStatus::Failed)
    }

    /// Connect and evidence endpoints are gated on READY-or-DEGRADED; see
    /// spec §9's Open Question resolution unifying the two source behaviors.
    pub fn is_connectable(&self) -> bool {
        matches!(self, LabStatus::Ready | LabStatus::Degraded)
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            LabStatus::Requested | LabStatus::Provisioning | LabStatus::Ready | LabStatus::Degraded | LabStatus::Ending
        )
    }

    /// True if transitioning from `self` to `next` is a legal edge in the
    /// state graph of spec §4.1. Terminal states never spontaneously
    /// transition back — enforced here so callers cannot accidentally
    /// resurrect a FINISHED/FAILED row.
    pub fn can_transition_to(&self, next: LabStatus) -> bool {
        use LabStatus::*;
        match (*self, next) {
            (Requested, Provisioning) => true,
            (Requested, Ending) => true,
            (Provisioning, Ready) => true,
            (Provisioning, Degraded) => true,
            (Provisioning, Failed) => true,
            (Ready, Ending) => true,
            (Degraded, Ending) => true,
            (Ending, Finished) => true,
            (Ending, Failed) => true,
            // Idempotent no-op: re-observing the same state is not a transition.
            (a, b) if a == b => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LabStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceState {
    Absent,
    Collecting,
    Present,
    Unavailable,
}

impl std::fmt::Display for EvidenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvidenceState::Absent => "absent",
            EvidenceState::Collecting => "collecting",
            EvidenceState::Present => "present",
            EvidenceState::Unavailable => "unavailable",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceSealStatus {
    None,
    Sealed,
    Failed,
}

impl std::fmt::Display for EvidenceSealStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvidenceSealStatus::None => "none",
            EvidenceSealStatus::Sealed => "sealed",
            EvidenceSealStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

// ── Lab ───────────────────────────────────────────────────────────────────────

/// The primary entity. See spec §3.
///
/// Lab rows are never deleted. `id` is the sole input to every derived
/// resource name (project/network/volume/TAP); owner scoping must be
/// enforced by every store query that reads a lab, not just by this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lab {
    pub id: LabId,
    pub owner_id: OwnerId,
    pub recipe_id: RecipeId,
    pub status: LabStatus,
    pub runtime: Runtime,
    /// Opaque runtime-specific metadata: guest IP, forwarded port, generated
    /// Dockerfile, exposed ports, vnc_host/vnc_port for the microVM runtime, etc.
    pub runtime_meta: serde_json::Value,
    pub connection_url: Option<String>,
    pub gateway_user_id: Option<String>,
    pub gateway_connection_id: Option<String>,
    /// Encrypted at rest; see octolab-gateway's password-encryption helper.
    pub gateway_password_enc: Option<String>,
    pub novnc_host_port: Option<u16>,
    pub evidence_state: EvidenceState,
    pub evidence_seal_status: EvidenceSealStatus,
    pub evidence_manifest_sha256: Option<String>,
    pub evidence_auth_volume: String,
    pub evidence_user_volume: String,
    pub requested_intent: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub evidence_expires_at: Option<DateTime<Utc>>,
    pub evidence_sealed_at: Option<DateTime<Utc>>,
    pub evidence_finalized_at: Option<DateTime<Utc>>,
}

impl Lab {
    pub fn new(
        owner_id: OwnerId,
        recipe_id: RecipeId,
        runtime: Runtime,
        ttl_minutes: i64,
        requested_intent: Option<serde_json::Value>,
    ) -> Self {
        let id = LabId::new();
        let now = Utc::now();
        Lab {
            id,
            owner_id,
            recipe_id,
            status: LabStatus::Requested,
            runtime,
            runtime_meta: serde_json::json!({}),
            connection_url: None,
            gateway_user_id: None,
            gateway_connection_id: None,
            gateway_password_enc: None,
            novnc_host_port: None,
            evidence_state: EvidenceState::Absent,
            evidence_seal_status: EvidenceSealStatus::None,
            evidence_manifest_sha256: None,
            evidence_auth_volume: naming::evidence_auth_volume(&id),
            evidence_user_volume: naming::evidence_user_volume(&id),
            requested_intent,
            created_at: now,
            updated_at: now,
            finished_at: None,
            expires_at: now + chrono::Duration::minutes(ttl_minutes),
            evidence_expires_at: None,
            evidence_sealed_at: None,
            evidence_finalized_at: None,
        }
    }

    pub fn project_name(&self) -> String {
        naming::project_name(&self.id)
    }

    /// Validates and applies a status transition in one step. Callers should
    /// never assign `lab.status` directly outside this module.
    pub fn transition_to(&mut self, next: LabStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: Box::leak(self.status.to_string().into_boxed_str()),
                to: Box::leak(next.to_string().into_boxed_str()),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Sets `evidence_expires_at` exactly once; a second call is a no-op
    /// rather than an error, matching the idempotent-finalize pattern used
    /// throughout teardown/reconciliation.
    pub fn set_evidence_expiry(&mut self, at: DateTime<Utc>) {
        if self.evidence_expires_at.is_none() {
            self.evidence_expires_at = Some(at);
        }
    }

    pub fn mark_finished(&mut self, evidence_ttl: chrono::Duration) -> Result<(), DomainError> {
        self.transition_to(LabStatus::Finished)?;
        let now = Utc::now();
        self.finished_at = Some(now);
        self.set_evidence_expiry(now + evidence_ttl);
        Ok(())
    }

    pub fn mark_failed(&mut self) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Ok(());
        }
        self.transition_to(LabStatus::Failed)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_lab() -> Lab {
        Lab::new(OwnerId(Uuid::new_v4()), RecipeId(Uuid::new_v4()), Runtime::Container, 60, None)
    }

    #[test]
    fn new_lab_starts_requested_with_derived_volume_names() {
        let lab = fresh_lab();
        assert_eq!(lab.status, LabStatus::Requested);
        assert!(lab.evidence_auth_volume.ends_with("_evidence_auth"));
        assert!(lab.evidence_user_volume.ends_with("_evidence_user"));
        assert!(lab.evidence_auth_volume.contains(&lab.id.to_string()));
    }

    #[test]
    fn legal_transitions_succeed() {
        let mut lab = fresh_lab();
        lab.transition_to(LabStatus::Provisioning).unwrap();
        lab.transition_to(LabStatus::Ready).unwrap();
        lab.transition_to(LabStatus::Ending).unwrap();
        lab.mark_finished(chrono::Duration::hours(24)).unwrap();
        assert_eq!(lab.status, LabStatus::Finished);
        assert!(lab.finished_at.is_some());
        assert!(lab.evidence_expires_at.is_some());
    }

    #[test]
    fn terminal_state_never_transitions_back() {
        let mut lab = fresh_lab();
        lab.transition_to(LabStatus::Provisioning).unwrap();
        lab.transition_to(LabStatus::Failed).unwrap();
        assert!(lab.transition_to(LabStatus::Provisioning).is_err());
        assert!(lab.transition_to(LabStatus::Ready).is_err());
    }

    #[test]
    fn illegal_skip_is_rejected() {
        let mut lab = fresh_lab();
        // REQUESTED -> READY is not a legal edge; must go through PROVISIONING.
        assert!(lab.transition_to(LabStatus::Ready).is_err());
    }

    #[test]
    fn degraded_is_a_peer_of_ready() {
        let mut lab = fresh_lab();
        lab.transition_to(LabStatus::Provisioning).unwrap();
        lab.transition_to(LabStatus::Degraded).unwrap();
        assert!(lab.status.is_connectable());
        lab.transition_to(LabStatus::Ending).unwrap();
        assert_eq!(lab.status, LabStatus::Ending);
    }

    #[test]
    fn evidence_expiry_set_exactly_once() {
        let mut lab = fresh_lab();
        let first = Utc::now();
        lab.set_evidence_expiry(first);
        let later = first + chrono::Duration::hours(1);
        lab.set_evidence_expiry(later);
        assert_eq!(lab.evidence_expires_at, Some(first));
    }

    #[test]
    fn mark_failed_is_idempotent_on_terminal() {
        let mut lab = fresh_lab();
        lab.transition_to(LabStatus::Provisioning).unwrap();
        lab.mark_failed().unwrap();
        let finished_at = lab.finished_at;
        lab.mark_failed().unwrap();
        assert_eq!(lab.finished_at, finished_at);
    }
}
