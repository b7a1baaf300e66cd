//! Evidence-state self-healing on read (spec §4.5 "Evidence state
//! reconciliation", §4.7 "Reconciliation on read").
//!
//! A terminal lab's evidence is normally finalized as the last step of
//! [`crate::teardown::teardown_one`]. If the process crashed between the
//! driver's `destroy_lab` call and that finalization — or a lab reached a
//! terminal state through some other path, such as the watchdog's `Fail`
//! action — a read can observe a FINISHED/FAILED row stuck with
//! `evidence_state = Collecting` and no `evidence_finalized_at`. Rather than
//! running a background sweep for this, every lab-read path calls
//! [`reconcile_lab_on_read`] first, so the fix-up happens lazily and
//! exactly once.

use chrono::Utc;
use tracing::warn;

use octolab_config::Settings;
use octolab_domain::{EvidenceSealStatus, EvidenceState, Lab};
use octolab_store::LabStore;

use crate::error::OrchestratorError;

/// Runs finalization exactly once for a terminal lab stuck in `Collecting`.
/// Returns the (possibly updated) lab; the caller should serve this value
/// rather than the one it was given, since the store row may have changed.
pub async fn reconcile_lab_on_read(
    store: &dyn LabStore,
    settings: &Settings,
    mut lab: Lab,
) -> Result<Lab, OrchestratorError> {
    if !lab.status.is_terminal() || lab.evidence_state != EvidenceState::Collecting || lab.evidence_finalized_at.is_some()
    {
        return Ok(lab);
    }

    match try_finalize(settings, &mut lab).await {
        Ok(()) => {}
        Err(e) => {
            warn!(lab_id = %lab.id, error = %e, "evidence finalization-on-read failed, marking unavailable");
            lab.evidence_state = EvidenceState::Unavailable;
            lab.evidence_seal_status = EvidenceSealStatus::Failed;
        }
    }
    // Finalized exactly once regardless of outcome, so this branch is never
    // re-entered for the same lab (spec: "finalized so the check does not
    // repeat").
    lab.evidence_finalized_at = Some(Utc::now());
    store.update_lab(&lab).await?;
    Ok(lab)
}

async fn try_finalize(settings: &Settings, lab: &mut Lab) -> Result<(), OrchestratorError> {
    let outcome = octolab_evidence::seal_auth_evidence(
        &lab.evidence_auth_volume,
        &lab.id.to_string(),
        &settings.hmac_secret,
        settings.evidence_max_total_bytes,
        settings.evidence_max_member_bytes,
        settings.evidence_seal_timeout,
    )
    .await?;
    lab.evidence_seal_status = EvidenceSealStatus::Sealed;
    lab.evidence_sealed_at = Some(outcome.sealed_at);
    lab.evidence_manifest_sha256 = Some(outcome.manifest_sha256);
    lab.evidence_state = EvidenceState::Present;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use octolab_domain::{LabStatus, OwnerId, RecipeId, Runtime};
    use octolab_store::InMemoryLabStore;
    use uuid::Uuid;

    fn terminal_lab_stuck_collecting() -> Lab {
        let mut lab = Lab::new(OwnerId(Uuid::new_v4()), RecipeId(Uuid::new_v4()), Runtime::Container, 60, None);
        lab.transition_to(LabStatus::Provisioning).unwrap();
        lab.transition_to(LabStatus::Ready).unwrap();
        lab.transition_to(LabStatus::Ending).unwrap();
        lab.mark_finished(chrono::Duration::hours(24)).unwrap();
        lab.evidence_state = EvidenceState::Collecting;
        lab
    }

    fn test_settings() -> Settings {
        crate::test_support::test_settings()
    }

    #[tokio::test]
    async fn non_terminal_lab_is_left_untouched() {
        let store = InMemoryLabStore::new();
        let lab = Lab::new(OwnerId(Uuid::new_v4()), RecipeId(Uuid::new_v4()), Runtime::Container, 60, None);
        store.insert_lab(&lab).await.unwrap();
        let settings = test_settings();
        let result = reconcile_lab_on_read(&store, &settings, lab.clone()).await.unwrap();
        assert_eq!(result.evidence_state, EvidenceState::Absent);
        assert!(result.evidence_finalized_at.is_none());
    }

    #[tokio::test]
    async fn stuck_collecting_terminal_lab_gets_finalized_exactly_once() {
        let store = InMemoryLabStore::new();
        let lab = terminal_lab_stuck_collecting();
        store.insert_lab(&lab).await.unwrap();
        let settings = test_settings();

        // The auth volume doesn't really exist in this unit test environment,
        // so sealing fails and the lab must land on Unavailable, not panic
        // or loop.
        let result = reconcile_lab_on_read(&store, &settings, lab).await.unwrap();
        assert!(result.evidence_finalized_at.is_some());
        assert_eq!(result.evidence_state, EvidenceState::Unavailable);

        let finalized_at = result.evidence_finalized_at;
        let again = reconcile_lab_on_read(&store, &settings, result).await.unwrap();
        assert_eq!(again.evidence_finalized_at, finalized_at);
    }
}
