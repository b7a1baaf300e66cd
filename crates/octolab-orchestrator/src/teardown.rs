//! Verified-teardown sequencing for ENDING labs (spec §4.1, §4.5, §4.7).
//!
//! Grounded in `lab_service.py`'s `_teardown_lab`: export authoritative logs,
//! seal evidence, tear down the gateway connection, finalize the evidence
//! state, then hand off to the runtime driver's verified-teardown protocol.
//! Every step except the final driver call is best-effort — a half-failed
//! evidence seal or an unreachable gateway must never block a lab from
//! reaching a terminal state, since an ENDING lab that can never finish is
//! worse than one with incomplete evidence.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use octolab_config::Settings;
use octolab_domain::{Lab, LabId, LabStatus, Runtime};
use octolab_driver::DriverRegistry;
use octolab_store::LabStore;

use crate::error::OrchestratorError;

const DEFAULT_WORKER_BATCH: u32 = 25;

/// User/TTL/quota-initiated transition into ENDING. The actual teardown work
/// happens out-of-band in [`teardown_one`], picked up by the worker loop —
/// this function only records intent so the HTTP handler can return
/// immediately.
pub async fn request_teardown(store: &dyn LabStore, mut lab: Lab) -> Result<Lab, OrchestratorError> {
    lab.transition_to(LabStatus::Ending)?;
    store.update_lab(&lab).await?;
    Ok(lab)
}

/// One sweep of the teardown worker: claims up to `DEFAULT_WORKER_BATCH`
/// ENDING labs with `SELECT ... FOR UPDATE SKIP LOCKED` semantics (spec
/// §4.1 invariant: exactly one background task owns a lab id at a time) and
/// drives each through [`teardown_one`] under the configured overall
/// teardown deadline. Returns the number of labs processed this tick.
pub async fn teardown_worker_tick(
    store: &Arc<dyn LabStore>,
    drivers: &Arc<DriverRegistry>,
    settings: &Arc<Settings>,
) -> Result<usize, OrchestratorError> {
    let claimed = store
        .claim_labs_by_status(LabStatus::Ending, chrono::Duration::zero(), DEFAULT_WORKER_BATCH)
        .await?;

    let mut processed = 0;
    for lab in claimed {
        let lab_id = lab.id;
        match tokio::time::timeout(settings.teardown_timeout, teardown_one(store, drivers, settings, lab)).await {
            Ok(Ok(status)) => {
                info!(lab_id = %lab_id, status = %status, "teardown finished");
                processed += 1;
            }
            Ok(Err(e)) => {
                error!(lab_id = %lab_id, error = %e, "teardown failed, lab left in ENDING for retry");
            }
            Err(_) => {
                error!(lab_id = %lab_id, timeout = ?settings.teardown_timeout, "teardown timed out, lab left in ENDING for retry");
            }
        }
    }
    Ok(processed)
}

/// Runs [`teardown_worker_tick`] on a fixed interval until `shutdown` fires.
/// Cancellation during shutdown is not treated as failure: a tick in
/// progress when the signal arrives simply leaves its labs in ENDING, to be
/// picked up again by the next process that starts the worker (spec §5
/// "Cancellation").
pub async fn run_teardown_worker(
    store: Arc<dyn LabStore>,
    drivers: Arc<DriverRegistry>,
    settings: Arc<Settings>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = teardown_worker_tick(&store, &drivers, &settings).await {
                    error!(error = %e, "teardown worker tick failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("teardown worker shutting down");
                    return;
                }
            }
        }
    }
}

/// Drives one ENDING lab to FINISHED or FAILED: export → seal → gateway
/// teardown → finalize evidence → verified driver teardown → terminal
/// status (spec §4.1's ENDING transitions). Idempotent against resuming a
/// lab whose evidence was already sealed or whose gateway resources were
/// already removed on a prior attempt — every step here tolerates "already
/// gone"/"already done".
pub async fn teardown_one(
    store: &Arc<dyn LabStore>,
    drivers: &Arc<DriverRegistry>,
    settings: &Arc<Settings>,
    mut lab: Lab,
) -> Result<LabStatus, OrchestratorError> {
    if lab.status != LabStatus::Ending {
        return Ok(lab.status);
    }

    export_and_seal_evidence(settings, &mut lab).await;

    let gateway_result = octolab_gateway::teardown_guacamole_for_lab(settings, &lab).await;
    if !gateway_result.all_succeeded {
        warn!(lab_id = %lab.id, "gateway teardown did not fully succeed, continuing lab teardown anyway");
    }

    finalize_evidence_state(&mut lab);
    store.update_lab(&lab).await?;

    let driver = drivers.for_runtime(lab.runtime)?;
    let report = driver.destroy_lab(&lab).await?;
    if !report.errors.is_empty() {
        warn!(lab_id = %lab.id, errors = ?report.errors, "teardown reported non-fatal errors");
    }

    if let Err(e) = store.release_port(lab.id).await {
        warn!(lab_id = %lab.id, error = %e, "failed to release port reservation during teardown");
    }

    if report.verified_stopped {
        lab.mark_finished(chrono::Duration::hours(24))?;
    } else {
        warn!(lab_id = %lab.id, ?report, "teardown could not verify all resources were reclaimed");
        lab.mark_failed()?;
    }
    store.update_lab(&lab).await?;
    Ok(lab.status)
}

/// Exports container-runtime compose logs into the auth volume (best-effort,
/// a no-op for microVM labs — a failed `compose_up` there instead gets a
/// redacted `diag` excerpt attached directly to the driver error at create
/// time, not a log export step here) and seals the resulting evidence set
/// with an HMAC over a canonical manifest (spec §4.5). Failure at either
/// step is recorded on the lab row, never propagated — evidence collection
/// must not block teardown.
async fn export_and_seal_evidence(settings: &Settings, lab: &mut Lab) {
    use octolab_domain::EvidenceState;

    lab.evidence_state = EvidenceState::Collecting;

    if lab.runtime == Runtime::Container {
        if let Err(e) = octolab_evidence::export_compose_logs_to_auth_volume(
            &lab.project_name(),
            &lab.evidence_auth_volume,
            settings.evidence_export_timeout,
        )
        .await
        {
            warn!(lab_id = %lab.id, error = %e, "compose log export failed, sealing whatever evidence exists anyway");
        }
    }

    match octolab_evidence::seal_auth_evidence(
        &lab.evidence_auth_volume,
        &lab.id.to_string(),
        &settings.hmac_secret,
        settings.evidence_max_total_bytes,
        settings.evidence_max_member_bytes,
        settings.evidence_seal_timeout,
    )
    .await
    {
        Ok(outcome) => {
            lab.evidence_seal_status = octolab_domain::EvidenceSealStatus::Sealed;
            lab.evidence_sealed_at = Some(outcome.sealed_at);
            lab.evidence_manifest_sha256 = Some(outcome.manifest_sha256);
            lab.evidence_state = EvidenceState::Present;
        }
        Err(e) => {
            error!(lab_id = %lab.id, error = %e, "evidence sealing failed");
            lab.evidence_seal_status = octolab_domain::EvidenceSealStatus::Failed;
            lab.evidence_state = EvidenceState::Unavailable;
        }
    }
}

/// Marks evidence finalized exactly once. Used both at the end of the
/// normal teardown sequence and by [`crate::reconcile::finalize_evidence_on_read`]
/// when a terminal lab is observed whose evidence was never finalized
/// (e.g. the process crashed between driver destroy and this call).
pub fn finalize_evidence_state(lab: &mut Lab) {
    if lab.evidence_finalized_at.is_none() {
        lab.evidence_finalized_at = Some(Utc::now());
    }
}

/// Used by the stuck-ENDING watchdog (spec §4.7) to target a specific lab
/// id regardless of its current status, bypassing the worker's own
/// age/status filter.
pub async fn get_ending_lab(store: &dyn LabStore, lab_id: LabId) -> Result<Option<Lab>, OrchestratorError> {
    Ok(store.get_lab(lab_id).await?)
}
