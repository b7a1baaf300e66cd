//! Stuck-ENDING watchdog (spec §4.7, §8 scenario S7).
//!
//! A lab can sit in ENDING indefinitely if a teardown attempt crashed the
//! process mid-flight, or if the driver call keeps hitting the same
//! transient failure. The watchdog finds ENDING labs older than an
//! operator-chosen threshold and either retries the exact same teardown
//! path the worker uses, or gives up and marks them FAILED — the operator
//! picks the action, the watchdog never decides on its own.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use octolab_config::Settings;
use octolab_domain::{LabId, LabStatus};
use octolab_driver::DriverRegistry;
use octolab_store::LabStore;

use crate::error::OrchestratorError;
use crate::report::{WatchdogAction, WatchdogEntry, WatchdogOutcome, WatchdogReport};
use crate::teardown::teardown_one;

const DEFAULT_SWEEP_LIMIT: u32 = 50;

/// Runs one watchdog sweep. `target_lab`, when set, bypasses the
/// age/status selection entirely and operates on exactly that lab
/// (spec §4.7 "Targeting a specific lab id bypasses filters") — it is
/// still reported as `StillEnding` rather than acted on if that lab turns
/// out not to be ENDING.
pub async fn run_watchdog_sweep(
    store: &Arc<dyn LabStore>,
    drivers: &Arc<DriverRegistry>,
    settings: &Arc<Settings>,
    threshold: chrono::Duration,
    action: WatchdogAction,
    dry_run: bool,
    target_lab: Option<LabId>,
) -> Result<WatchdogReport, OrchestratorError> {
    let threshold_minutes = threshold.num_minutes();
    let mut report = WatchdogReport::new(dry_run, action, threshold_minutes);

    let candidates = match target_lab {
        Some(id) => match store.get_lab(id).await? {
            Some(lab) if lab.status == LabStatus::Ending => vec![lab],
            Some(_) | None => Vec::new(),
        },
        None => store.claim_labs_by_status(LabStatus::Ending, threshold, DEFAULT_SWEEP_LIMIT).await?,
    };

    for lab in candidates {
        let stuck_for_minutes = (Utc::now() - lab.updated_at).num_minutes();
        let lab_id = lab.id;

        if dry_run {
            report.entries.push(WatchdogEntry { lab_id, stuck_for_minutes, outcome: WatchdogOutcome::StillEnding });
            continue;
        }

        let outcome = match action {
            WatchdogAction::ForceTeardown => match teardown_one(store, drivers, settings, lab).await {
                Ok(LabStatus::Finished) => WatchdogOutcome::Finished,
                Ok(LabStatus::Failed) => WatchdogOutcome::Failed,
                Ok(_) => WatchdogOutcome::StillEnding,
                Err(e) => {
                    warn!(lab_id = %lab_id, error = %e, "watchdog forced teardown failed");
                    WatchdogOutcome::Error { message: e.to_string() }
                }
            },
            WatchdogAction::Fail => match force_fail(store, lab_id).await {
                Ok(()) => WatchdogOutcome::Failed,
                Err(e) => WatchdogOutcome::Error { message: e.to_string() },
            },
        };

        info!(lab_id = %lab_id, stuck_for_minutes, ?outcome, "watchdog processed stuck lab");
        report.entries.push(WatchdogEntry { lab_id, stuck_for_minutes, outcome });
    }

    Ok(report)
}

/// Marks a stuck lab FAILED directly, without attempting teardown again.
/// The port reservation is released best-effort since the lab is leaving
/// the active set regardless of whether its runtime resources were ever
/// confirmed reclaimed.
async fn force_fail(store: &Arc<dyn LabStore>, lab_id: LabId) -> Result<(), OrchestratorError> {
    let Some(mut lab) = store.get_lab(lab_id).await? else {
        return Err(OrchestratorError::LabNotFound(lab_id));
    };
    if let Err(e) = store.release_port(lab_id).await {
        warn!(lab_id = %lab_id, error = %e, "failed to release port reservation while force-failing stuck lab");
    }
    lab.mark_failed()?;
    store.update_lab(&lab).await?;
    Ok(())
}
