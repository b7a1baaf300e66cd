//! Lab creation and provisioning (spec §4.1, §4.4).
//!
//! Grounded in `lab_service.py`'s `create_lab`/`provision_lab`: creation is
//! a synchronous, purely-store-side admission check; provisioning runs the
//! actual driver/gateway work under its own deadline and never leaves a lab
//! in REQUESTED or PROVISIONING once it returns.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use octolab_config::Settings;
use octolab_domain::{Lab, LabId, LabIntent, LabStatus, OwnerId, Recipe, RecipeLookup, Runtime};
use octolab_driver::{DriverError, DriverRegistry};
use octolab_store::LabStore;

use crate::error::OrchestratorError;

/// Admits a new lab request: checks the owner's active-lab quota, resolves
/// a recipe for the requested intent, and inserts a `Requested` row.
/// Provisioning itself is a separate step (see [`provision_lab`]) so the
/// HTTP handler can return immediately with the lab id.
pub async fn create_lab(
    store: &dyn LabStore,
    recipes: &dyn RecipeLookup,
    settings: &Settings,
    owner_id: OwnerId,
    intent: LabIntent,
    runtime: Runtime,
) -> Result<Lab, OrchestratorError> {
    let active = store.count_active_labs_for_owner(owner_id).await?;
    if active >= settings.max_active_labs_per_user {
        return Err(OrchestratorError::QuotaExceeded);
    }

    let recipe = recipes
        .find_for_intent(&intent)
        .ok_or(OrchestratorError::RecipeNotFound)?;

    let intent_json = serde_json::to_value(&intent)
        .map_err(|e| OrchestratorError::Internal(format!("serializing lab intent: {e}")))?;
    let lab = Lab::new(owner_id, recipe.id, runtime, settings.default_lab_ttl_minutes, Some(intent_json));
    store.insert_lab(&lab).await?;
    Ok(lab)
}

/// Same admission check as [`create_lab`], but for callers that already
/// hold a `Recipe` outside the catalog — the `/labs/deploy-from-dockerfile`
/// path (spec §6) builds one ad hoc from the submitted Dockerfile rather
/// than resolving it through [`RecipeLookup`].
pub async fn create_lab_with_recipe(
    store: &dyn LabStore,
    settings: &Settings,
    owner_id: OwnerId,
    recipe: &Recipe,
    runtime: Runtime,
    requested_intent: Option<serde_json::Value>,
) -> Result<Lab, OrchestratorError> {
    let active = store.count_active_labs_for_owner(owner_id).await?;
    if active >= settings.max_active_labs_per_user {
        return Err(OrchestratorError::QuotaExceeded);
    }

    let lab = Lab::new(owner_id, recipe.id, runtime, settings.default_lab_ttl_minutes, requested_intent);
    store.insert_lab(&lab).await?;
    Ok(lab)
}

/// Drives a freshly-requested lab from `Requested` to `Ready`/`Degraded`/
/// `Failed`. Intended to be spawned as a detached task right after
/// [`create_lab`] returns; also safe to call from the provisioning
/// dispatcher worker for labs that were requested but never picked up
/// (e.g. after a process restart).
pub async fn provision_lab(
    store: Arc<dyn LabStore>,
    drivers: Arc<DriverRegistry>,
    recipes: Arc<dyn RecipeLookup>,
    settings: Arc<Settings>,
    lab_id: LabId,
) -> Result<(), OrchestratorError> {
    let Some(lab) = store.get_lab(lab_id).await? else {
        return Err(OrchestratorError::LabNotFound(lab_id));
    };
    if lab.status != LabStatus::Requested {
        return Ok(());
    }

    let Some(recipe) = recipes.get(lab.recipe_id) else {
        warn!(lab_id = %lab_id, "recipe disappeared before provisioning, failing lab");
        let mut lab = lab;
        lab.mark_failed()?;
        store.update_lab(&lab).await?;
        return Ok(());
    };

    drive_provisioning(store, drivers, settings, lab, recipe).await
}

/// Drives provisioning for a lab whose recipe was already resolved by the
/// caller rather than looked up via [`RecipeLookup`] — the path used for
/// Dockerfile-sourced labs (spec §6), which have no catalog entry.
pub async fn provision_lab_with_recipe(
    store: Arc<dyn LabStore>,
    drivers: Arc<DriverRegistry>,
    settings: Arc<Settings>,
    lab_id: LabId,
    recipe: Recipe,
) -> Result<(), OrchestratorError> {
    let Some(lab) = store.get_lab(lab_id).await? else {
        return Err(OrchestratorError::LabNotFound(lab_id));
    };
    if lab.status != LabStatus::Requested {
        return Ok(());
    }
    drive_provisioning(store, drivers, settings, lab, recipe).await
}

async fn drive_provisioning(
    store: Arc<dyn LabStore>,
    drivers: Arc<DriverRegistry>,
    settings: Arc<Settings>,
    mut lab: Lab,
    recipe: Recipe,
) -> Result<(), OrchestratorError> {
    let lab_id = lab.id;
    lab.transition_to(LabStatus::Provisioning)?;
    store.update_lab(&lab).await?;

    let outcome = tokio::time::timeout(
        settings.lab_startup_timeout,
        provision_lab_inner(&store, &drivers, &settings, &mut lab, &recipe),
    )
    .await;

    match outcome {
        Ok(Ok(())) => {
            store.update_lab(&lab).await?;
            info!(lab_id = %lab_id, status = %lab.status, "lab provisioning finished");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(lab_id = %lab_id, error = %e, "lab provisioning failed");
            mark_failed_with_cleanup(&store, &drivers, &settings, &mut lab).await;
            Ok(())
        }
        Err(_) => {
            error!(lab_id = %lab_id, timeout = ?settings.lab_startup_timeout, "lab provisioning timed out");
            mark_failed_with_cleanup(&store, &drivers, &settings, &mut lab).await;
            Ok(())
        }
    }
}

async fn provision_lab_inner(
    store: &Arc<dyn LabStore>,
    drivers: &Arc<DriverRegistry>,
    settings: &Arc<Settings>,
    lab: &mut Lab,
    recipe: &octolab_domain::Recipe,
) -> Result<(), OrchestratorError> {
    let driver = drivers.for_runtime(lab.runtime)?;

    let host_port = store
        .allocate_port(lab.id, lab.owner_id, settings.novnc_port_range_start, settings.novnc_port_range_end)
        .await?;
    lab.novnc_host_port = Some(host_port);

    let vnc_password = if settings.guac_enabled {
        let password = octolab_gateway::generate_secure_password(24);
        let key = settings
            .guac_encryption_key
            .as_deref()
            .ok_or_else(|| OrchestratorError::Internal("gateway enabled without an encryption key".to_string()))?;
        lab.gateway_password_enc = Some(octolab_gateway::encrypt_password(key, &password)?);
        Some(password)
    } else {
        None
    };

    let outcome = driver.create_lab(lab, recipe, host_port, vnc_password.as_deref()).await?;
    lab.runtime_meta = outcome.runtime_meta;
    lab.connection_url = Some(outcome.connection_url);

    match driver.wait_for_healthy(lab, settings.container_health_timeout).await {
        Ok(()) => {}
        Err(DriverError::Timeout(_)) if lab.runtime == Runtime::Container => {
            warn!(lab_id = %lab.id, "container lab did not report healthy in time, marking degraded");
            lab.transition_to(LabStatus::Degraded)?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    if settings.guac_enabled {
        let result = octolab_gateway::provision_guacamole_for_lab(settings, lab).await?;
        lab.gateway_connection_id = Some(result.connection_id);
        lab.gateway_user_id = Some(result.username);
        lab.connection_url = Some(result.connection_url);
    } else if !novnc_probe(&lab.connection_url, settings.container_health_timeout).await {
        warn!(lab_id = %lab.id, "desktop port did not accept connections, marking degraded");
        lab.transition_to(LabStatus::Degraded)?;
        return Ok(());
    }

    lab.transition_to(LabStatus::Ready)?;
    Ok(())
}

/// A bare TCP reachability check of the lab's own connection endpoint, used
/// only when the gateway integration is disabled entirely (spec §4.4
/// "gatewayless" mode) — with the gateway enabled, provisioning that far
/// already implies the desktop port is reachable.
async fn novnc_probe(connection_url: &Option<String>, timeout: Duration) -> bool {
    let Some(url) = connection_url else { return false };
    let Some(addr) = url.strip_prefix("tcp://").or_else(|| url.strip_prefix("vnc://")) else {
        return true;
    };
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Best-effort cleanup for a lab that failed or timed out mid-provisioning:
/// releases the port reservation and tears down whatever driver-level
/// resources may already exist, then marks the row FAILED. Skips the
/// destroy call for container-runtime labs when `retain_failed_labs` is set,
/// so an operator can attach and inspect the broken compose project.
async fn mark_failed_with_cleanup(
    store: &Arc<dyn LabStore>,
    drivers: &Arc<DriverRegistry>,
    settings: &Arc<Settings>,
    lab: &mut Lab,
) {
    let skip_destroy = settings.retain_failed_labs && lab.runtime == Runtime::Container;
    if !skip_destroy {
        if let Ok(driver) = drivers.for_runtime(lab.runtime) {
            if let Err(e) = driver.destroy_lab(lab).await {
                warn!(lab_id = %lab.id, error = %e, "cleanup after failed provisioning did not fully succeed");
            }
        }
    }

    if let Err(e) = store.release_port(lab.id).await {
        warn!(lab_id = %lab.id, error = %e, "failed to release port reservation after failed provisioning");
    }

    if let Err(e) = lab.mark_failed() {
        error!(lab_id = %lab.id, error = %e, "could not transition lab to failed");
        return;
    }
    if let Err(e) = store.update_lab(lab).await {
        error!(lab_id = %lab.id, error = %e, "could not persist failed lab status");
    }
}
