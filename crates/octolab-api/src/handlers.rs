use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use octolab_domain::{EvidenceSealStatus, LabId, LabIntent, LabStatus, Recipe, RecipeId, Runtime};
use octolab_evidence::EvidenceError;
use octolab_store::LabStore;

use crate::auth::{extract_owner, is_admin};
use crate::error::ApiError;
use crate::state::AppState;

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn ready(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    // A cheap store round-trip, just to confirm the backing database (or
    // in-memory store) actually answers before a load balancer sends traffic.
    state.store.count_active_labs_for_owner(octolab_domain::OwnerId(Uuid::nil())).await?;
    Ok(StatusCode::OK)
}

// ── Labs ──────────────────────────────────────────────────────────────────────

/// Admits a lab request and returns immediately with the `Requested` row;
/// provisioning runs in the background (spec §4.1, §4.4). The runtime is
/// always the operator's configured default here — it is never accepted
/// from the client (spec §6).
pub async fn create_lab(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(intent): Json<LabIntent>,
) -> Result<impl IntoResponse, ApiError> {
    let owner_id = extract_owner(&headers)?;
    let runtime = state.settings.default_runtime;

    let lab = octolab_orchestrator::create_lab(
        state.store.as_ref(),
        state.recipes.as_ref(),
        &state.settings,
        owner_id,
        intent,
        runtime,
    )
    .await?;

    tokio::spawn(octolab_orchestrator::provision_lab(
        state.store.clone(),
        state.drivers.clone(),
        state.recipes.clone(),
        state.settings.clone(),
        lab.id,
    ));

    Ok((StatusCode::ACCEPTED, Json(json!(lab))))
}

pub async fn list_labs(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, ApiError> {
    let owner_id = extract_owner(&headers)?;
    let labs = state.store.list_labs_for_owner(owner_id).await?;
    Ok(Json(json!(labs)))
}

pub async fn get_lab(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let lab = fetch_owned_lab(&state, &headers, id).await?;
    let lab = octolab_orchestrator::reconcile_lab_on_read(state.store.as_ref(), &state.settings, lab).await?;
    Ok(Json(json!(lab)))
}

/// Requests teardown of a lab (spec §4.1). Idempotent while the lab is
/// still ENDING; an already-terminal lab is a conflict rather than a
/// silent success, since the caller's request cannot possibly be honored.
pub async fn end_lab(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let lab = fetch_owned_lab(&state, &headers, id).await?;
    if lab.status.is_terminal() {
        return Err(ApiError::conflict("lab has already finished"));
    }
    let lab = octolab_orchestrator::request_teardown(state.store.as_ref(), lab).await?;
    Ok(Json(json!(lab)))
}

/// Returns the gateway (or direct) URL as JSON, for clients that want to
/// open it themselves.
pub async fn connect_lab(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let lab = fetch_owned_lab(&state, &headers, id).await?;
    let url = connectable_url(&lab)?;
    Ok(Json(json!({ "redirect_url": url })))
}

/// Same gate as [`connect_lab`], but issues an actual HTTP redirect — for a
/// browser following the link directly.
pub async fn connect_lab_redirect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Redirect, ApiError> {
    let lab = fetch_owned_lab(&state, &headers, id).await?;
    let url = connectable_url(&lab)?;
    Ok(Redirect::temporary(&url))
}

fn connectable_url(lab: &octolab_domain::Lab) -> Result<String, ApiError> {
    if !lab.status.is_connectable() {
        return Err(ApiError::conflict(format!("lab is not connectable in status {}", lab.status)));
    }
    lab.connection_url
        .clone()
        .ok_or_else(|| ApiError::internal("lab has no connection url despite being connectable"))
}

/// Owner-scoped fetch shared by every `/labs/:id...` route: a lab that
/// doesn't exist and a lab owned by someone else look identical to the
/// caller, both returning 404 (spec §6 anti-enumeration).
async fn fetch_owned_lab(
    state: &AppState,
    headers: &HeaderMap,
    id: Uuid,
) -> Result<octolab_domain::Lab, ApiError> {
    let owner_id = extract_owner(headers)?;
    state
        .store
        .get_lab_for_owner(LabId(id), owner_id)
        .await?
        .ok_or_else(|| ApiError::not_found("lab not found"))
}

// ── Evidence ──────────────────────────────────────────────────────────────────

/// Reports lab-row seal status plus a best-effort `artifacts.<kind>.present`
/// map (spec §8 scenario S1: `terminal_logs.present=true`/`pcap.present=true`).
/// The latter is computed by actually enumerating the evidence volumes —
/// like [`evidence_bundle`], it never trusts a stored flag for what's
/// currently in them — and is left empty (all kinds `present: false`) rather
/// than failing the whole request if the volumes aren't reachable yet.
pub async fn evidence_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let lab = fetch_owned_lab(&state, &headers, id).await?;
    let lab = octolab_orchestrator::reconcile_lab_on_read(state.store.as_ref(), &state.settings, lab).await?;

    let artifacts = if matches!(lab.status, LabStatus::Ready | LabStatus::Degraded | LabStatus::Finished) {
        match tempfile::tempdir() {
            Ok(tmp) => match octolab_evidence::enumerate_bundle_entries(
                &lab.evidence_auth_volume,
                Some(&lab.evidence_user_volume),
                tmp.path(),
                state.settings.evidence_max_total_bytes,
                state.settings.evidence_max_member_bytes,
                state.settings.evidence_seal_timeout,
            )
            .await
            {
                Ok(entries) => {
                    let keys: Vec<String> = entries.into_iter().map(|e| e.manifest_key).collect();
                    octolab_evidence::build_artifact_presence(&keys)
                }
                Err(_) => octolab_evidence::build_artifact_presence(&[]),
            },
            Err(_) => octolab_evidence::build_artifact_presence(&[]),
        }
    } else {
        octolab_evidence::build_artifact_presence(&[])
    };

    Ok(Json(json!({
        "lab_id": lab.id,
        "evidence_state": lab.evidence_state,
        "evidence_seal_status": lab.evidence_seal_status,
        "evidence_manifest_sha256": lab.evidence_manifest_sha256,
        "evidence_sealed_at": lab.evidence_sealed_at,
        "evidence_expires_at": lab.evidence_expires_at,
        "artifacts": artifacts,
    })))
}

/// Best-effort bundle of whatever evidence currently exists, available any
/// time a lab is reachable or has just finished (spec §4.5) — unlike
/// [`evidence_verified_bundle`], this never requires or checks a seal.
pub async fn evidence_bundle(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let lab = fetch_owned_lab(&state, &headers, id).await?;
    if !matches!(lab.status, LabStatus::Ready | LabStatus::Degraded | LabStatus::Finished) {
        return Err(ApiError::conflict(format!("evidence is not available in status {}", lab.status)));
    }

    let bundle = octolab_evidence::build_unverified_evidence_bundle(
        &lab.evidence_auth_volume,
        Some(&lab.evidence_user_volume),
        &lab.id.to_string(),
        true,
        state.settings.evidence_max_total_bytes,
        state.settings.evidence_max_member_bytes,
        state.settings.evidence_seal_timeout,
    )
    .await?;

    Ok(zip_response(&lab.id, bundle.zip, "bundle"))
}

/// The sealed, HMAC-verified bundle — only available once a lab has
/// finished and its evidence successfully sealed (spec §4.5, §8 S3).
pub async fn evidence_verified_bundle(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let lab = fetch_owned_lab(&state, &headers, id).await?;
    if lab.status != LabStatus::Finished {
        return Err(ApiError::conflict("verified evidence is only available once a lab has finished"));
    }
    if lab.evidence_seal_status != EvidenceSealStatus::Sealed {
        return Err(EvidenceError::NotSealed.into());
    }

    let zip = octolab_evidence::build_verified_evidence_bundle(
        &lab.evidence_auth_volume,
        Some(&lab.evidence_user_volume),
        &state.settings.hmac_secret,
        true,
        state.settings.evidence_max_total_bytes,
        state.settings.evidence_max_member_bytes,
        state.settings.evidence_seal_timeout,
    )
    .await?;

    Ok(zip_response(&lab.id, zip, "verified"))
}

/// Operator-only: lists exactly which files are present in a lab's
/// evidence volumes without verifying or downloading them. Never owner
/// scoped (an operator may inspect any lab), but gated on the admin header
/// instead — absence of that header reads as "not found" rather than
/// "forbidden", since confirming a lab id exists at all is itself
/// information this route should not leak to a non-operator caller.
pub async fn evidence_preview(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    if !is_admin(&headers) {
        return Err(ApiError::not_found("lab not found"));
    }
    let lab = state
        .store
        .get_lab(LabId(id))
        .await?
        .ok_or_else(|| ApiError::not_found("lab not found"))?;

    let tmp = tempfile::tempdir().map_err(|e| ApiError::internal(format!("allocating scratch dir: {e}")))?;
    let entries = octolab_evidence::enumerate_bundle_entries(
        &lab.evidence_auth_volume,
        Some(&lab.evidence_user_volume),
        tmp.path(),
        state.settings.evidence_max_total_bytes,
        state.settings.evidence_max_member_bytes,
        state.settings.evidence_seal_timeout,
    )
    .await?;
    let files: Vec<String> = entries.into_iter().map(|e| e.manifest_key).collect();

    Ok(Json(json!({ "lab_id": lab.id, "files": files })))
}

fn zip_response(lab_id: &LabId, bytes: Vec<u8>, kind: &str) -> Response {
    let filename = format!("lab-{lab_id}-{kind}.zip");
    (
        StatusCode::OK,
        [
            (axum::http::header::CONTENT_TYPE, "application/zip".to_string()),
            (axum::http::header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ],
        bytes,
    )
        .into_response()
}

// ── Deploy from Dockerfile ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DeployFromDockerfileBody {
    pub dockerfile: String,
    #[serde(default)]
    pub files: HashMap<String, String>,
    #[serde(default)]
    pub exploit_family: Option<String>,
}

/// Builds and lints a caller-submitted Dockerfile, then admits a lab whose
/// recipe is synthesized on the fly rather than drawn from the catalog
/// (spec §6). Always forced onto the microVM runtime, regardless of the
/// operator's configured default, since a custom image is never let loose
/// inside the shared container fleet.
pub async fn deploy_from_dockerfile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DeployFromDockerfileBody>,
) -> Result<impl IntoResponse, ApiError> {
    let owner_id = extract_owner(&headers)?;

    octolab_driver::dockerfile::validate_dockerfile_source(&body.dockerfile).map_err(ApiError::bad_request)?;
    octolab_driver::dockerfile::validate_build_context(&body.files).map_err(ApiError::bad_request)?;

    let exposed_ports = octolab_driver::dockerfile::parse_exposed_ports(&body.dockerfile);

    let build_dir =
        tempfile::tempdir().map_err(|e| ApiError::internal(format!("allocating build context dir: {e}")))?;
    let image_tag = format!("octolab-dockerfile-{}", Uuid::new_v4().simple());
    let build = octolab_driver::dockerfile::build_image(
        build_dir.path(),
        &body.dockerfile,
        &body.files,
        &image_tag,
        state.settings.microvm_compose_timeout,
    )
    .await?;

    let recipe = Recipe {
        id: RecipeId(Uuid::new_v4()),
        name: format!("dockerfile:{}", build.image_tag),
        software: "custom-dockerfile".to_string(),
        version_constraint: None,
        exploit_family: body.exploit_family.clone(),
        is_active: true,
    };

    let requested_intent = json!({
        "source": "dockerfile",
        "image_tag": build.image_tag,
        "exposed_ports": exposed_ports,
        "build_log": build.log,
    });

    let lab = octolab_orchestrator::create_lab_with_recipe(
        state.store.as_ref(),
        &state.settings,
        owner_id,
        &recipe,
        Runtime::MicroVm,
        Some(requested_intent),
    )
    .await?;

    tokio::spawn(octolab_orchestrator::provision_lab_with_recipe(
        state.store.clone(),
        state.drivers.clone(),
        state.settings.clone(),
        lab.id,
        recipe,
    ));

    Ok((StatusCode::ACCEPTED, Json(json!(lab))))
}
