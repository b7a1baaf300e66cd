use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use octolab_domain::OwnerId;

use crate::error::ApiError;
use crate::state::AppState;

/// Trusted owner-identity header. Authentication and user management sit
/// outside this system (spec §1 Non-goals) — whatever sits in front of this
/// API (the gateway, a sidecar) is responsible for populating this header
/// with a verified caller identity before the request reaches us.
pub const OWNER_HEADER: &str = "x-octolab-owner";

/// Marks a request as coming from an operator rather than a lab owner.
/// Only consulted by the evidence preview endpoint.
pub const ADMIN_HEADER: &str = "x-octolab-admin";

/// Reads and parses [`OWNER_HEADER`] as a UUID. Missing or malformed values
/// are a client error, not a silent default — every lab-scoped route needs
/// an owner to scope against.
pub fn extract_owner(headers: &HeaderMap) -> Result<OwnerId, ApiError> {
    let raw = headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request(format!("missing {OWNER_HEADER} header")))?;
    raw.parse::<uuid::Uuid>()
        .map(OwnerId)
        .map_err(|_| ApiError::bad_request(format!("{OWNER_HEADER} must be a UUID")))
}

/// True only when the admin header is present and set to a truthy value.
/// Absence means "not an operator" — there is no implicit admin identity.
pub fn is_admin(headers: &HeaderMap) -> bool {
    headers
        .get(ADMIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Axum middleware that requires a valid `Authorization: Bearer <token>` header.
///
/// Returns 401 for missing, malformed, or incorrect tokens.
/// Applied to all routes — no public endpoints.
pub async fn require_bearer_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == state.settings.bearer_token => next.run(request).await,
        _ => (StatusCode::UNAUTHORIZED, "Unauthorized\n").into_response(),
    }
}
