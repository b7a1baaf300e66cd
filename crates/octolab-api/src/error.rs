use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use octolab_driver::DriverError;
use octolab_evidence::EvidenceError;
use octolab_gateway::GatewayError;
use octolab_orchestrator::OrchestratorError;
use octolab_store::StoreError;

pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    pub fn unprocessable(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::UNPROCESSABLE_ENTITY, message: msg.into() }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::CONFLICT, message: msg.into() }
    }

    /// Every lab-scoped lookup that fails owner scoping returns 404, never
    /// 403 — spec §6 "never 403, to avoid enumeration".
    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::NOT_FOUND, message: msg.into() }
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::SERVICE_UNAVAILABLE, message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::INTERNAL_SERVER_ERROR, message: msg.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LabNotFound(_) | StoreError::ReservationNotFound(_) => ApiError::not_found(e.to_string()),
            StoreError::PortRangeExhausted => ApiError::service_unavailable(e.to_string()),
            _ => ApiError::internal(e.to_string()),
        }
    }
}

/// Maps the lifecycle-entrypoint errors onto the client-facing kinds of
/// spec §7: quota/validation become 400, pool exhaustion and a missing
/// recipe are reported distinctly, and anything driver/gateway/evidence
/// related defers to that crate's own mapping.
impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::QuotaExceeded => ApiError::bad_request(e.to_string()),
            OrchestratorError::RecipeNotFound => ApiError::bad_request(e.to_string()),
            OrchestratorError::LabNotFound(_) => ApiError::not_found("lab not found"),
            OrchestratorError::Domain(_) => ApiError::bad_request(e.to_string()),
            OrchestratorError::Store(inner) => inner.into(),
            OrchestratorError::Driver(inner) => inner.into(),
            OrchestratorError::Evidence(inner) => inner.into(),
            OrchestratorError::Gateway(inner) => inner.into(),
            OrchestratorError::Config(_) | OrchestratorError::Internal(_) => ApiError::internal(e.to_string()),
            OrchestratorError::ProvisionTimeout(_) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<DriverError> for ApiError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::PoolExhausted | DriverError::PortCollision(_) => ApiError::service_unavailable(e.to_string()),
            DriverError::CleanupBlocked(_) => ApiError::conflict(e.to_string()),
            DriverError::StaleImage(_) => ApiError::unprocessable(e.to_string()),
            DriverError::Timeout(_) => ApiError::service_unavailable(e.to_string()),
            DriverError::InvalidName(_) => ApiError::bad_request(e.to_string()),
            DriverError::RuntimeError(_) => ApiError::unprocessable(e.to_string()),
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Disabled => ApiError::bad_request(e.to_string()),
            GatewayError::PreflightFailed(_) | GatewayError::AuthFailed | GatewayError::Http(_) => {
                ApiError::service_unavailable(e.to_string())
            }
            _ => ApiError::internal(e.to_string()),
        }
    }
}

/// Tampering (`422`) and not-sealed (`409`) are the two evidence error
/// kinds spec §7 and §8 scenario S3 call out by status code; everything
/// else is an internal failure of the extraction/sealing machinery.
impl From<EvidenceError> for ApiError {
    fn from(e: EvidenceError) -> Self {
        match e {
            EvidenceError::NotSealed => ApiError::conflict("evidence is not sealed for this lab"),
            EvidenceError::VerificationFailed(reason) => {
                ApiError::unprocessable(format!("Verification failed: {reason}"))
            }
            _ => ApiError::internal(e.to_string()),
        }
    }
}
