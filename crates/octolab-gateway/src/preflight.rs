//! Gateway connectivity preflight classification (spec §4.6).
//!
//! Grounded in `guacamole_preflight.py`: before ever attempting to
//! provision a user/connection, probe the gateway once and classify the
//! failure so `provision_guacamole_for_lab` can raise an actionable
//! message instead of a bare HTTP error.

use std::time::Duration;

use reqwest::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightClassification {
    Ok,
    BaseUrlWrong,
    CredsWrong,
    Server5xx,
    NetworkDown,
    GuiUnreachable,
}

#[derive(Debug, Clone)]
pub struct PreflightResult {
    pub classification: PreflightClassification,
    pub detail: String,
}

/// Probes `base_url`'s language endpoint for basic reachability, then
/// exchanges `admin_user`/`admin_password` for a token to confirm
/// credentials. Never panics; every failure mode is classified.
pub async fn guacamole_preflight(
    http: &reqwest::Client,
    base_url: &str,
    admin_user: &str,
    admin_password: &str,
    timeout: Duration,
) -> PreflightResult {
    let base = base_url.trim_end_matches('/');

    let reachability = http.get(format!("{base}/api/language/en")).timeout(timeout).send().await;
    match reachability {
        Err(e) if e.is_connect() || e.is_timeout() => {
            return PreflightResult { classification: PreflightClassification::NetworkDown, detail: e.to_string() }
        }
        Err(e) => {
            return PreflightResult { classification: PreflightClassification::GuiUnreachable, detail: e.to_string() }
        }
        Ok(resp) if resp.status().is_server_error() => {
            return PreflightResult {
                classification: PreflightClassification::Server5xx,
                detail: format!("status {}", resp.status()),
            }
        }
        Ok(resp) if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND => {
            return PreflightResult {
                classification: PreflightClassification::BaseUrlWrong,
                detail: format!("status {}", resp.status()),
            }
        }
        Ok(_) => {}
    }

    let form = [("username", admin_user), ("password", admin_password)];
    match http.post(format!("{base}/api/tokens")).timeout(timeout).form(&form).send().await {
        Ok(resp) if resp.status().is_success() => {
            PreflightResult { classification: PreflightClassification::Ok, detail: "ok".to_string() }
        }
        Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::FORBIDDEN => {
            PreflightResult { classification: PreflightClassification::CredsWrong, detail: format!("status {}", resp.status()) }
        }
        Ok(resp) if resp.status().is_server_error() => {
            PreflightResult { classification: PreflightClassification::Server5xx, detail: format!("status {}", resp.status()) }
        }
        Ok(resp) => {
            PreflightResult { classification: PreflightClassification::GuiUnreachable, detail: format!("status {}", resp.status()) }
        }
        Err(e) if e.is_connect() || e.is_timeout() => {
            PreflightResult { classification: PreflightClassification::NetworkDown, detail: e.to_string() }
        }
        Err(e) => PreflightResult { classification: PreflightClassification::GuiUnreachable, detail: e.to_string() },
    }
}

/// Per-classification actionable message surfaced to the operator.
pub fn preflight_error_message(result: &PreflightResult) -> String {
    match result.classification {
        PreflightClassification::Ok => "gateway preflight passed".to_string(),
        PreflightClassification::BaseUrlWrong => {
            format!("gateway base URL looks wrong ({}); check OCTOLAB_GUAC_BASE_URL", result.detail)
        }
        PreflightClassification::CredsWrong => {
            "gateway admin credentials were rejected; check OCTOLAB_GUAC_ADMIN_USER/OCTOLAB_GUAC_ADMIN_PASSWORD"
                .to_string()
        }
        PreflightClassification::Server5xx => {
            format!("gateway returned a server error ({}); it may be mid-restart", result.detail)
        }
        PreflightClassification::NetworkDown => {
            format!("could not reach the gateway over the network ({}); check it is running", result.detail)
        }
        PreflightClassification::GuiUnreachable => {
            format!("gateway responded unexpectedly ({}); it may not be Guacamole at this URL", result.detail)
        }
    }
}
