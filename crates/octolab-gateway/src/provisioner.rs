//! Per-lab gateway provisioning and teardown (spec §4.6).
//!
//! Grounded in `guacamole_provisioner.py`. Provisioning is strict: a
//! preflight or REST failure here is fatal to lab provisioning and must
//! propagate, unlike every other best-effort integration in this crate.
//! Teardown is the opposite posture — every step is best-effort, since a
//! half-gone gateway must never block a lab from finishing its lifecycle.

use std::time::Duration;

use octolab_config::Settings;
use octolab_domain::{Lab, LabId, Runtime};
use tracing::{info, warn};

use crate::client::GuacClient;
use crate::crypto::decrypt_password;
use crate::error::GatewayError;
use crate::preflight::{guacamole_preflight, preflight_error_message, PreflightClassification};

/// The full container name Guacamole must dial for a container-runtime
/// lab. `guacd` may be attached to several lab networks at once, so the
/// bare compose service name ("octobox") is ambiguous over DNS; the full
/// compose container name is not.
pub fn octobox_hostname(lab_id: &LabId) -> String {
    format!("octolab_{}-octobox-1", lab_id.0)
}

pub fn guac_username(lab_id: &LabId) -> String {
    format!("lab_{}", lab_id.short())
}

pub fn guac_connection_name(lab_id: &LabId) -> String {
    format!("octolab-{}", lab_id.short())
}

const OCTOBOX_VNC_PORT: u16 = 5900;
const DOCKER_HOST_GATEWAY_IP: &str = "172.17.0.1";

pub struct ProvisionOutcome {
    pub connection_id: String,
    pub username: String,
    pub connection_url: String,
}

/// Provisions a Guacamole user, VNC connection, and permission grant for
/// `lab`. A no-op returning `Err(GatewayError::Disabled)` is never raised
/// by this function directly — callers check `settings.guac_enabled`
/// first and skip the call entirely, matching `provision_lab`'s own
/// branching in the orchestrator.
pub async fn provision_guacamole_for_lab(settings: &Settings, lab: &Lab) -> Result<ProvisionOutcome, GatewayError> {
    let base_url = settings.guac_base_url.as_deref().ok_or(GatewayError::Disabled)?;
    let admin_user = settings.guac_admin_user.as_deref().ok_or(GatewayError::Disabled)?;
    let admin_password = settings.guac_admin_password.as_deref().ok_or(GatewayError::Disabled)?;
    let encryption_key = settings.guac_encryption_key.as_deref().ok_or(GatewayError::Disabled)?;

    let vnc_password_enc = lab
        .gateway_password_enc
        .as_deref()
        .ok_or_else(|| GatewayError::Internal("lab has no gateway password set before gateway provisioning".to_string()))?;
    let vnc_password = decrypt_password(encryption_key, vnc_password_enc)?;

    let probe_http = reqwest::Client::new();
    let preflight =
        guacamole_preflight(&probe_http, base_url, admin_user, admin_password, settings.gateway_http_timeout).await;
    if preflight.classification != PreflightClassification::Ok {
        return Err(GatewayError::PreflightFailed(preflight_error_message(&preflight)));
    }

    let is_microvm = lab.runtime == Runtime::MicroVm;
    let (hostname, port) = if is_microvm {
        let vnc_host = lab
            .runtime_meta
            .get("vnc_host")
            .and_then(|v| v.as_str())
            .unwrap_or(DOCKER_HOST_GATEWAY_IP)
            .to_string();
        let vnc_port = lab
            .runtime_meta
            .get("vnc_port")
            .and_then(|v| v.as_u64())
            .map(|p| p as u16)
            .or(lab.novnc_host_port)
            .unwrap_or(OCTOBOX_VNC_PORT);
        (vnc_host, vnc_port)
    } else {
        (octobox_hostname(&lab.id), OCTOBOX_VNC_PORT)
    };

    let client = GuacClient::new(base_url.to_string(), settings.gateway_http_timeout);
    let session = client.login_admin(admin_user, admin_password).await?;

    let username = guac_username(&lab.id);
    client.create_user(&session, &username, &vnc_password).await?;

    let connection_name = guac_connection_name(&lab.id);
    let connection = client.create_connection(&session, &connection_name, &hostname, port, &vnc_password).await?;
    client.grant_connection_permission(&session, &username, &connection.identifier).await?;

    if !is_microvm {
        connect_guacd_to_lab(settings, &lab.id).await;
        preflight_netcheck(&hostname, port, settings.gateway_http_timeout).await;
    }

    Ok(ProvisionOutcome {
        connection_id: connection.identifier,
        username,
        connection_url: format!("/labs/{}/connect", lab.id),
    })
}

pub struct TeardownOutcome {
    pub all_succeeded: bool,
}

/// Best-effort reversal of [`provision_guacamole_for_lab`]. Never raises:
/// every step that can fail is logged and folded into `all_succeeded`
/// rather than propagated, since a gateway outage must not block lab
/// teardown.
pub async fn teardown_guacamole_for_lab(settings: &Settings, lab: &Lab) -> TeardownOutcome {
    if !settings.guac_enabled {
        return TeardownOutcome { all_succeeded: true };
    }
    if lab.gateway_connection_id.is_none() && lab.gateway_user_id.is_none() {
        return TeardownOutcome { all_succeeded: true };
    }

    let mut all_succeeded = true;

    if lab.runtime != Runtime::MicroVm {
        all_succeeded &= disconnect_guacd_from_lab(settings, &lab.id).await;
    }

    let (Some(base_url), Some(admin_user), Some(admin_password)) =
        (settings.guac_base_url.as_deref(), settings.guac_admin_user.as_deref(), settings.guac_admin_password.as_deref())
    else {
        return TeardownOutcome { all_succeeded: false };
    };

    let client = GuacClient::new(base_url.to_string(), settings.gateway_http_timeout);
    if !client.health_check().await {
        warn!(lab_id = %lab.id, "gateway unreachable during teardown, leaving user/connection for manual cleanup");
        return TeardownOutcome { all_succeeded: false };
    }

    let session = match client.login_admin(admin_user, admin_password).await {
        Ok(s) => s,
        Err(e) => {
            warn!(lab_id = %lab.id, error = %e, "gateway admin login failed during teardown");
            return TeardownOutcome { all_succeeded: false };
        }
    };

    if let Some(connection_id) = lab.gateway_connection_id.as_deref() {
        if let Err(e) = client.delete_connection(&session, connection_id).await {
            warn!(lab_id = %lab.id, error = %e, "failed to delete gateway connection");
            all_succeeded = false;
        }
    }
    if let Some(username) = lab.gateway_user_id.as_deref() {
        if let Err(e) = client.delete_user(&session, username).await {
            warn!(lab_id = %lab.id, error = %e, "failed to delete gateway user");
            all_succeeded = false;
        }
    }

    TeardownOutcome { all_succeeded }
}

/// Attaches every configured control-plane container (typically `guacd`)
/// to the lab's network so it can dial the desktop container directly.
/// Best-effort: a single failed attach is logged, not raised.
async fn connect_guacd_to_lab(settings: &Settings, lab_id: &LabId) -> bool {
    let network = octolab_domain::naming::lab_net_name(lab_id);
    let mut ok = true;
    for container in &settings.control_plane_containers {
        if !octolab_driver::container::connect_container_to_network(container, &network, None).await {
            warn!(lab_id = %lab_id, container, network, "failed to connect control-plane container to lab network");
            ok = false;
        }
    }
    ok
}

async fn disconnect_guacd_from_lab(settings: &Settings, lab_id: &LabId) -> bool {
    let network = octolab_domain::naming::lab_net_name(lab_id);
    let mut ok = true;
    for container in &settings.control_plane_containers {
        if !octolab_driver::container::disconnect_container_from_network(container, &network).await {
            ok = false;
        }
    }
    ok
}

/// Confirms the gateway's `guacd` can actually reach the freshly attached
/// lab network by opening a raw TCP connection to the VNC port — logged
/// only, since a failure here does not block provisioning (the connection
/// itself has already been created and may still heal once the network
/// settles).
async fn preflight_netcheck(hostname: &str, port: u16, timeout: Duration) {
    let addr = format!("{hostname}:{port}");
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => info!(addr, "gateway netcheck: reachable"),
        Ok(Err(e)) => warn!(addr, error = %e, "gateway netcheck: connection refused"),
        Err(_) => warn!(addr, "gateway netcheck: timed out"),
    }
}
