//! Process-wide configuration, built once at startup from `OCTOLAB_*`
//! environment variables. No module-level mutable state — every caller that
//! needs a setting gets it through an explicit `&Settings` (spec §9, "Global
//! state replaced by explicit configuration").

use std::env;
use std::time::Duration;

use crate::error::ConfigError;

/// Everything the orchestrator, drivers, gateway client, and API need to run.
///
/// | Variable                              | Default        | Meaning |
/// |----------------------------------------|----------------|---------|
/// | `OCTOLAB_DATABASE_URL`                 | required       | Postgres connection string |
/// | `OCTOLAB_LOG`                          | `info`         | `tracing_subscriber::EnvFilter` directive |
/// | `OCTOLAB_LOG_FORMAT`                   | `json`         | `json` or `pretty` |
/// | `OCTOLAB_BIND_ADDR`                    | `0.0.0.0:8080` | HTTP listen address |
/// | `OCTOLAB_BEARER_TOKEN`                 | required       | static bearer token the API accepts |
/// | `OCTOLAB_HMAC_SECRET`                  | required       | evidence-sealing HMAC-SHA256 key |
/// | `OCTOLAB_MAX_ACTIVE_LABS_PER_USER`     | `3`            | per-owner concurrent-lab quota |
/// | `OCTOLAB_DEFAULT_LAB_TTL_MINUTES`      | `120`          | lab lifetime absent an explicit request |
/// | `OCTOLAB_LAB_STARTUP_TIMEOUT_SECONDS`  | `300`          | deadline for the whole provisioning sequence |
/// | `OCTOLAB_TEARDOWN_TIMEOUT_SECONDS`     | `120`          | deadline for the whole teardown sequence |
/// | `OCTOLAB_CONTAINER_HEALTH_TIMEOUT_SECONDS` | `60`       | wait_for_healthy budget |
/// | `OCTOLAB_EVIDENCE_EXPORT_TIMEOUT_SECONDS`  | `60`       | evidence collection budget |
/// | `OCTOLAB_EVIDENCE_SEAL_TIMEOUT_SECONDS` | `30`           | HMAC seal budget |
/// | `OCTOLAB_NOVNC_READY_TIMEOUT_SECONDS`  | `45`           | microVM vsock-agent readiness budget |
/// | `OCTOLAB_NOVNC_READY_POLL_MS`          | `500`          | poll interval for the above |
/// | `OCTOLAB_GUAC_ENABLED`                 | `true`         | whether the gateway integration runs at all |
/// | `OCTOLAB_GUAC_BASE_URL`                | required if enabled | gateway base URL |
/// | `OCTOLAB_GUAC_ADMIN_USER`              | required if enabled | gateway admin username |
/// | `OCTOLAB_GUAC_ADMIN_PASSWORD`          | required if enabled | gateway admin password |
/// | `OCTOLAB_GUAC_ENCRYPTION_KEY`          | required if enabled | 32-byte AES-256-GCM key, base64 |
/// | `OCTOLAB_FIRECRACKER_BIN`              | `firecracker`  | path to the firecracker binary |
/// | `OCTOLAB_KERNEL_IMAGE`                 | required for microvm | vmlinux path |
/// | `OCTOLAB_ROOTFS_IMAGE`                 | required for microvm | base rootfs image path |
/// | `OCTOLAB_RETAIN_FAILED_LABS`           | `false`        | skip cleanup of FAILED container labs for debugging |
/// | `OCTOLAB_CONTROL_PLANE_CONTAINERS`     | empty          | container names (e.g. the gateway's proxy/guacd) allowed to be force-disconnected from a lab network during teardown |
/// | `OCTOLAB_NETWORK_RM_RETRY_COUNT`       | `5`            | retries for the network-removal IN_USE race |
/// | `OCTOLAB_NETWORK_RM_BACKOFF_MS`        | `500`          | base backoff between retries |
/// | `OCTOLAB_NOVNC_PORT_RANGE_START`       | `20000`        | first port in the desktop-portal allocation range |
/// | `OCTOLAB_NOVNC_PORT_RANGE_END`         | `29999`        | last port in the desktop-portal allocation range |
/// | `OCTOLAB_VNC_AUTH_MODE`                | `password`     | `password` or `none` (refused unless bind host is loopback) |
/// | `OCTOLAB_COMPOSE_BIND_HOST`            | `127.0.0.1`    | host interface the desktop's web port binds to |
/// | `OCTOLAB_MICROVM_STATE_ROOT`           | `/var/lib/octolab/microvm` | root directory for per-lab VM state dirs |
/// | `OCTOLAB_MICROVM_AGENT_TIMEOUT_SECONDS`| `10`           | guest-agent `ping`/`diag`/short-verb timeout |
/// | `OCTOLAB_MICROVM_COMPOSE_TIMEOUT_SECONDS` | `360`      | guest-agent `compose_up` timeout (image pulls) |
/// | `OCTOLAB_MICROVM_BOOT_TIMEOUT_SECONDS` | `30`           | budget for the guest agent to answer its first `ping` |
/// | `OCTOLAB_EVIDENCE_MAX_TOTAL_BYTES`     | `524288000`    | safe-extract archive-total size cap (500MiB) |
/// | `OCTOLAB_EVIDENCE_MAX_MEMBER_BYTES`    | `209715200`    | safe-extract per-member size cap (200MiB) |
/// | `OCTOLAB_GATEWAY_HTTP_TIMEOUT_SECONDS` | `30`           | gateway HTTP call timeout |
/// | `OCTOLAB_DEFAULT_RUNTIME`              | `container`    | operator-chosen runtime for new labs (`container`/`microvm`); never client-selectable |
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub log_directive: String,
    pub log_format: LogFormat,
    pub bind_addr: String,
    pub bearer_token: String,
    pub hmac_secret: Vec<u8>,
    pub default_runtime: octolab_domain::Runtime,

    pub max_active_labs_per_user: u32,
    pub default_lab_ttl_minutes: i64,

    pub lab_startup_timeout: Duration,
    pub teardown_timeout: Duration,
    pub container_health_timeout: Duration,
    pub evidence_export_timeout: Duration,
    pub evidence_seal_timeout: Duration,
    pub novnc_ready_timeout: Duration,
    pub novnc_ready_poll: Duration,

    pub guac_enabled: bool,
    pub guac_base_url: Option<String>,
    pub guac_admin_user: Option<String>,
    pub guac_admin_password: Option<String>,
    pub guac_encryption_key: Option<Vec<u8>>,

    pub firecracker_bin: String,
    pub kernel_image: Option<String>,
    pub rootfs_image: Option<String>,

    pub retain_failed_labs: bool,
    pub control_plane_containers: Vec<String>,
    pub network_rm_retry_count: u32,
    pub network_rm_backoff: Duration,

    pub novnc_port_range_start: u16,
    pub novnc_port_range_end: u16,
    pub vnc_auth_mode: String,
    pub compose_bind_host: String,

    pub microvm_state_root: String,
    pub microvm_agent_timeout: Duration,
    pub microvm_compose_timeout: Duration,
    pub microvm_boot_timeout: Duration,

    pub evidence_max_total_bytes: u64,
    pub evidence_max_member_bytes: u64,

    pub gateway_http_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Settings {
    /// Reads the whole `OCTOLAB_*` surface from the process environment.
    /// Called exactly once, at startup, by `octolab-cli`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let hmac_secret = required("OCTOLAB_HMAC_SECRET")?.into_bytes();
        let guac_enabled = bool_var("OCTOLAB_GUAC_ENABLED", true)?;

        let (guac_base_url, guac_admin_user, guac_admin_password, guac_encryption_key) =
            if guac_enabled {
                (
                    Some(required("OCTOLAB_GUAC_BASE_URL")?),
                    Some(required("OCTOLAB_GUAC_ADMIN_USER")?),
                    Some(required("OCTOLAB_GUAC_ADMIN_PASSWORD")?),
                    Some(decode_b64("OCTOLAB_GUAC_ENCRYPTION_KEY", &required("OCTOLAB_GUAC_ENCRYPTION_KEY")?)?),
                )
            } else {
                (None, None, None, None)
            };

        Ok(Settings {
            database_url: required("OCTOLAB_DATABASE_URL")?,
            log_directive: optional("OCTOLAB_LOG", "info"),
            log_format: match optional("OCTOLAB_LOG_FORMAT", "json").as_str() {
                "pretty" => LogFormat::Pretty,
                _ => LogFormat::Json,
            },
            bind_addr: optional("OCTOLAB_BIND_ADDR", "0.0.0.0:8080"),
            bearer_token: required("OCTOLAB_BEARER_TOKEN")?,
            hmac_secret,
            default_runtime: runtime_var("OCTOLAB_DEFAULT_RUNTIME", octolab_domain::Runtime::Container)?,

            max_active_labs_per_user: int_var("OCTOLAB_MAX_ACTIVE_LABS_PER_USER", 3)?,
            default_lab_ttl_minutes: int_var("OCTOLAB_DEFAULT_LAB_TTL_MINUTES", 120)?,

            lab_startup_timeout: secs("OCTOLAB_LAB_STARTUP_TIMEOUT_SECONDS", 300)?,
            teardown_timeout: secs("OCTOLAB_TEARDOWN_TIMEOUT_SECONDS", 120)?,
            container_health_timeout: secs("OCTOLAB_CONTAINER_HEALTH_TIMEOUT_SECONDS", 60)?,
            evidence_export_timeout: secs("OCTOLAB_EVIDENCE_EXPORT_TIMEOUT_SECONDS", 60)?,
            evidence_seal_timeout: secs("OCTOLAB_EVIDENCE_SEAL_TIMEOUT_SECONDS", 30)?,
            novnc_ready_timeout: secs("OCTOLAB_NOVNC_READY_TIMEOUT_SECONDS", 45)?,
            novnc_ready_poll: millis("OCTOLAB_NOVNC_READY_POLL_MS", 500)?,

            guac_enabled,
            guac_base_url,
            guac_admin_user,
            guac_admin_password,
            guac_encryption_key,

            firecracker_bin: optional("OCTOLAB_FIRECRACKER_BIN", "firecracker"),
            kernel_image: env::var("OCTOLAB_KERNEL_IMAGE").ok(),
            rootfs_image: env::var("OCTOLAB_ROOTFS_IMAGE").ok(),

            retain_failed_labs: bool_var("OCTOLAB_RETAIN_FAILED_LABS", false)?,
            control_plane_containers: list_var("OCTOLAB_CONTROL_PLANE_CONTAINERS"),
            network_rm_retry_count: int_var("OCTOLAB_NETWORK_RM_RETRY_COUNT", 5)?,
            network_rm_backoff: millis("OCTOLAB_NETWORK_RM_BACKOFF_MS", 500)?,

            novnc_port_range_start: port_var("OCTOLAB_NOVNC_PORT_RANGE_START", 20000)?,
            novnc_port_range_end: port_var("OCTOLAB_NOVNC_PORT_RANGE_END", 29999)?,
            vnc_auth_mode: optional("OCTOLAB_VNC_AUTH_MODE", "password"),
            compose_bind_host: optional("OCTOLAB_COMPOSE_BIND_HOST", "127.0.0.1"),

            microvm_state_root: optional("OCTOLAB_MICROVM_STATE_ROOT", "/var/lib/octolab/microvm"),
            microvm_agent_timeout: secs("OCTOLAB_MICROVM_AGENT_TIMEOUT_SECONDS", 10)?,
            microvm_compose_timeout: secs("OCTOLAB_MICROVM_COMPOSE_TIMEOUT_SECONDS", 360)?,
            microvm_boot_timeout: secs("OCTOLAB_MICROVM_BOOT_TIMEOUT_SECONDS", 30)?,

            evidence_max_total_bytes: int_var("OCTOLAB_EVIDENCE_MAX_TOTAL_BYTES", 524_288_000)? as u64,
            evidence_max_member_bytes: int_var("OCTOLAB_EVIDENCE_MAX_MEMBER_BYTES", 209_715_200)? as u64,

            gateway_http_timeout: secs("OCTOLAB_GATEWAY_HTTP_TIMEOUT_SECONDS", 30)?,
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::MissingVar(var))
}

fn optional(var: &'static str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

fn bool_var(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                var,
                message: format!("expected a boolean, got '{}'", other),
            }),
        },
    }
}

fn int_var(var: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            var,
            message: format!("expected an integer, got '{}'", v),
        }),
    }
}

fn runtime_var(var: &'static str, default: octolab_domain::Runtime) -> Result<octolab_domain::Runtime, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "container" => Ok(octolab_domain::Runtime::Container),
            "microvm" => Ok(octolab_domain::Runtime::MicroVm),
            other => Err(ConfigError::InvalidValue {
                var,
                message: format!("expected 'container' or 'microvm', got '{}'", other),
            }),
        },
    }
}

fn port_var(var: &'static str, default: u16) -> Result<u16, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            var,
            message: format!("expected a port number, got '{}'", v),
        }),
    }
}

fn secs(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(Duration::from_secs(default)),
        Ok(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue {
                var,
                message: format!("expected seconds as an integer, got '{}'", v),
            }),
    }
}

fn millis(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(Duration::from_millis(default)),
        Ok(v) => v
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidValue {
                var,
                message: format!("expected milliseconds as an integer, got '{}'", v),
            }),
    }
}

fn list_var(var: &'static str) -> Vec<String> {
    env::var(var)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn decode_b64(var: &'static str, raw: &str) -> Result<Vec<u8>, ConfigError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|e| ConfigError::InvalidValue {
            var,
            message: format!("not valid base64: {}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_guac_vars() {
        for var in [
            "OCTOLAB_GUAC_ENABLED",
            "OCTOLAB_GUAC_BASE_URL",
            "OCTOLAB_GUAC_ADMIN_USER",
            "OCTOLAB_GUAC_ADMIN_PASSWORD",
            "OCTOLAB_GUAC_ENCRYPTION_KEY",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    fn missing_required_var_is_reported_by_name() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("OCTOLAB_DATABASE_URL");
        clear_guac_vars();
        env::set_var("OCTOLAB_BEARER_TOKEN", "t");
        env::set_var("OCTOLAB_HMAC_SECRET", "s");
        env::set_var("OCTOLAB_GUAC_ENABLED", "false");
        let err = Settings::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("OCTOLAB_DATABASE_URL")));
        env::remove_var("OCTOLAB_BEARER_TOKEN");
        env::remove_var("OCTOLAB_HMAC_SECRET");
        clear_guac_vars();
    }

    #[test]
    fn guac_disabled_does_not_require_guac_vars() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_guac_vars();
        env::set_var("OCTOLAB_GUAC_ENABLED", "false");
        env::set_var("OCTOLAB_DATABASE_URL", "postgres://x");
        env::set_var("OCTOLAB_BEARER_TOKEN", "t");
        env::set_var("OCTOLAB_HMAC_SECRET", "s");
        let settings = Settings::from_env().expect("should not need guac vars");
        assert!(!settings.guac_enabled);
        assert!(settings.guac_base_url.is_none());
        env::remove_var("OCTOLAB_DATABASE_URL");
        env::remove_var("OCTOLAB_BEARER_TOKEN");
        env::remove_var("OCTOLAB_HMAC_SECRET");
        clear_guac_vars();
    }

    #[test]
    fn invalid_bool_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_guac_vars();
        env::set_var("OCTOLAB_DATABASE_URL", "postgres://x");
        env::set_var("OCTOLAB_BEARER_TOKEN", "t");
        env::set_var("OCTOLAB_HMAC_SECRET", "s");
        env::set_var("OCTOLAB_GUAC_ENABLED", "maybe");
        let err = Settings::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: "OCTOLAB_GUAC_ENABLED", .. }));
        env::remove_var("OCTOLAB_DATABASE_URL");
        env::remove_var("OCTOLAB_BEARER_TOKEN");
        env::remove_var("OCTOLAB_HMAC_SECRET");
        clear_guac_vars();
    }
}
