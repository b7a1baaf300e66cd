//! Shared `Settings` fixture for this crate's unit tests.

use std::time::Duration;

use octolab_config::{LogFormat, Settings};

pub fn test_settings(bearer_token: &str) -> Settings {
    Settings {
        database_url: String::new(),
        log_directive: "info".to_string(),
        log_format: LogFormat::Json,
        bind_addr: String::new(),
        bearer_token: bearer_token.to_string(),
        hmac_secret: vec![0u8; 32],
        default_runtime: octolab_domain::Runtime::Container,
        max_active_labs_per_user: 3,
        default_lab_ttl_minutes: 120,
        lab_startup_timeout: Duration::from_secs(1),
        teardown_timeout: Duration::from_secs(1),
        container_health_timeout: Duration::from_millis(50),
        evidence_export_timeout: Duration::from_millis(50),
        evidence_seal_timeout: Duration::from_millis(50),
        novnc_ready_timeout: Duration::from_millis(50),
        novnc_ready_poll: Duration::from_millis(10),
        guac_enabled: false,
        guac_base_url: None,
        guac_admin_user: None,
        guac_admin_password: None,
        guac_encryption_key: None,
        firecracker_bin: "firecracker".to_string(),
        kernel_image: None,
        rootfs_image: None,
        retain_failed_labs: false,
        control_plane_containers: vec![],
        network_rm_retry_count: 3,
        network_rm_backoff: Duration::from_millis(10),
        novnc_port_range_start: 20000,
        novnc_port_range_end: 29999,
        vnc_auth_mode: "password".to_string(),
        compose_bind_host: "127.0.0.1".to_string(),
        microvm_state_root: "/tmp/octolab-api-test".to_string(),
        microvm_agent_timeout: Duration::from_millis(50),
        microvm_compose_timeout: Duration::from_millis(50),
        microvm_boot_timeout: Duration::from_millis(50),
        evidence_max_total_bytes: 1024,
        evidence_max_member_bytes: 1024,
        gateway_http_timeout: Duration::from_millis(50),
    }
}
