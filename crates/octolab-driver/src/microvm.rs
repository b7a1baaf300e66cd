//! MicroVM isolation runtime: one Firecracker VM per lab, its own kernel,
//! Docker running inside the guest to bring up the lab stack (spec §4.4).
//!
//! Grounded in `firecracker_runtime.py`'s `FirecrackerLabRuntime`: preflight
//! checks before first use, TAP + NAT network setup per lab, VM boot,
//! guest-agent ping with stale-rootfs detection, `configure_network`,
//! compose-bundle upload, `compose_up`, and a teardown sequence that is
//! best-effort on the guest side but unconditional on the host side (kill
//! the VM process, tear down the TAP device, remove the state directory) —
//! there is no fallback to the container runtime on any failure here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use octolab_config::Settings;
use octolab_domain::{naming, Lab, Recipe};
use tracing::{error, info, warn};

use crate::driver::{CreateOutcome, RuntimeDriver, TeardownReport};
use crate::error::DriverError;
use crate::guest_agent::send_command;
use crate::redact::{redact_text, truncate_text};
use crate::subprocess::run;

/// Bound on the diag excerpt folded into a `compose_up` failure so a
/// chatty agent can't blow up the error body or logs (spec §4.4 step 6).
const DIAG_EXCERPT_MAX_LEN: usize = 2048;

const VNC_GUEST_PORT: u16 = 5900;
const DOCKER_HOST_GATEWAY_IP: &str = "172.17.0.1";

pub struct MicroVmDriver {
    settings: Arc<Settings>,
}

impl MicroVmDriver {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    fn preflight(&self) -> Result<(String, String), DriverError> {
        let kernel = self
            .settings
            .kernel_image
            .clone()
            .ok_or_else(|| DriverError::RuntimeError("OCTOLAB_KERNEL_IMAGE is not configured".to_string()))?;
        let rootfs = self
            .settings
            .rootfs_image
            .clone()
            .ok_or_else(|| DriverError::RuntimeError("OCTOLAB_ROOTFS_IMAGE is not configured".to_string()))?;
        Ok((kernel, rootfs))
    }

    fn state_dir(&self, lab: &Lab) -> PathBuf {
        Path::new(&self.settings.microvm_state_root).join(lab.id.to_string())
    }

    fn vsock_path(&self, lab: &Lab) -> PathBuf {
        self.state_dir(lab).join("vsock.sock")
    }

    fn pid_path(&self, lab: &Lab) -> PathBuf {
        self.state_dir(lab).join("firecracker.pid")
    }

    fn tap_name(&self, lab: &Lab) -> String {
        naming::tap_name(&lab.id)
    }

    /// Deterministic /24 guest subnet derived only from the lab id — two
    /// labs never collide because the id itself is unique, and nothing
    /// here accepts caller input.
    fn guest_network(&self, lab: &Lab) -> (String, String, String) {
        let bytes = lab.id.0.as_bytes();
        let b2 = bytes[0];
        let b3 = bytes[1];
        let gateway = format!("10.{b2}.{b3}.1");
        let guest_ip = format!("10.{b2}.{b3}.2");
        (gateway, guest_ip, "255.255.255.0".to_string())
    }

    fn comment_tag(&self, lab: &Lab) -> String {
        format!("octolab_{}", self.tap_name(lab))
    }

    async fn setup_network(&self, lab: &Lab) -> Result<(), DriverError> {
        let tap = self.tap_name(lab);
        let (gateway, _, _) = self.guest_network(lab);
        let tag = self.comment_tag(lab);

        run_ok("ip", &["tuntap", "add", "dev", &tap, "mode", "tap"]).await?;
        run_ok("ip", &["addr", "add", &format!("{gateway}/24"), "dev", &tap]).await?;
        run_ok("ip", &["link", "set", &tap, "up"]).await?;
        run_ok(
            "iptables",
            &["-t", "nat", "-A", "POSTROUTING", "-s", &format!("{gateway}/24"), "-j", "MASQUERADE", "-m", "comment", "--comment", &tag],
        )
        .await?;
        run_ok("iptables", &["-A", "FORWARD", "-i", &tap, "-j", "ACCEPT", "-m", "comment", "--comment", &tag]).await?;
        Ok(())
    }

    async fn setup_port_forward(&self, lab: &Lab, host_port: u16, guest_ip: &str) -> Result<(), DriverError> {
        let tag = self.comment_tag(lab);
        run_ok(
            "iptables",
            &[
                "-t", "nat", "-A", "PREROUTING", "-p", "tcp", "--dport", &host_port.to_string(),
                "-j", "DNAT", "--to-destination", &format!("{guest_ip}:{VNC_GUEST_PORT}"),
                "-m", "comment", "--comment", &tag,
            ],
        )
        .await
    }

    async fn cleanup_network(&self, lab: &Lab) {
        let tag = self.comment_tag(lab);
        let tap = self.tap_name(lab);

        // iptables has no "remove by comment" primitive; list and delete by
        // rule specification instead, tolerating "no such rule" everywhere.
        for table_args in [
            vec!["-t", "nat", "-D", "PREROUTING"],
            vec!["-t", "nat", "-D", "POSTROUTING"],
            vec!["-D", "FORWARD"],
        ] {
            let _ = drop_rules_tagged(&table_args, &tag).await;
        }
        let _ = run("ip", &["link", "delete", &tap], None, &HashMap::new(), &[], Duration::from_secs(10)).await;
    }

    fn compose_bundle(&self, lab_id: &str, vnc_password: &str) -> Vec<u8> {
        let compose = format!(
            "services:\n\
             \x20 octobox:\n\
             \x20   image: dorowu/ubuntu-desktop-lxde-vnc:latest\n\
             \x20   ports:\n\
             \x20     - \"0.0.0.0:5900:5900\"\n\
             \x20     - \"0.0.0.0:6080:80\"\n\
             \x20   environment:\n\
             \x20     - VNC_PASSWORD=${{VNC_PASSWORD}}\n\
             \x20   restart: unless-stopped\n\
             networks:\n\
             \x20 default:\n\
             \x20   driver: bridge\n"
        );
        let env_file = format!("LAB_ID={lab_id}\nVNC_PASSWORD={vnc_password}\n");

        let mut builder = tar::Builder::new(Vec::new());
        append_tar_entry(&mut builder, "docker-compose.yml", compose.as_bytes());
        append_tar_entry(&mut builder, ".env", env_file.as_bytes());
        let tar_bytes = builder.into_inner().expect("in-memory tar builder never fails");

        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut gz, &tar_bytes).expect("in-memory gzip write never fails");
        gz.finish().expect("in-memory gzip finish never fails")
    }
}

#[async_trait]
impl RuntimeDriver for MicroVmDriver {
    fn name(&self) -> &'static str {
        "microvm"
    }

    async fn create_lab(
        &self,
        lab: &Lab,
        _recipe: &Recipe,
        host_port: u16,
        vnc_password: Option<&str>,
    ) -> Result<CreateOutcome, DriverError> {
        let password = vnc_password
            .ok_or_else(|| DriverError::RuntimeError("VNC password is required for microVM labs".to_string()))?;
        let (kernel, rootfs) = self.preflight()?;

        let state_dir = self.state_dir(lab);
        std::fs::create_dir_all(&state_dir).map_err(|e| DriverError::Internal(e.to_string()))?;

        let mut vm_booted = false;
        let result = self.create_lab_inner(lab, host_port, password, &kernel, &rootfs, &mut vm_booted).await;

        if let Err(ref e) = result {
            error!(lab_id = %lab.id, error = %e, "microvm create_lab failed, no fallback, tearing down");
            if vm_booted {
                let _ = self.destroy_lab(lab).await;
            } else {
                self.cleanup_network(lab).await;
                let _ = std::fs::remove_dir_all(&state_dir);
            }
        }
        result
    }

    async fn destroy_lab(&self, lab: &Lab) -> Result<TeardownReport, DriverError> {
        let mut report = TeardownReport::default();
        let vsock = self.vsock_path(lab);
        let pid_path = self.pid_path(lab);
        let state_dir = self.state_dir(lab);

        if pid_path.exists() {
            report.pre_running.push("firecracker".to_string());
        }

        match send_command(&vsock, "compose_down", serde_json::json!({}), self.settings.microvm_agent_timeout).await {
            Ok(resp) if resp.ok => info!(lab_id = %lab.id, "guest compose_down succeeded"),
            Ok(resp) => report.errors.push(format!("guest compose_down: {}", resp.error.unwrap_or_default())),
            Err(e) => report.errors.push(format!("guest compose_down unreachable: {e}")),
        }

        if let Ok(pid_text) = std::fs::read_to_string(&pid_path) {
            if let Ok(pid) = pid_text.trim().parse::<i32>() {
                kill_process(pid).await;
            }
        }
        report.remaining_after_down.clear();

        self.cleanup_network(lab).await;
        report.networks_found = vec![self.tap_name(lab)];
        report.networks_removed = vec![self.tap_name(lab)];

        if let Err(e) = std::fs::remove_dir_all(&state_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                report.errors.push(format!("state dir cleanup: {e}"));
            }
        }

        report.verified_stopped = !state_dir.exists() && report.errors.is_empty();
        Ok(report)
    }

    async fn wait_for_healthy(&self, lab: &Lab, timeout: Duration) -> Result<(), DriverError> {
        let vsock = self.vsock_path(lab);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(resp) = send_command(&vsock, "status", serde_json::json!({}), self.settings.microvm_agent_timeout).await {
                if resp.ok {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DriverError::Timeout(format!("lab {} never became healthy", lab.id)));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn resources_exist_for_lab(&self, lab: &Lab) -> bool {
        self.state_dir(lab).exists()
    }
}

impl MicroVmDriver {
    async fn create_lab_inner(
        &self,
        lab: &Lab,
        host_port: u16,
        vnc_password: &str,
        kernel: &str,
        rootfs: &str,
        vm_booted: &mut bool,
    ) -> Result<CreateOutcome, DriverError> {
        self.setup_network(lab).await?;
        let (gateway, guest_ip, netmask) = self.guest_network(lab);

        self.boot_vm(lab, kernel, rootfs).await?;
        *vm_booted = true;

        let vsock = self.vsock_path(lab);
        let ping = tokio::time::timeout(
            self.settings.microvm_boot_timeout,
            wait_for_ping(&vsock, self.settings.microvm_agent_timeout),
        )
        .await
        .map_err(|_| DriverError::Timeout(format!("lab {} guest agent never answered ping", lab.id)))??;

        if ping.agent_version.is_none() || ping.rootfs_build_id.is_none() {
            return Err(DriverError::StaleImage(format!(
                "lab {} guest agent is missing version/build_id — rootfs is likely stale",
                lab.id
            )));
        }

        let net_resp = send_command(
            &vsock,
            "configure_network",
            serde_json::json!({ "guest_ip": guest_ip, "netmask": netmask, "gateway": gateway, "dns": "8.8.8.8" }),
            self.settings.microvm_agent_timeout,
        )
        .await?;
        if !net_resp.ok {
            return Err(DriverError::RuntimeError(format!(
                "configure_network failed: {}",
                net_resp.error.unwrap_or_else(|| "unknown".to_string())
            )));
        }

        self.setup_port_forward(lab, host_port, &guest_ip).await?;

        let project_name = naming::project_name(&lab.id);
        let bundle = self.compose_bundle(&lab.id.to_string(), vnc_password);
        let bundle_b64 = base64::engine::general_purpose::STANDARD.encode(&bundle);

        let upload = send_command(
            &vsock,
            "upload_project",
            serde_json::json!({ "project": project_name, "data": bundle_b64 }),
            self.settings.microvm_agent_timeout,
        )
        .await?;
        if !upload.ok {
            return Err(DriverError::RuntimeError(format!(
                "upload_project failed: {}",
                upload.error.unwrap_or_else(|| "unknown".to_string())
            )));
        }

        let compose = send_command(
            &vsock,
            "compose_up",
            serde_json::json!({ "project": project_name }),
            self.settings.microvm_compose_timeout,
        )
        .await?;
        if !compose.ok {
            let diag_excerpt = match send_command(
                &vsock,
                "diag",
                serde_json::json!({}),
                self.settings.microvm_agent_timeout,
            )
            .await
            {
                Ok(diag) => {
                    let raw = format!("{}\n{}", diag.stdout, diag.stderr);
                    truncate_text(&redact_text(&raw, &[vnc_password]), DIAG_EXCERPT_MAX_LEN)
                }
                Err(e) => format!("diag RPC failed: {e}"),
            };
            return Err(DriverError::RuntimeError(format!(
                "compose_up failed: {}; agent diag: {diag_excerpt}",
                compose.error.unwrap_or_else(|| "unknown".to_string())
            )));
        }

        Ok(CreateOutcome {
            runtime_meta: serde_json::json!({
                "guest_ip": guest_ip,
                "guest_port": VNC_GUEST_PORT,
                "vnc_host": DOCKER_HOST_GATEWAY_IP,
                "vnc_port": host_port,
                "tap_name": self.tap_name(lab),
                "project": project_name,
                "agent_version": ping.agent_version,
            }),
            connection_url: format!("vnc://{guest_ip}:{VNC_GUEST_PORT}"),
            host_port: Some(host_port),
        })
    }

    async fn boot_vm(&self, lab: &Lab, kernel: &str, rootfs: &str) -> Result<(), DriverError> {
        let state_dir = self.state_dir(lab);
        let vsock_path = self.vsock_path(lab);
        let pid_path = self.pid_path(lab);
        let tap = self.tap_name(lab);
        let config_path = state_dir.join("vm-config.json");

        let config = serde_json::json!({
            "boot-source": { "kernel_image_path": kernel, "boot_args": "console=ttyS0 reboot=k panic=1" },
            "drives": [{ "drive_id": "rootfs", "path_on_host": rootfs, "is_root_device": true, "is_read_only": false }],
            "network-interfaces": [{ "iface_id": "eth0", "host_dev_name": tap }],
            "vsock": { "guest_cid": 3, "uds_path": vsock_path },
        });
        std::fs::write(&config_path, serde_json::to_vec_pretty(&config).map_err(|e| DriverError::Internal(e.to_string()))?)
            .map_err(|e| DriverError::Internal(e.to_string()))?;

        let mut cmd = tokio::process::Command::new(&self.settings.firecracker_bin);
        cmd.arg("--no-api")
            .arg("--config-file")
            .arg(&config_path)
            .arg("--id")
            .arg(lab.id.to_string())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        let child = cmd.spawn().map_err(|e| DriverError::RuntimeError(format!("firecracker spawn: {e}")))?;
        let pid = child.id().ok_or_else(|| DriverError::Internal("firecracker process has no pid".to_string()))?;
        std::fs::write(&pid_path, pid.to_string()).map_err(|e| DriverError::Internal(e.to_string()))?;
        // The VM owns its own lifetime from here; we track it only by pid file.
        std::mem::forget(child);
        Ok(())
    }
}

async fn wait_for_ping(vsock: &Path, per_attempt_timeout: Duration) -> Result<crate::guest_agent::AgentResponse, DriverError> {
    loop {
        match send_command(vsock, "ping", serde_json::json!({}), per_attempt_timeout).await {
            Ok(resp) if resp.ok => return Ok(resp),
            _ => tokio::time::sleep(Duration::from_millis(250)).await,
        }
    }
}

async fn run_ok(binary: &str, args: &[&str]) -> Result<(), DriverError> {
    let out = run(binary, args, None, &HashMap::new(), &[], Duration::from_secs(10)).await?;
    if out.code != 0 {
        return Err(DriverError::RuntimeError(format!("{binary} {args:?} exited {}: {}", out.code, out.log)));
    }
    Ok(())
}

async fn drop_rules_tagged(base: &[&str], tag: &str) -> Result<(), DriverError> {
    // Best-effort: attempt a bounded number of deletes against the
    // well-known rule shapes this module adds, since iptables can't look
    // rules up by comment directly.
    for _ in 0..4 {
        let mut args = base.to_vec();
        args.extend(["-m", "comment", "--comment", tag]);
        let result = run("iptables", &args, None, &HashMap::new(), &[], Duration::from_secs(10)).await;
        match result {
            Ok(out) if out.code == 0 => continue,
            _ => break,
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn kill_process(pid: i32) {
    use std::time::Duration as StdDuration;
    unsafe {
        libc_kill(pid, 15);
    }
    tokio::time::sleep(StdDuration::from_millis(500)).await;
    unsafe {
        libc_kill(pid, 9);
    }
}

#[cfg(not(unix))]
async fn kill_process(_pid: i32) {}

#[cfg(unix)]
unsafe fn libc_kill(pid: i32, sig: i32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    kill(pid, sig);
}

fn append_tar_entry(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o600);
    header.set_cksum();
    builder.append_data(&mut header, name, data).expect("in-memory tar append never fails");
}

#[cfg(test)]
mod tests {
    use super::*;
    use octolab_config::LogFormat;
    use octolab_domain::{OwnerId, RecipeId};
    use std::time::Duration as StdDuration;

    fn test_settings() -> Arc<Settings> {
        Arc::new(Settings {
            database_url: String::new(),
            log_directive: "info".to_string(),
            log_format: LogFormat::Json,
            bind_addr: String::new(),
            bearer_token: String::new(),
            hmac_secret: vec![0u8; 32],
            default_runtime: octolab_domain::Runtime::MicroVm,
            max_active_labs_per_user: 3,
            default_lab_ttl_minutes: 120,
            lab_startup_timeout: StdDuration::from_secs(1),
            teardown_timeout: StdDuration::from_secs(1),
            container_health_timeout: StdDuration::from_secs(1),
            evidence_export_timeout: StdDuration::from_secs(1),
            evidence_seal_timeout: StdDuration::from_secs(1),
            novnc_ready_timeout: StdDuration::from_secs(1),
            novnc_ready_poll: StdDuration::from_millis(100),
            guac_enabled: false,
            guac_base_url: None,
            guac_admin_user: None,
            guac_admin_password: None,
            guac_encryption_key: None,
            firecracker_bin: "firecracker".to_string(),
            kernel_image: Some("/boot/vmlinux".to_string()),
            rootfs_image: Some("/boot/rootfs.ext4".to_string()),
            retain_failed_labs: false,
            control_plane_containers: vec![],
            network_rm_retry_count: 3,
            network_rm_backoff: StdDuration::from_millis(10),
            novnc_port_range_start: 20000,
            novnc_port_range_end: 29999,
            vnc_auth_mode: "password".to_string(),
            compose_bind_host: "127.0.0.1".to_string(),
            microvm_state_root: "/tmp/octolab-test".to_string(),
            microvm_agent_timeout: StdDuration::from_secs(1),
            microvm_compose_timeout: StdDuration::from_secs(1),
            microvm_boot_timeout: StdDuration::from_secs(1),
            evidence_max_total_bytes: 1024,
            evidence_max_member_bytes: 1024,
            gateway_http_timeout: StdDuration::from_secs(1),
        })
    }

    fn test_lab() -> Lab {
        Lab::new(
            OwnerId(uuid::Uuid::new_v4()),
            RecipeId(uuid::Uuid::new_v4()),
            octolab_domain::Runtime::MicroVm,
            120,
            None,
        )
    }

    #[test]
    fn guest_network_is_deterministic_per_lab() {
        let driver = MicroVmDriver::new(test_settings());
        let lab = test_lab();
        let first = driver.guest_network(&lab);
        let second = driver.guest_network(&lab);
        assert_eq!(first, second);
        assert!(first.1.starts_with("10."));
    }

    #[test]
    fn tap_name_matches_domain_pattern() {
        let driver = MicroVmDriver::new(test_settings());
        let lab = test_lab();
        assert!(octolab_domain::naming::is_valid_tap_name(&driver.tap_name(&lab)));
    }
}
