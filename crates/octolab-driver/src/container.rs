//! Container isolation runtime: a `docker compose` project per lab, one
//! desktop service bound to a dynamically allocated host port (spec §4.3).
//!
//! Grounded in `compose_runtime.py`'s `ComposeLabRuntime` and
//! `docker_net.py`: every mutating call is a single, explicit-argv `docker`
//! or `docker compose` invocation run through [`crate::subprocess::run`],
//! and teardown follows the enumerate → act → enumerate protocol so the
//! returned [`TeardownReport`] is never a guess.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use octolab_config::Settings;
use octolab_domain::{naming, Lab, Recipe};
use tracing::{debug, info, warn};

use crate::driver::{CreateOutcome, RuntimeDriver, TeardownReport};
use crate::error::DriverError;
use crate::subprocess::{run, CommandOutput};

const VNC_INTERNAL_PORT: u16 = 5900;
const TIMEOUT_COMPOSE_UP: Duration = Duration::from_secs(120);
const TIMEOUT_COMPOSE_DOWN: Duration = Duration::from_secs(120);
const TIMEOUT_COMPOSE_RM: Duration = Duration::from_secs(60);
const TIMEOUT_NETWORK_RM: Duration = Duration::from_secs(30);
const TIMEOUT_NETWORK_INSPECT: Duration = Duration::from_secs(10);
const TIMEOUT_NETWORK_DISCONNECT: Duration = Duration::from_secs(30);
const MAX_PORT_RETRIES: u32 = 5;

pub struct ContainerDriver {
    settings: Arc<Settings>,
}

impl ContainerDriver {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    fn project_name(&self, lab: &Lab) -> String {
        naming::project_name(&lab.id)
    }

    fn compose_yaml(&self, lab: &Lab, recipe: &Recipe, host_port: u16, vnc_password: &str) -> String {
        // Desktop image is selected from the recipe; the generated project
        // binds exactly one published port (the noVNC web UI) and otherwise
        // relies on the per-lab network for isolation.
        format!(
            "services:\n\
             \x20 octobox:\n\
             \x20   image: {image}\n\
             \x20   environment:\n\
             \x20     LAB_ID: \"{lab_id}\"\n\
             \x20     VNC_AUTH: \"{auth_mode}\"\n\
             \x20     VNC_PASSWORD: \"{password}\"\n\
             \x20   ports:\n\
             \x20     - \"{bind_host}:{host_port}:6080\"\n\
             networks:\n\
             \x20 default:\n\
             \x20   name: {lab_net}\n",
            image = recipe.software,
            lab_id = lab.id,
            auth_mode = self.settings.vnc_auth_mode,
            password = vnc_password,
            bind_host = self.settings.compose_bind_host,
            host_port = host_port,
            lab_net = naming::lab_net_name(&lab.id),
        )
    }

    async fn run_compose(
        &self,
        project: &str,
        compose_file: &Path,
        args: &[&str],
        envs: &HashMap<String, String>,
        secrets: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, DriverError> {
        let mut full_args = vec!["compose", "-f"];
        let compose_str = compose_file.to_string_lossy().to_string();
        full_args.push(&compose_str);
        full_args.push("-p");
        full_args.push(project);
        full_args.extend_from_slice(args);
        run("docker", &full_args, None, envs, secrets, timeout).await
    }

    async fn cleanup_project(&self, project: &str, compose_file: &Path, envs: &HashMap<String, String>, secrets: &[&str]) {
        let _ = self
            .run_compose(project, compose_file, &["down", "--remove-orphans"], envs, secrets, TIMEOUT_COMPOSE_DOWN)
            .await;
        let _ = self
            .run_compose(project, compose_file, &["rm", "-sfv"], envs, secrets, TIMEOUT_COMPOSE_RM)
            .await;
    }

    /// Lists container ids + names labeled with this compose project.
    async fn list_project_containers(&self, project: &str) -> Vec<(String, String)> {
        let filter = format!("label=com.docker.compose.project={project}");
        let out = run(
            "docker",
            &["ps", "-a", "--filter", &filter, "--format", "{{.ID}}\t{{.Names}}"],
            None,
            &HashMap::new(),
            &[],
            Duration::from_secs(10),
        )
        .await;
        match out {
            Ok(o) if o.code == 0 => o
                .log
                .lines()
                .filter_map(|l| {
                    let mut parts = l.splitn(2, '\t');
                    Some((parts.next()?.to_string(), parts.next().unwrap_or("").to_string()))
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    async fn rm_containers_force(&self, ids: &[String]) -> i32 {
        if ids.is_empty() {
            return 0;
        }
        let mut args = vec!["rm", "-f"];
        args.extend(ids.iter().map(|s| s.as_str()));
        match run("docker", &args, None, &HashMap::new(), &[], Duration::from_secs(30)).await {
            Ok(o) => o.code,
            Err(_) => -1,
        }
    }

    /// Networks whose name carries this lab's id — never anything else.
    async fn list_project_networks(&self, lab: &Lab) -> Vec<String> {
        let lab_net = naming::lab_net_name(&lab.id);
        let egress_net = naming::egress_net_name(&lab.id);
        let mut found = Vec::new();
        for candidate in [lab_net, egress_net] {
            if network_exists(&candidate).await {
                found.push(candidate);
            }
        }
        found
    }

    async fn remove_network_with_retry(&self, net_name: &str, project: &str, compose_file: &Path, envs: &HashMap<String, String>) -> (bool, Vec<String>) {
        let max_retries = self.settings.network_rm_retry_count.max(1);
        let backoff = self.settings.network_rm_backoff;
        let allowlist: std::collections::HashSet<&str> =
            self.settings.control_plane_containers.iter().map(|s| s.as_str()).collect();
        let mut errors = Vec::new();

        for attempt in 1..=max_retries {
            match network_rm(net_name).await {
                NetworkRemoveResult::Ok | NetworkRemoveResult::NotFound => return (true, errors),
                NetworkRemoveResult::InUse => {
                    let attached = inspect_network_containers(net_name).await;
                    if !attached.is_empty() {
                        let project_owned: Vec<&String> =
                            attached.iter().filter(|c| is_project_owned_container(c, project)).collect();
                        if !project_owned.is_empty() {
                            debug!(project, net_name, "network still has project containers, rm -sfv then retry");
                            let _ = self.run_compose(project, compose_file, &["rm", "-sfv"], envs, &[], TIMEOUT_COMPOSE_RM).await;
                            continue;
                        }

                        let allowlisted: Vec<&String> = attached.iter().filter(|c| allowlist.contains(c.as_str())).collect();
                        let unknown: Vec<&String> = attached
                            .iter()
                            .filter(|c| !project_owned.contains(c) && !allowlist.contains(c.as_str()))
                            .collect();

                        if !allowlisted.is_empty() && unknown.is_empty() {
                            for container in &allowlisted {
                                let _ = network_disconnect(net_name, container, true).await;
                            }
                            continue;
                        }

                        if !unknown.is_empty() {
                            let names: Vec<String> = unknown.into_iter().cloned().collect();
                            errors.push(format!(
                                "network {net_name} blocked by containers outside this lab: {}",
                                names.join(", ")
                            ));
                            return (false, errors);
                        }
                    }

                    // Empty attachment list under IN_USE is the endpoint-GC
                    // race window; back off and retry rather than give up.
                    if attempt < max_retries {
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                }
                NetworkRemoveResult::Error(e) => {
                    errors.push(e);
                    break;
                }
            }
        }

        warn!(net_name, "network removal gave up after retries");
        (false, errors)
    }

    fn is_localhost(&self) -> bool {
        matches!(
            self.settings.compose_bind_host.parse::<IpAddr>(),
            Ok(IpAddr::V4(v4)) if v4 == Ipv4Addr::LOCALHOST
        ) || self.settings.compose_bind_host == "localhost"
    }
}

#[async_trait]
impl RuntimeDriver for ContainerDriver {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn create_lab(
        &self,
        lab: &Lab,
        recipe: &Recipe,
        host_port: u16,
        vnc_password: Option<&str>,
    ) -> Result<CreateOutcome, DriverError> {
        if self.settings.vnc_auth_mode == "none" && !self.is_localhost() {
            return Err(DriverError::RuntimeError(
                "passwordless VNC is only allowed when binding to localhost".to_string(),
            ));
        }
        let password = vnc_password.ok_or_else(|| {
            DriverError::RuntimeError("VNC password is required for container labs".to_string())
        })?;

        let project = self.project_name(lab);
        let tmp = tempfile::tempdir().map_err(|e| DriverError::Internal(e.to_string()))?;
        let compose_file = tmp.path().join("docker-compose.yml");
        std::fs::write(&compose_file, self.compose_yaml(lab, recipe, host_port, password))
            .map_err(|e| DriverError::Internal(e.to_string()))?;

        let secrets = [password];
        let out = self
            .run_compose(&project, &compose_file, &["up", "-d"], &HashMap::new(), &secrets, TIMEOUT_COMPOSE_UP)
            .await;

        match out {
            Ok(o) if o.code == 0 => {
                let connection_url = format!("http://{}:{}", self.settings.compose_bind_host, host_port);
                Ok(CreateOutcome {
                    runtime_meta: serde_json::json!({ "project": project, "vnc_internal_port": VNC_INTERNAL_PORT }),
                    connection_url,
                    host_port: Some(host_port),
                })
            }
            Ok(o) => {
                self.cleanup_project(&project, &compose_file, &HashMap::new(), &secrets).await;
                let lower = o.log.to_lowercase();
                if lower.contains("port is already allocated") || lower.contains("address already in use") {
                    Err(DriverError::PortCollision(host_port))
                } else if lower.contains("could not find an available") || lower.contains("all predefined address pools") {
                    Err(DriverError::PoolExhausted)
                } else {
                    Err(DriverError::RuntimeError(format!("docker compose up failed: {}", o.log)))
                }
            }
            Err(DriverError::Timeout(msg)) => {
                self.cleanup_project(&project, &compose_file, &HashMap::new(), &secrets).await;
                Err(DriverError::Timeout(msg))
            }
            Err(e) => {
                self.cleanup_project(&project, &compose_file, &HashMap::new(), &secrets).await;
                Err(e)
            }
        }
    }

    async fn destroy_lab(&self, lab: &Lab) -> Result<TeardownReport, DriverError> {
        let project = self.project_name(lab);
        if !naming::is_valid_project_name(&project) {
            return Err(DriverError::InvalidName(project));
        }
        let mut report = TeardownReport::default();

        let pre = self.list_project_containers(&project).await;
        report.pre_running = pre.iter().map(|(_, n)| n.clone()).collect();

        let tmp = tempfile::tempdir().map_err(|e| DriverError::Internal(e.to_string()))?;
        let compose_file = tmp.path().join("docker-compose.yml");
        std::fs::write(&compose_file, "services: {}\n").ok();

        if let Err(e) = self
            .run_compose(&project, &compose_file, &["down", "--remove-orphans"], &HashMap::new(), &[], TIMEOUT_COMPOSE_DOWN)
            .await
        {
            report.errors.push(format!("compose down: {e}"));
        }

        let remaining = self.list_project_containers(&project).await;
        report.remaining_after_down = remaining.iter().map(|(_, n)| n.clone()).collect();

        if !remaining.is_empty() {
            let ids: Vec<String> = remaining.iter().map(|(id, _)| id.clone()).collect();
            info!(project, count = ids.len(), "force-removing remaining containers");
            report.rm_rc = Some(self.rm_containers_force(&ids).await);
        }

        let after = self.list_project_containers(&project).await;
        report.remaining_final = after.iter().map(|(_, n)| n.clone()).collect();
        if !report.remaining_final.is_empty() {
            warn!(project, remaining = report.remaining_final.len(), "containers still present after force-remove");
        }

        let networks = self.list_project_networks(lab).await;
        report.networks_found = networks.clone();
        // Networks are never removed while containers remain (spec §4.3 step 4).
        if report.remaining_final.is_empty() {
            for net in &networks {
                let (removed, mut errs) = self.remove_network_with_retry(net, &project, &compose_file, &HashMap::new()).await;
                if removed {
                    report.networks_removed.push(net.clone());
                }
                report.errors.append(&mut errs);
            }
        } else {
            warn!(project, "containers still present — skipping network teardown");
        }

        report.verified_stopped = report.remaining_final.is_empty()
            && report.networks_found.len() == report.networks_removed.len();

        Ok(report)
    }

    async fn wait_for_healthy(&self, lab: &Lab, timeout: Duration) -> Result<(), DriverError> {
        let project = self.project_name(lab);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let containers = self.list_project_containers(&project).await;
            if !containers.is_empty() {
                let filter = format!("label=com.docker.compose.project={project}");
                let out = run(
                    "docker",
                    &["ps", "--filter", &filter, "--filter", "health=healthy", "--format", "{{.ID}}"],
                    None,
                    &HashMap::new(),
                    &[],
                    Duration::from_secs(10),
                )
                .await;
                if let Ok(o) = out {
                    if o.code == 0 && !o.log.trim().is_empty() {
                        return Ok(());
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DriverError::Timeout(format!("lab {} never became healthy", lab.id)));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn resources_exist_for_lab(&self, lab: &Lab) -> bool {
        let project = self.project_name(lab);
        if !naming::is_valid_project_name(&project) {
            return true;
        }
        match run(
            "docker",
            &["ps", "-a", "-q", "--filter", &format!("label=com.docker.compose.project={project}")],
            None,
            &HashMap::new(),
            &[],
            Duration::from_secs(10),
        )
        .await
        {
            Ok(o) if o.code == 0 => !o.log.trim().is_empty(),
            // Can't tell — assume it might still be there.
            _ => true,
        }
    }
}

#[derive(Debug)]
enum NetworkRemoveResult {
    Ok,
    NotFound,
    InUse,
    Error(String),
}

fn classify_network_error(stderr: &str) -> NetworkRemoveResult {
    let lower = stderr.to_lowercase();
    if lower.contains("not found") || lower.contains("no such network") {
        NetworkRemoveResult::NotFound
    } else if lower.contains("has active endpoints") || lower.contains("resource is still in use") || lower.contains("network is in use") {
        NetworkRemoveResult::InUse
    } else {
        NetworkRemoveResult::Error(stderr.to_string())
    }
}

async fn network_rm(net_name: &str) -> NetworkRemoveResult {
    match run("docker", &["network", "rm", net_name], None, &HashMap::new(), &[], TIMEOUT_NETWORK_RM).await {
        Ok(o) if o.code == 0 => NetworkRemoveResult::Ok,
        Ok(o) => classify_network_error(&o.log),
        Err(e) => NetworkRemoveResult::Error(e.to_string()),
    }
}

async fn network_exists(net_name: &str) -> bool {
    matches!(
        run("docker", &["network", "inspect", net_name], None, &HashMap::new(), &[], TIMEOUT_NETWORK_INSPECT).await,
        Ok(o) if o.code == 0
    )
}

async fn inspect_network_containers(net_name: &str) -> Vec<String> {
    let format = "{{range $id, $c := .Containers}}{{$c.Name}}\n{{end}}";
    match run("docker", &["network", "inspect", net_name, "--format", format], None, &HashMap::new(), &[], TIMEOUT_NETWORK_INSPECT).await {
        Ok(o) if o.code == 0 => {
            let mut names: Vec<String> = o.log.lines().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
            names.sort();
            names
        }
        _ => Vec::new(),
    }
}

async fn network_disconnect(net_name: &str, container: &str, force: bool) -> bool {
    let mut args = vec!["network", "disconnect"];
    if force {
        args.push("--force");
    }
    args.push(net_name);
    args.push(container);
    matches!(
        run("docker", &args, None, &HashMap::new(), &[], TIMEOUT_NETWORK_DISCONNECT).await,
        Ok(o) if o.code == 0
    )
}

/// Connects a control-plane container (the gateway's proxy) to a lab's
/// network — used by `octolab-gateway`'s connectivity preflight (spec
/// §4.6). Idempotent: already-connected is success.
pub async fn connect_container_to_network(container_name: &str, network_name: &str, alias: Option<&str>) -> bool {
    let mut args = vec!["network", "connect"];
    if let Some(a) = alias {
        args.push("--alias");
        args.push(a);
    }
    args.push(network_name);
    args.push(container_name);
    match run("docker", &args, None, &HashMap::new(), &[], TIMEOUT_NETWORK_DISCONNECT).await {
        Ok(o) if o.code == 0 => true,
        Ok(o) => o.log.to_lowercase().contains("already"),
        Err(_) => false,
    }
}

pub async fn disconnect_container_from_network(container_name: &str, network_name: &str) -> bool {
    network_disconnect(network_name, container_name, true).await
}

fn is_project_owned_container(container_name: &str, project: &str) -> bool {
    container_name.trim_start_matches('/').starts_with(&format!("{project}-")) || container_name.trim_start_matches('/').starts_with(&format!("{project}_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_not_found_as_success() {
        assert!(matches!(classify_network_error("Error: No such network: x"), NetworkRemoveResult::NotFound));
    }

    #[test]
    fn classifies_in_use() {
        assert!(matches!(
            classify_network_error("network x has active endpoints"),
            NetworkRemoveResult::InUse
        ));
    }

    #[test]
    fn ownership_check_matches_compose_container_naming() {
        let project = "octolab_11111111-1111-1111-1111-111111111111";
        assert!(is_project_owned_container(&format!("{project}-octobox-1"), project));
        assert!(!is_project_owned_container("octolab-gateway-guacd", project));
    }
}
