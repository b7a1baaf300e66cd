use async_trait::async_trait;
use octolab_domain::{Lab, Recipe};
use serde::{Deserialize, Serialize};

use crate::error::DriverError;

/// Result of a successful bring-up call (spec §4.2).
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    /// Whatever the driver wants recorded on `Lab::runtime_meta` — TAP name,
    /// guest IP, compose project id, guest-agent version, and so on.
    pub runtime_meta: serde_json::Value,
    /// The URL the gateway (or caller) should use to reach the lab desktop.
    pub connection_url: String,
    /// Host port the desktop's web/VNC endpoint is bound to, if one was
    /// allocated for this lab.
    pub host_port: Option<u16>,
}

/// Outcome of the verified-teardown sequence: enumerate, act, enumerate
/// again (spec §4.3). Every field records what was actually observed, not
/// what the driver merely attempted — this is what distinguishes a quiet
/// leak from a confirmed-clean teardown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeardownReport {
    /// Containers/processes seen before teardown began.
    pub pre_running: Vec<String>,
    /// Whatever remained after the first destroy attempt.
    pub remaining_after_down: Vec<String>,
    /// Exit code of the forced removal fallback, if one was needed.
    pub rm_rc: Option<i32>,
    /// Whatever remained after the forced removal fallback.
    pub remaining_final: Vec<String>,
    /// Networks found attached to this lab's project.
    pub networks_found: Vec<String>,
    /// Networks actually removed.
    pub networks_removed: Vec<String>,
    /// True only if a post-removal enumeration found nothing left.
    pub verified_stopped: bool,
    /// Non-fatal problems encountered along the way — surfaced to the
    /// caller but never used to fail an otherwise-clean teardown.
    pub errors: Vec<String>,
}

/// Isolation-runtime seam (spec §4.2/§4.3/§4.4): one implementation per
/// [`octolab_domain::Runtime`] variant, selected through
/// [`crate::registry::DriverRegistry`]. Every method is keyed solely off
/// `lab.id` — no caller-supplied resource name ever crosses this boundary
/// (spec §8.1 name-safety invariant).
#[async_trait]
pub trait RuntimeDriver: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Brings up the lab's isolated environment and returns whatever is
    /// needed to reach and later identify it. `host_port` is a port already
    /// reserved by the caller through [`octolab_store::LabStore::allocate_port`] —
    /// the driver never allocates ports itself, it only binds to the one
    /// it's given and reports back if binding actually failed with a
    /// collision (so the caller can reallocate and retry). `vnc_password` is
    /// `Some` only when the gateway integration is enabled (spec §4.6) — in
    /// that case the driver configures the desktop for password auth using it.
    async fn create_lab(
        &self,
        lab: &Lab,
        recipe: &Recipe,
        host_port: u16,
        vnc_password: Option<&str>,
    ) -> Result<CreateOutcome, DriverError>;

    /// Runs the verified-teardown protocol: enumerate what's running, act,
    /// enumerate again, and only report success once the second enumeration
    /// is empty. Never runs a broad prune — only ever touches resources
    /// whose name carries this lab's id.
    async fn destroy_lab(&self, lab: &Lab) -> Result<TeardownReport, DriverError>;

    /// Polls until the lab's workload reports healthy or `timeout` elapses.
    async fn wait_for_healthy(
        &self,
        lab: &Lab,
        timeout: std::time::Duration,
    ) -> Result<(), DriverError>;

    /// Best-effort existence check used by evidence reconciliation and the
    /// stuck-ENDING watchdog. A driver that can't tell for sure must report
    /// `true` — "assume it might still be there" is the safe direction for
    /// a system that must never silently orphan a resource.
    async fn resources_exist_for_lab(&self, lab: &Lab) -> bool;
}
