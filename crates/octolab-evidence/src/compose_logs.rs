//! Exports a container-runtime lab's compose logs into its auth volume
//! before sealing (spec §4.5, grounded in
//! `evidence_sealing.py::export_compose_logs_to_auth_volume`).

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::EvidenceError;
use crate::extract::write_file_into_volume;

/// Runs `docker compose -p <project> logs --no-color --timestamps` and
/// writes the combined output into `auth_volume` at `logs/compose.log`.
/// Best-effort by design — callers bound this with their own timeout and
/// treat failure as non-fatal to teardown.
pub async fn export_compose_logs_to_auth_volume(
    project: &str,
    auth_volume: &str,
    timeout: Duration,
) -> Result<(), EvidenceError> {
    let output = Command::new("docker")
        .args(["compose", "-p", project, "logs", "--no-color", "--timestamps"])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| EvidenceError::Internal(format!("spawn docker compose logs: {e}")))?;

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);

    write_file_into_volume(auth_volume, "logs/compose.log", &combined, timeout).await
}
