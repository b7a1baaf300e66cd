//! Common subprocess wrapper used by every runtime driver (spec §4.2, §4.3).
//!
//! Generalized from the teacher's `terraform.rs::run_tf`: spawn with an
//! explicit argument vector (never a shell string), drain stdout/stderr
//! concurrently into one ordered log via an mpsc channel, enforce a hard
//! timeout, and mirror each line to `tracing` with any configured secrets
//! redacted first.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::error::DriverError;
use crate::redact::redact_text;

/// Result of a subprocess run: exit code plus the combined, redacted log.
pub struct CommandOutput {
    pub code: i32,
    pub log: String,
}

/// Runs `binary args...` with `envs` set, in `cwd` if given, under `timeout`.
/// `secrets` are substring-redacted out of every line before it's logged or
/// appended to the returned log — callers must list every secret value that
/// might appear in stdout/stderr (e.g. a generated VNC password).
pub async fn run(
    binary: &str,
    args: &[&str],
    cwd: Option<&Path>,
    envs: &HashMap<String, String>,
    secrets: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, DriverError> {
    debug!(binary, ?args, "running subprocess");

    let mut cmd = Command::new(binary);
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .envs(envs);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| DriverError::Internal(format!("spawn {binary}: {e}")))?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let mut log = String::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    let tx1 = tx.clone();
    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = tx1.send(line);
        }
    });

    let tx2 = tx.clone();
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = tx2.send(line);
        }
    });
    drop(tx);

    let collect = async {
        while let Some(line) = rx.recv().await {
            let redacted = redact_text(&line, secrets);
            debug!(target: "octolab::subprocess", "{}", redacted);
            log.push_str(&redacted);
            log.push('\n');
        }
    };

    let timed_out = tokio::time::timeout(timeout, collect).await.is_err();

    stdout_task.await.ok();
    stderr_task.await.ok();

    if timed_out {
        let _ = child.kill().await;
        return Err(DriverError::Timeout(format!(
            "{binary} {} timed out after {:?}",
            args.first().copied().unwrap_or(""),
            timeout,
        )));
    }

    let status = child
        .wait()
        .await
        .map_err(|e| DriverError::Internal(format!("wait {binary}: {e}")))?;

    Ok(CommandOutput { code: status.code().unwrap_or(-1), log })
}
