//! vsock guest-agent RPC client for the microVM runtime (spec §4.4).
//!
//! Firecracker exposes a guest's `AF_VSOCK` ports through a host-side Unix
//! domain socket: a client connects to that socket, writes `CONNECT <port>\n`,
//! waits for the `OK <port>\n` handshake line, and from then on the
//! connection is a raw byte stream to the guest's listener on that port.
//! The agent inside the guest speaks one JSON object per line on top of
//! that stream — this module is the host-side half of that protocol.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::error::DriverError;

/// Guest-agent vsock port the agent listens on inside every lab rootfs.
pub const AGENT_VSOCK_PORT: u32 = 52;

/// Verbs the agent accepts. Anything else is refused host-side before a
/// connection is even attempted — the allowlist is the contract, not just
/// documentation (spec §4.4 "guest-agent protocol").
const ALLOWED_VERBS: &[&str] = &[
    "ping",
    "diag",
    "configure_network",
    "upload_project",
    "compose_up",
    "compose_down",
    "status",
];

#[derive(Debug, Clone, Serialize)]
struct AgentRequest<'a> {
    verb: &'a str,
    #[serde(flatten)]
    params: serde_json::Value,
}

/// Response shape is fixed regardless of verb; fields meaningless for a
/// given verb are left at their zero value rather than omitted, so callers
/// never have to guard against a missing key.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub rootfs_build_id: Option<String>,
    #[serde(default)]
    pub docker_ready: Option<bool>,
    #[serde(default)]
    pub last_compose_status: Option<serde_json::Value>,
}

/// Sends `verb` with `params` over the vsock UDS at `socket_path`, bounded
/// by `timeout`. `params` should be a JSON object (or `Value::Null`); its
/// keys are flattened alongside `verb` into the request line.
pub async fn send_command(
    socket_path: &Path,
    verb: &str,
    params: serde_json::Value,
    timeout: Duration,
) -> Result<AgentResponse, DriverError> {
    if !ALLOWED_VERBS.contains(&verb) {
        return Err(DriverError::Internal(format!("guest-agent verb not allowed: {verb}")));
    }

    tokio::time::timeout(timeout, send_command_inner(socket_path, verb, params))
        .await
        .map_err(|_| DriverError::Timeout(format!("guest-agent {verb}")))?
}

async fn send_command_inner(
    socket_path: &Path,
    verb: &str,
    params: serde_json::Value,
) -> Result<AgentResponse, DriverError> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| DriverError::RuntimeError(format!("vsock connect: {e}")))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half
        .write_all(format!("CONNECT {AGENT_VSOCK_PORT}\n").as_bytes())
        .await
        .map_err(|e| DriverError::RuntimeError(format!("vsock handshake write: {e}")))?;

    let mut ack = String::new();
    reader
        .read_line(&mut ack)
        .await
        .map_err(|e| DriverError::RuntimeError(format!("vsock handshake read: {e}")))?;
    if !ack.trim_start().starts_with("OK") {
        return Err(DriverError::RuntimeError(format!("vsock handshake refused: {}", ack.trim())));
    }

    let request = AgentRequest { verb, params };
    let mut line = serde_json::to_string(&request)
        .map_err(|e| DriverError::Internal(format!("encode agent request: {e}")))?;
    line.push('\n');
    write_half
        .write_all(line.as_bytes())
        .await
        .map_err(|e| DriverError::RuntimeError(format!("vsock request write: {e}")))?;

    let mut response_line = String::new();
    reader
        .read_line(&mut response_line)
        .await
        .map_err(|e| DriverError::RuntimeError(format!("vsock response read: {e}")))?;

    serde_json::from_str(response_line.trim())
        .map_err(|e| DriverError::RuntimeError(format!("malformed agent response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_defaults_are_never_null() {
        let resp: AgentResponse = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert_eq!(resp.stdout, "");
        assert_eq!(resp.stderr, "");
        assert_eq!(resp.exit_code, 0);
        assert!(resp.error.is_none());
    }

    #[tokio::test]
    async fn disallowed_verb_is_refused_before_connecting() {
        let err = send_command(Path::new("/nonexistent.sock"), "rm_rf_root", serde_json::Value::Null, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Internal(_)));
    }
}
