//! Volume extraction via an ephemeral helper container (spec §4.5).
//!
//! Evidence volumes are pulled out by running a throwaway `alpine` container
//! that bind-mounts the volume read-only and streams its regular files as a
//! tar archive on stdout; the archive is then run through
//! [`octolab_driver::safe_extract::safe_extract_bounded`] so a malicious
//! in-lab write can never escape the destination directory. This is a raw
//! byte stream, unlike the line-oriented [`octolab_driver::subprocess::run`]
//! used for compose/driver logging, so it is captured directly here.
//!
//! Every helper container runs with network disabled, all capabilities
//! dropped, and no-new-privileges (spec §4.5, grounded in
//! `test_safe_extract.py`'s `test_extract_volume_uses_hardened_container`).
//! Those three flags alone mean root inside the container can no longer
//! bypass a `0700` directory it doesn't own, so a probe pass first looks for
//! a non-root-owned `0700` directory and, if found, re-runs extraction as
//! that UID (`test_extract_0700_dir_with_uid_1000`).

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use octolab_driver::safe_extract::safe_extract_bounded;

use crate::error::EvidenceError;

const TAR_STREAM_CMD: &str =
    "cd /src && find . -type f -print0 | tar -cf - --null -T - 2>/dev/null || true";

/// Flags applied to every helper container invocation: no network, no
/// capabilities, no privilege escalation.
const HARDENING_FLAGS: &[&str] = &["--network", "none", "--cap-drop", "ALL", "--security-opt", "no-new-privileges"];

/// Looks for a directory under `/src` owned by a non-root UID with mode
/// `0700` and, if one exists, returns that UID so the real extraction can
/// run as it. Best-effort: a probe failure just means extraction proceeds
/// as root, which is correct for the common case where nothing in the
/// volume is UID-restricted.
async fn detect_nonroot_uid(volume: &str, timeout: Duration) -> Option<u32> {
    const PROBE_CMD: &str = "find /src -perm 0700 -type d ! -uid 0 -printf '%U\\n' 2>/dev/null | head -n1";

    let mut args = vec!["run", "--rm"];
    args.extend_from_slice(HARDENING_FLAGS);
    args.extend_from_slice(&["-v", &format!("{volume}:/src:ro"), "alpine", "sh", "-c", PROBE_CMD]);

    let output = tokio::time::timeout(timeout, Command::new("docker").args(&args).output()).await;
    let uid_line = match output {
        Ok(Ok(out)) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim().to_string(),
        _ => return None,
    };
    uid_line.parse::<u32>().ok()
}

async fn docker_volume_tar(volume: &str, timeout: Duration) -> Result<Vec<u8>, EvidenceError> {
    let uid = detect_nonroot_uid(volume, timeout).await;

    let mut args = vec!["run".to_string(), "--rm".to_string()];
    args.extend(HARDENING_FLAGS.iter().map(|s| s.to_string()));
    if let Some(uid) = uid {
        args.push("--user".to_string());
        args.push(format!("{uid}:{uid}"));
    }
    args.extend([
        "-v".to_string(),
        format!("{volume}:/src:ro"),
        "alpine".to_string(),
        "sh".to_string(),
        "-c".to_string(),
        TAR_STREAM_CMD.to_string(),
    ]);

    let mut child = Command::new("docker")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| EvidenceError::Internal(format!("spawn docker run: {e}")))?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let read = async {
        let mut buf = Vec::new();
        stdout
            .read_to_end(&mut buf)
            .await
            .map_err(EvidenceError::from)?;
        Ok::<Vec<u8>, EvidenceError>(buf)
    };

    let bytes = match tokio::time::timeout(timeout, read).await {
        Ok(result) => result?,
        Err(_) => {
            let _ = child.kill().await;
            return Err(EvidenceError::Internal(format!(
                "volume extraction from {volume} timed out after {timeout:?}"
            )));
        }
    };

    let _ = child.wait().await;
    Ok(bytes)
}

/// One file pulled out of an evidence volume: its path relative to the
/// extraction directory (where the bytes actually live on disk) and its
/// manifest key (the same path with the `auth`/`untrusted` prefix that
/// disambiguates which volume it came from).
#[derive(Debug, Clone)]
pub struct ExtractedFile {
    pub disk_path: PathBuf,
    pub manifest_key: String,
}

/// Extracts `volume`'s regular files into `dest`, tagging each with
/// `prefix` (`auth` for the authoritative volume, `untrusted` for the
/// in-lab user volume) to form its manifest key.
pub async fn extract_volume_prefixed(
    volume: &str,
    prefix: &str,
    dest: &Path,
    max_total_bytes: u64,
    max_member_bytes: u64,
    timeout: Duration,
) -> Result<Vec<ExtractedFile>, EvidenceError> {
    let raw = docker_volume_tar(volume, timeout).await?;
    let extracted =
        safe_extract_bounded(Cursor::new(raw), dest, max_total_bytes, max_member_bytes)?;
    Ok(extracted
        .into_iter()
        .filter(|p| dest.join(p).is_file())
        .map(|p| ExtractedFile {
            manifest_key: format!("{prefix}/{}", p.display()),
            disk_path: p,
        })
        .collect())
}

pub async fn extract_auth_volume(
    volume: &str,
    dest: &Path,
    max_total_bytes: u64,
    max_member_bytes: u64,
    timeout: Duration,
) -> Result<Vec<ExtractedFile>, EvidenceError> {
    extract_volume_prefixed(volume, "auth", dest, max_total_bytes, max_member_bytes, timeout).await
}

pub async fn extract_user_volume(
    volume: &str,
    dest: &Path,
    max_total_bytes: u64,
    max_member_bytes: u64,
    timeout: Duration,
) -> Result<Vec<ExtractedFile>, EvidenceError> {
    extract_volume_prefixed(volume, "untrusted", dest, max_total_bytes, max_member_bytes, timeout)
        .await
}

/// Streams `data` into `path` (relative to the volume root) inside
/// `volume`, overwriting whatever is there. Used to write the manifest and
/// its signature back into the authoritative volume after sealing.
pub async fn write_file_into_volume(
    volume: &str,
    path_in_volume: &str,
    data: &[u8],
    timeout: Duration,
) -> Result<(), EvidenceError> {
    use tokio::io::AsyncWriteExt;

    let parent = Path::new(path_in_volume)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let script = if parent.is_empty() {
        format!("cat > /dest/{path_in_volume}")
    } else {
        format!("mkdir -p /dest/{parent} && cat > /dest/{path_in_volume}")
    };

    let mut args = vec!["run".to_string(), "--rm".to_string(), "-i".to_string()];
    args.extend(HARDENING_FLAGS.iter().map(|s| s.to_string()));
    args.extend([
        "-v".to_string(),
        format!("{volume}:/dest"),
        "alpine".to_string(),
        "sh".to_string(),
        "-c".to_string(),
        script.clone(),
    ]);

    let mut child = Command::new("docker")
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| EvidenceError::Internal(format!("spawn docker run: {e}")))?;

    let mut stdin = child.stdin.take().expect("stdin piped");
    let write = async {
        stdin.write_all(data).await?;
        stdin.shutdown().await?;
        Ok::<(), std::io::Error>(())
    };

    match tokio::time::timeout(timeout, write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return Err(EvidenceError::from(e));
        }
        Err(_) => {
            let _ = child.kill().await;
            return Err(EvidenceError::Internal(format!(
                "writing {path_in_volume} into {volume} timed out after {timeout:?}"
            )));
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| EvidenceError::Internal(format!("wait docker run: {e}")))?;
    if !status.success() {
        return Err(EvidenceError::Internal(format!(
            "writing {path_in_volume} into {volume} exited with {status}"
        )));
    }
    Ok(())
}
