//! Validation and build preflight for the `/labs/deploy-from-dockerfile`
//! path (spec §6).
//!
//! Grounded in `verify_container_setup` from the original source: a
//! submitted Dockerfile and build context are linted against a conservative
//! allowlist before anything is built, the image is built in an isolated
//! directory, and the declared `EXPOSE` ports become `runtime_meta` rather
//! than being trusted blindly by the gateway. This module only builds and
//! lints the image; wiring a custom image into the microVM compose bundle
//! is out of scope (see DESIGN.md).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use base64::Engine;

use crate::error::DriverError;
use crate::subprocess;

const MAX_DOCKERFILE_BYTES: usize = 64 * 1024;
const MAX_BUILD_CONTEXT_FILES: usize = 200;
const MAX_BUILD_CONTEXT_FILE_BYTES: usize = 5 * 1024 * 1024;
const MAX_BUILD_CONTEXT_TOTAL_BYTES: usize = 64 * 1024 * 1024;

/// Instructions never allowed in a submitted Dockerfile: remote-fetching
/// `ADD` (SSRF/arbitrary-fetch risk) and anything that grants the build
/// elevated host access.
const DISALLOWED_INSTRUCTIONS: &[&str] = &["ADD http://", "ADD https://", "--privileged"];

/// Rejects a Dockerfile that exceeds the size bound or contains a
/// disallowed instruction. Matching is case-insensitive on the instruction
/// keyword but exact on the URL scheme, since `ADD ./local` is fine while
/// `ADD https://...` is not.
pub fn validate_dockerfile_source(source: &str) -> Result<(), String> {
    if source.is_empty() {
        return Err("dockerfile is empty".to_string());
    }
    if source.len() > MAX_DOCKERFILE_BYTES {
        return Err(format!("dockerfile exceeds {MAX_DOCKERFILE_BYTES} bytes"));
    }
    let upper = source.to_ascii_uppercase();
    for pattern in DISALLOWED_INSTRUCTIONS {
        if upper.contains(&pattern.to_ascii_uppercase()) {
            return Err(format!("disallowed instruction in dockerfile: {pattern}"));
        }
    }
    Ok(())
}

/// Rejects a build context whose file count, per-file size, or total size
/// exceeds the bound. `files` maps a relative path to base64-encoded
/// contents, the shape the API accepts the context in over JSON.
pub fn validate_build_context(files: &HashMap<String, String>) -> Result<(), String> {
    if files.len() > MAX_BUILD_CONTEXT_FILES {
        return Err(format!("build context has more than {MAX_BUILD_CONTEXT_FILES} files"));
    }
    let mut total = 0usize;
    for (path, encoded) in files {
        if path.contains("..") || path.starts_with('/') {
            return Err(format!("unsafe build context path: {path}"));
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| format!("file is not valid base64: {path}"))?;
        if decoded.len() > MAX_BUILD_CONTEXT_FILE_BYTES {
            return Err(format!("file exceeds {MAX_BUILD_CONTEXT_FILE_BYTES} bytes: {path}"));
        }
        total += decoded.len();
        if total > MAX_BUILD_CONTEXT_TOTAL_BYTES {
            return Err(format!("build context exceeds {MAX_BUILD_CONTEXT_TOTAL_BYTES} bytes"));
        }
    }
    Ok(())
}

/// Parses every `EXPOSE` directive into its declared ports. Malformed
/// entries (non-numeric, out of range) are skipped rather than failing the
/// whole parse — they simply will not show up as reachable ports later.
pub fn parse_exposed_ports(dockerfile: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for line in dockerfile.lines() {
        let trimmed = line.trim();
        let Some(rest) = trimmed
            .strip_prefix("EXPOSE ")
            .or_else(|| trimmed.strip_prefix("expose "))
        else {
            continue;
        };
        for token in rest.split_whitespace() {
            let port_part = token.split('/').next().unwrap_or(token);
            if let Ok(port) = port_part.parse::<u16>() {
                ports.push(port);
            }
        }
    }
    ports.sort_unstable();
    ports.dedup();
    ports
}

pub struct BuildOutcome {
    pub image_tag: String,
    pub log: String,
}

/// Writes the Dockerfile and build context into `build_dir` and runs
/// `docker build` against it with no network access beyond the daemon's
/// own default, returning the tagged image on success. The build log is
/// bounded and attached to any failure so the caller can surface it to the
/// requester (spec §6, §7) without leaking the full unbounded output.
pub async fn build_image(
    build_dir: &Path,
    dockerfile: &str,
    files: &HashMap<String, String>,
    image_tag: &str,
    timeout: Duration,
) -> Result<BuildOutcome, DriverError> {
    tokio::fs::create_dir_all(build_dir)
        .await
        .map_err(|e| DriverError::Internal(format!("creating build context dir: {e}")))?;
    tokio::fs::write(build_dir.join("Dockerfile"), dockerfile)
        .await
        .map_err(|e| DriverError::Internal(format!("writing Dockerfile: {e}")))?;

    for (path, encoded) in files {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| DriverError::Internal(format!("decoding build context file {path}: {e}")))?;
        let dest = build_dir.join(path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DriverError::Internal(format!("creating build context subdir: {e}")))?;
        }
        tokio::fs::write(&dest, decoded)
            .await
            .map_err(|e| DriverError::Internal(format!("writing build context file {path}: {e}")))?;
    }

    let output = subprocess::run(
        "docker",
        &["build", "--no-cache", "-t", image_tag, "."],
        Some(build_dir),
        &HashMap::new(),
        &[],
        timeout,
    )
    .await?;

    if output.code != 0 {
        return Err(DriverError::RuntimeError(format!(
            "docker build exited with code {}: {}",
            output.code,
            bounded_log(&output.log)
        )));
    }

    Ok(BuildOutcome { image_tag: image_tag.to_string(), log: bounded_log(&output.log) })
}

const MAX_LOG_BYTES: usize = 16 * 1024;

fn bounded_log(log: &str) -> String {
    if log.len() <= MAX_LOG_BYTES {
        log.to_string()
    } else {
        let mut truncated = log[log.len() - MAX_LOG_BYTES..].to_string();
        truncated.insert_str(0, "...[truncated]...\n");
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_remote_add() {
        let source = "FROM ubuntu\nADD https://example.com/payload.sh /tmp/p.sh\n";
        assert!(validate_dockerfile_source(source).is_err());
    }

    #[test]
    fn accepts_local_add() {
        let source = "FROM ubuntu\nADD ./app /app\nEXPOSE 8080\n";
        assert!(validate_dockerfile_source(source).is_ok());
    }

    #[test]
    fn parses_multiple_expose_lines() {
        let source = "FROM ubuntu\nEXPOSE 8080\nEXPOSE 9090/tcp 9091\n";
        assert_eq!(parse_exposed_ports(source), vec![8080, 9090, 9091]);
    }

    #[test]
    fn rejects_path_traversal_in_build_context() {
        let mut files = HashMap::new();
        files.insert("../etc/passwd".to_string(), base64::engine::general_purpose::STANDARD.encode(b"x"));
        assert!(validate_build_context(&files).is_err());
    }

    #[test]
    fn accepts_reasonable_build_context() {
        let mut files = HashMap::new();
        files.insert("app/main.py".to_string(), base64::engine::general_purpose::STANDARD.encode(b"print(1)"));
        assert!(validate_build_context(&files).is_ok());
    }
}
