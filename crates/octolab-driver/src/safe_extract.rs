//! Hardened tar extraction for compose bundles uploaded into a microVM guest
//! and for build contexts submitted to deploy-from-dockerfile (spec §4.4).
//!
//! Grounded in the expected behavior documented by the Python test suite's
//! `test_safe_extract.py`: refuse absolute paths, `..` traversal, symlinks,
//! hardlinks, device/FIFO special files; normalize permission bits so
//! nothing extracted is group/world-writable or setuid.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use tar::{Archive, EntryType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SafeExtractError {
    #[error("archive entry has an absolute or traversal path: {0}")]
    UnsafePath(String),

    #[error("archive entry has a disallowed type ({kind}) at {path}")]
    DisallowedEntryType { kind: &'static str, path: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive exceeds its size budget ({0})")]
    TooLarge(&'static str),
}

const FILE_MODE: u32 = 0o600;
const DIR_MODE: u32 = 0o700;

/// Extracts `reader`'s tar stream into `dest`, refusing anything that isn't a
/// plain regular file or directory under a relative, traversal-free path.
/// Every extracted entry gets its mode forced to [`FILE_MODE`]/[`DIR_MODE`].
pub fn safe_extract<R: Read>(reader: R, dest: &Path) -> Result<Vec<PathBuf>, SafeExtractError> {
    safe_extract_bounded(reader, dest, u64::MAX, u64::MAX)
}

/// As [`safe_extract`], but rejects an archive whose total uncompressed size
/// exceeds `max_total_bytes`, or any single member exceeding
/// `max_member_bytes` — used for evidence volumes, which are untrusted
/// guest-written content (spec §4.5).
pub fn safe_extract_bounded<R: Read>(
    reader: R,
    dest: &Path,
    max_total_bytes: u64,
    max_member_bytes: u64,
) -> Result<Vec<PathBuf>, SafeExtractError> {
    let mut archive = Archive::new(reader);
    let mut extracted = Vec::new();
    let mut total: u64 = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let safe_rel = validate_relative_path(&entry_path)?;

        let entry_type = entry.header().entry_type();
        let size = entry.header().size().unwrap_or(0);
        if size > max_member_bytes {
            return Err(SafeExtractError::TooLarge("member"));
        }
        total = total.saturating_add(size);
        if total > max_total_bytes {
            return Err(SafeExtractError::TooLarge("total"));
        }

        match entry_type {
            EntryType::Regular => {
                let target = dest.join(&safe_rel);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                entry.unpack(&target)?;
                set_mode(&target, FILE_MODE)?;
                extracted.push(safe_rel);
            }
            EntryType::Directory => {
                let target = dest.join(&safe_rel);
                std::fs::create_dir_all(&target)?;
                set_mode(&target, DIR_MODE)?;
            }
            other => {
                return Err(SafeExtractError::DisallowedEntryType {
                    kind: entry_type_name(other),
                    path: safe_rel.display().to_string(),
                });
            }
        }
    }

    Ok(extracted)
}

fn validate_relative_path(path: &Path) -> Result<PathBuf, SafeExtractError> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) | Component::ParentDir => {
                return Err(SafeExtractError::UnsafePath(path.display().to_string()));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(SafeExtractError::UnsafePath(path.display().to_string()));
    }
    Ok(normalized)
}

fn entry_type_name(t: EntryType) -> &'static str {
    if t.is_symlink() {
        "symlink"
    } else if t.is_hard_link() {
        "hardlink"
    } else if t.is_character_special() || t.is_block_special() {
        "device"
    } else if t.is_fifo() {
        "fifo"
    } else {
        "unsupported"
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_tar(entries: Vec<(&str, &[u8])>) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn extracts_regular_files_with_normalized_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = build_tar(vec![("a/b.txt", b"hello")]);
        let extracted = safe_extract(&archive[..], tmp.path()).unwrap();
        assert_eq!(extracted.len(), 1);
        let content = std::fs::read(tmp.path().join("a/b.txt")).unwrap();
        assert_eq!(content, b"hello");
    }

    #[test]
    fn rejects_parent_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = build_tar(vec![("../escape.txt", b"x")]);
        let err = safe_extract(&archive[..], tmp.path()).unwrap_err();
        assert!(matches!(err, SafeExtractError::UnsafePath(_)));
    }

    #[test]
    fn rejects_absolute_path() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = build_tar(vec![("/etc/passwd", b"x")]);
        let err = safe_extract(&archive[..], tmp.path()).unwrap_err();
        assert!(matches!(err, SafeExtractError::UnsafePath(_)));
    }

    #[test]
    fn rejects_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_cksum();
        builder.append_link(&mut header, "link", "/etc/passwd").unwrap();
        let archive = builder.into_inner().unwrap();

        let err = safe_extract(&archive[..], tmp.path()).unwrap_err();
        assert!(matches!(err, SafeExtractError::DisallowedEntryType { .. }));
    }

    #[test]
    fn rejects_member_over_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = build_tar(vec![("big.bin", &[0u8; 64])]);
        let err = safe_extract_bounded(&archive[..], tmp.path(), 1024, 32).unwrap_err();
        assert!(matches!(err, SafeExtractError::TooLarge("member")));
    }

    #[allow(dead_code)]
    fn silence_unused_import(_: impl Write) {}
}
