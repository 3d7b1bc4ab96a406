// ABOUTME: Path boundary guard for bundle file access
// ABOUTME: Resolves requested paths against a bundle root and rejects anything that escapes it

use crate::error::{EngineError, Result};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Resolve `requested` inside `root`, rejecting anything that would escape it.
///
/// Relative and absolute-looking inputs are both accepted: an absolute input
/// that already points inside the root is used as is, any other leading `/`
/// is treated as the bundle root. `..` segments are resolved lexically and
/// must never climb above the root. Nothing is created or read; the only
/// filesystem access is canonicalising the root and the deepest existing
/// ancestor of the result, so a symlinked directory pointing outside the
/// bundle is caught even when the final file does not exist yet.
pub fn resolve_within(root: &Path, requested: &str) -> Result<PathBuf> {
    if requested.is_empty() {
        return Err(EngineError::PathRejected("empty path".to_string()));
    }
    if requested.contains('\0') {
        return Err(reject(requested, "contains null byte"));
    }

    let canonical_root = root
        .canonicalize()
        .map_err(|_| EngineError::NotFound(root.display().to_string()))?;

    let requested_path = Path::new(requested);
    let relative = if requested_path.has_root() {
        requested_path
            .strip_prefix(&canonical_root)
            .or_else(|_| requested_path.strip_prefix(root))
            .unwrap_or(requested_path)
    } else {
        requested_path
    };

    let mut segments: Vec<OsString> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Prefix(_) => return Err(reject(requested, "drive prefix")),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if segments.pop().is_none() {
                    return Err(reject(requested, "escapes bundle root"));
                }
            }
            Component::Normal(segment) => segments.push(segment.to_os_string()),
        }
    }

    let mut candidate = canonical_root.clone();
    candidate.extend(&segments);

    // Walk up to the deepest ancestor that exists on disk
    let mut existing = candidate.as_path();
    let mut missing_tail: Vec<&std::ffi::OsStr> = Vec::new();
    while existing.symlink_metadata().is_err() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                missing_tail.push(name);
                existing = parent;
            }
            _ => return Err(reject(requested, "no existing ancestor")),
        }
    }

    let mut resolved = existing
        .canonicalize()
        .map_err(|_| reject(requested, "dangling symlink"))?;

    if !resolved.starts_with(&canonical_root) {
        return Err(reject(requested, "symlink escapes bundle root"));
    }

    resolved.extend(missing_tail.iter().rev());
    Ok(resolved)
}

fn reject(requested: &str, reason: &str) -> EngineError {
    warn!("Rejected bundle path {:?}: {}", requested, reason);
    EngineError::PathRejected(format!("{}: {}", requested.escape_debug(), reason))
}
