//! Workspace path validation.
//!
//! Every terminal runs inside the configured workspace root. Requested
//! paths are resolved against the root and must land on the root itself or
//! somewhere below it.

use chatterm_core::{TermError, TermResult};
use std::path::{Component, Path, PathBuf};

/// Resolve `requested` against `root` and check it stays inside `root`.
///
/// Containment is checked per path component, so a sibling such as
/// `/ws-evil` does not pass for root `/ws`. If the resolved path exists it
/// is canonicalized and checked again, which catches symlinks pointing out
/// of the root. Returns the resolved directory.
pub fn resolve_workspace(root: &Path, requested: &str) -> TermResult<PathBuf> {
    let root = normalize(root);
    let candidate = normalize(&root.join(requested));

    if !candidate.starts_with(&root) {
        return Err(TermError::WorkspaceEscape(requested.to_string()));
    }

    match candidate.canonicalize() {
        Ok(real) => {
            let real_root = root.canonicalize().unwrap_or(root);
            if !real.starts_with(&real_root) {
                return Err(TermError::WorkspaceEscape(requested.to_string()));
            }
            Ok(real)
        }
        Err(_) => Ok(candidate),
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
///
/// `..` never climbs above the filesystem root.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                let at_top = matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir | Component::Prefix(_))
                );
                if !at_top {
                    out.pop();
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
