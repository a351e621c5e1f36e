//! Workspace root and path confinement.

use std::fs;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Symlinks followed by hand before a path is given up on.
const MAX_SYMLINK_DEPTH: usize = 40;

/// Errors raised while confining a path to the workspace.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The path resolves outside the workspace root.
    #[error("path escapes workspace root: {0}")]
    OutsideRoot(PathBuf),

    /// The path cannot be interpreted at all.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// I/O error while preparing or inspecting the workspace.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The directory every session is confined to.
///
/// The root is created if missing and stored in canonical form, so all
/// comparisons happen against a real absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceRoot {
    root: PathBuf,
}

impl WorkspaceRoot {
    /// Creates (if needed) and canonicalizes the workspace root.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SandboxError> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        let root = fs::canonicalize(path)?;

        if !root.is_dir() {
            return Err(SandboxError::InvalidPath(format!(
                "workspace root is not a directory: {}",
                root.display()
            )));
        }

        tracing::debug!(root = %root.display(), "Workspace root ready");
        Ok(Self { root })
    }

    /// Returns the canonical root path.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolves a client-supplied path to an absolute path inside the root.
    ///
    /// Relative paths are joined to the root. `.` and `..` are collapsed
    /// lexically before the containment check, so `../x` and `/ws/../x` are
    /// rejected without touching the filesystem. Symlinks in the part of the
    /// path that exists are then followed, dangling ones included, and the
    /// result is checked again.
    pub fn resolve<P: AsRef<Path>>(&self, client_path: P) -> Result<PathBuf, SandboxError> {
        let client_path = client_path.as_ref();

        if client_path.as_os_str().is_empty() {
            return Err(SandboxError::InvalidPath("empty path".to_string()));
        }
        if client_path.to_string_lossy().contains('\0') {
            return Err(SandboxError::InvalidPath(
                "path contains a NUL byte".to_string(),
            ));
        }

        let joined = if client_path.is_absolute() {
            client_path.to_path_buf()
        } else {
            self.root.join(client_path)
        };
        self.confine(client_path, &joined, 0)
    }

    /// Checks `candidate` against the root, following symlinks in the part
    /// of the path that exists.
    fn confine(
        &self,
        client_path: &Path,
        candidate: &Path,
        depth: usize,
    ) -> Result<PathBuf, SandboxError> {
        let outside = || SandboxError::OutsideRoot(client_path.to_path_buf());

        let normalized = normalize(candidate);
        if !normalized.starts_with(&self.root) {
            return Err(outside());
        }

        // Nearest ancestor present as a directory entry, dangling symlinks included
        let mut existing = normalized.as_path();
        while fs::symlink_metadata(existing).is_err() {
            match existing.parent() {
                Some(parent) => existing = parent,
                None => return Ok(normalized),
            }
        }
        let rest = normalized
            .strip_prefix(existing)
            .map_err(|e| SandboxError::InvalidPath(e.to_string()))?;

        let canonical = match fs::canonicalize(existing) {
            Ok(canonical) => canonical,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Dangling symlink: follow it by hand and confine its target
                if depth >= MAX_SYMLINK_DEPTH {
                    return Err(SandboxError::InvalidPath(
                        "too many levels of symbolic links".to_string(),
                    ));
                }
                let target = fs::read_link(existing)?;
                let parent = existing
                    .parent()
                    .ok_or_else(|| SandboxError::InvalidPath("dangling root".to_string()))?;
                let followed = fs::canonicalize(parent)?.join(target).join(rest);
                return self.confine(client_path, &followed, depth + 1);
            }
            Err(e) => return Err(e.into()),
        };

        if !canonical.starts_with(&self.root) {
            return Err(outside());
        }
        if rest.as_os_str().is_empty() {
            return Ok(canonical);
        }
        Ok(canonical.join(rest))
    }
}

/// Collapses `.` and `..` without consulting the filesystem.
///
/// `..` at the filesystem root stays at the root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }
    out
}
