//! Shell launch policy.
//!
//! Decides which executable a new session runs and where it starts. The
//! decision depends only on the operating system, the workspace root and an
//! optional server-wide override, never on the connecting client.

use std::path::PathBuf;

use crate::files::{SandboxError, WorkspaceRoot};

/// Terminal type advertised to every shell.
pub const TERM_NAME: &str = "xterm-color";

/// Operating system family, as far as shell selection is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Unix,
    Windows,
}

impl OsFamily {
    /// The family this binary was built for.
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }

    /// Default interactive shell for this family.
    pub fn default_shell(self) -> &'static str {
        match self {
            Self::Unix => "bash",
            Self::Windows => "cmd.exe",
        }
    }
}

/// Fully resolved spawn parameters for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellLaunch {
    /// Executable to run.
    pub program: String,
    /// Working directory of the new process.
    pub cwd: PathBuf,
    /// Value of `TERM` in the child environment.
    pub term: &'static str,
}

/// Resolves spawn parameters for new sessions.
#[derive(Debug, Clone)]
pub struct ShellLaunchPolicy {
    shell: String,
    root: WorkspaceRoot,
}

impl ShellLaunchPolicy {
    /// Policy using the platform default shell.
    pub fn new(root: WorkspaceRoot) -> Self {
        Self::for_os(OsFamily::current(), root)
    }

    /// Policy using the default shell of a specific OS family.
    pub fn for_os(os: OsFamily, root: WorkspaceRoot) -> Self {
        Self {
            shell: os.default_shell().to_string(),
            root,
        }
    }

    /// Policy with a server-wide shell override.
    pub fn with_shell(root: WorkspaceRoot, shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            root,
        }
    }

    /// Builds a policy from the optional configured override.
    pub fn from_override(root: WorkspaceRoot, shell: Option<&str>) -> Self {
        match shell {
            Some(shell) => Self::with_shell(root, shell),
            None => Self::new(root),
        }
    }

    /// Shell every session will run.
    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Workspace root every session starts in.
    pub fn workspace(&self) -> &WorkspaceRoot {
        &self.root
    }

    /// Spawn parameters for a new session.
    ///
    /// The working directory goes through the sandbox on every call, so a
    /// root that was swapped for a symlink after startup is refused.
    pub fn resolve(&self) -> Result<ShellLaunch, SandboxError> {
        let cwd = self.root.resolve(self.root.path())?;
        Ok(ShellLaunch {
            program: self.shell.clone(),
            cwd,
            term: TERM_NAME,
        })
    }
}
