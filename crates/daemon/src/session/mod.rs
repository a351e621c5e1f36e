//! Session management module.
//!
//! This module provides the shell launch policy, PTY spawning, the registry
//! of live sessions and the bridge that ties one connection to one shell.

pub mod bridge;
pub mod launch;
pub mod pty;
pub mod registry;
pub mod state;

pub use bridge::{BridgeSettings, SessionBridge, SessionOutcome, SessionReport};
pub use launch::{OsFamily, ShellLaunch, ShellLaunchPolicy};
pub use pty::{PtyChannels, PtyProcess, SessionError};
pub use registry::{
    InvalidTransition, RegistryError, SessionHandle, SessionId, SessionInfo, SessionRegistry,
};
pub use state::SessionState;
