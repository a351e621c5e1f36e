//! # Nexus Daemon Library
//!
//! This crate provides the server side of the Nexus terminal: it accepts
//! WebSocket connections from browser terminals and bridges each one to a
//! freshly spawned shell running on a pseudo-terminal.
//!
//! ## Overview
//!
//! - **Terminal Server**: TCP accept loop, WebSocket upgrade on the terminal path
//! - **Session Bridge**: one connection, one shell, pumped in both directions
//! - **Session Registry**: the live sessions, keyed by a generated id
//! - **Shell Launch Policy**: which shell runs, and where
//! - **Workspace Sandbox**: keeps paths inside the workspace root
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Terminal Server                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │   Session    │  │    Shell     │  │      Workspace       │  │
//! │  │   Registry   │  │ Launch Policy│  │       Sandbox        │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │        Session Bridge (one per connection)                 │ │
//! │  │   WebSocket ◄──► input/output tasks ◄──► PTY threads       │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nexus_daemon::{Config, TerminalServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!
//!     let server = TerminalServer::bind(&config).await?;
//!     println!("listening on {}", server.local_addr());
//!
//!     // Runs until `server.shutdown()` is called from another task
//!     server.serve().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`files`]: Workspace root and path sandbox
//! - [`session`]: Launch policy, PTY process, registry and bridge
//! - [`server`]: WebSocket accept loop and shutdown

pub mod config;
pub mod files;
pub mod server;
pub mod session;

pub use config::{Config, ConfigError};
pub use files::{SandboxError, WorkspaceRoot};
pub use server::{ServerState, TerminalServer};
pub use session::{
    SessionBridge, SessionError, SessionRegistry, SessionState, ShellLaunchPolicy,
};
