//! Configuration management for the Nexus daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/nexus/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use nexus_protocol::{TerminalSize, DEFAULT_COLS, DEFAULT_ROWS, MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default listen address, matching the port the browser client expects.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3001";

/// Default WebSocket path for terminal sessions.
pub const DEFAULT_TERMINAL_PATH: &str = "/terminal";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind_addr must be a socket address like 127.0.0.1:3001, got {0}")]
    InvalidBindAddr(String),

    #[error("path must start with '/', got {0}")]
    InvalidPath(String),

    #[error("max_message_size must be greater than 0")]
    InvalidMaxMessageSize,

    #[error("terminal dimensions must be positive, got {cols}x{rows}")]
    InvalidDimensions { cols: u16, rows: u16 },

    #[error("output_channel_capacity must be greater than 0")]
    InvalidChannelCapacity,

    #[error("shell does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Nexus daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// WebSocket listener configuration.
    pub server: ServerConfig,

    /// Sandboxed workspace configuration.
    pub workspace: WorkspaceConfig,

    /// Terminal session configuration.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the terminal server listens on.
    pub bind_addr: String,

    /// Request path that upgrades to a terminal session.
    pub path: String,

    /// Largest WebSocket message accepted from a client, in bytes.
    pub max_message_size: usize,
}

/// Sandboxed workspace configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Root directory every shell starts in. Created if missing.
    pub root: PathBuf,
}

/// Terminal session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell used for every session instead of the platform default.
    pub shell: Option<String>,

    /// Initial terminal columns.
    pub cols: u16,

    /// Initial terminal rows.
    pub rows: u16,

    /// Number of PTY output chunks buffered per session.
    pub output_channel_capacity: usize,

    /// How long to keep forwarding output after the shell exits (milliseconds).
    pub exit_drain_ms: u64,

    /// Upper bound on waiting for a session's process and reader to stop (milliseconds).
    pub teardown_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            path: DEFAULT_TERMINAL_PATH.to_string(),
            max_message_size: MAX_FRAME_SIZE,
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("workspace"),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            output_channel_capacity: 256,
            exit_drain_ms: 200,
            teardown_timeout_ms: 2000,
        }
    }
}

impl ServerConfig {
    /// Parses the bind address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_addr
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddr(self.bind_addr.clone()))
    }
}

impl SessionConfig {
    /// Initial terminal size for new sessions.
    pub fn initial_size(&self) -> TerminalSize {
        TerminalSize {
            cols: self.cols,
            rows: self.rows,
        }
    }

    /// Grace period for trailing output after the shell exits.
    pub fn exit_drain(&self) -> Duration {
        Duration::from_millis(self.exit_drain_ms)
    }

    /// Bound on process and reader shutdown during teardown.
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

/// Reads an environment variable, treating empty values as unset.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nexus")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - NEXUS_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - NEXUS_BIND_ADDR: Override listen address
    /// - NEXUS_WORKSPACE: Override workspace root
    ///
    /// Returns the names of the variables that were applied, so they can be
    /// logged once logging is up.
    pub fn apply_env_overrides(&mut self) -> Vec<&'static str> {
        let mut applied = Vec::new();

        if let Some(level) = env_value("NEXUS_LOG_LEVEL") {
            self.daemon.log_level = level;
            applied.push("NEXUS_LOG_LEVEL");
        }

        if let Some(addr) = env_value("NEXUS_BIND_ADDR") {
            self.server.bind_addr = addr;
            applied.push("NEXUS_BIND_ADDR");
        }

        if let Some(root) = env_value("NEXUS_WORKSPACE") {
            self.workspace.root = PathBuf::from(root);
            applied.push("NEXUS_WORKSPACE");
        }

        applied
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.socket_addr()?;

        if !self.server.path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.server.path.clone()));
        }

        if self.server.max_message_size == 0 {
            return Err(ConfigError::InvalidMaxMessageSize);
        }

        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(ConfigError::InvalidDimensions {
                cols: self.session.cols,
                rows: self.session.rows,
            });
        }

        if self.session.output_channel_capacity == 0 {
            return Err(ConfigError::InvalidChannelCapacity);
        }

        // Only an explicit override is checked; the platform default is resolved at spawn time
        if let Some(shell) = &self.session.shell {
            let shell_path = Path::new(shell);
            let found = if shell_path.is_absolute() {
                shell_path.exists()
            } else {
                which::which(shell).is_ok()
            };
            if !found {
                return Err(ConfigError::InvalidShellPath(shell.clone()));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
