//! WebSocket terminal server.
//!
//! This module provides the `TerminalServer` that accepts TCP connections,
//! upgrades requests for the terminal path to WebSocket, and hands each
//! connection to its own [`SessionBridge`] task.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::files::WorkspaceRoot;
use crate::session::{BridgeSettings, SessionBridge, SessionRegistry, ShellLaunchPolicy};

/// Terminal server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Bound but not accepting yet, or fully stopped.
    Stopped,
    /// Accepting connections.
    Running,
    /// Tearing down live sessions.
    ShuttingDown,
}

/// Accepts terminal connections and runs one session per connection.
pub struct TerminalServer {
    /// Bound listener.
    listener: TcpListener,
    /// Address the listener is bound to.
    local_addr: SocketAddr,
    /// Request path that upgrades to a session.
    path: String,
    /// Transport limits applied to every connection.
    ws_config: WebSocketConfig,
    /// Shell and working directory for new sessions.
    policy: Arc<ShellLaunchPolicy>,
    /// Live sessions.
    registry: Arc<SessionRegistry>,
    /// Per-session tunables.
    settings: BridgeSettings,
    /// Current state.
    state: Arc<RwLock<ServerState>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Connection tasks, waited on during shutdown.
    tracker: TaskTracker,
}

impl TerminalServer {
    /// Validates the configuration, prepares the workspace and binds the
    /// listener.
    pub async fn bind(config: &Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let root = WorkspaceRoot::open(&config.workspace.root).with_context(|| {
            format!(
                "Failed to prepare workspace: {}",
                config.workspace.root.display()
            )
        })?;
        let policy = ShellLaunchPolicy::from_override(root, config.session.shell.as_deref());

        let addr = config.server.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.server.max_message_size);
        ws_config.max_frame_size = Some(config.server.max_message_size);

        info!(
            addr = %local_addr,
            workspace = %policy.workspace().path().display(),
            shell = %policy.shell(),
            "Terminal server bound"
        );

        Ok(Self {
            listener,
            local_addr,
            path: config.server.path.clone(),
            ws_config,
            policy: Arc::new(policy),
            registry: Arc::new(SessionRegistry::new()),
            settings: BridgeSettings::from_config(config),
            state: Arc::new(RwLock::new(ServerState::Stopped)),
            shutdown_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Returns the address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the current state.
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Accepts connections until shutdown is requested.
    ///
    /// Accept and handshake errors are logged and never stop the server.
    pub async fn serve(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Stopped {
                anyhow::bail!("Terminal server is already running");
            }
            *state = ServerState::Running;
        }

        info!(addr = %self.local_addr, path = %self.path, "Accepting terminal connections");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        debug!("Accept loop stopped");
        Ok(())
    }

    /// Stops accepting, tears down every live session and waits for them.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write().await;
            if *state == ServerState::ShuttingDown {
                return;
            }
            *state = ServerState::ShuttingDown;
        }

        info!(sessions = self.registry.count(), "Shutting down terminal server");

        self.shutdown_token.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        *self.state.write().await = ServerState::Stopped;
        info!("Terminal server stopped");
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let path = self.path.clone();
        let ws_config = self.ws_config.clone();
        let shutdown = self.shutdown_token.clone();
        let bridge = SessionBridge::new(
            Arc::clone(&self.policy),
            Arc::clone(&self.registry),
            self.settings.clone(),
            &self.shutdown_token,
        );

        self.tracker.spawn(async move {
            debug!(peer = %peer, "Accepted connection");

            let callback = move |request: &Request, response: Response| {
                check_upgrade_path(request, &path).map(|()| response)
            };
            let handshake = accept_hdr_async_with_config(stream, callback, Some(ws_config));

            let ws = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = handshake => match result {
                    Ok(ws) => ws,
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "WebSocket handshake failed");
                        return;
                    }
                },
            };

            let report = bridge.run(ws).await;
            debug!(
                peer = %peer,
                session_id = %report.id,
                pid = ?report.pid,
                outcome = %report.outcome,
                "Connection finished"
            );
        });
    }
}

/// Rejects upgrade requests for any path but the terminal path.
#[allow(clippy::result_large_err)]
fn check_upgrade_path(request: &Request, path: &str) -> Result<(), ErrorResponse> {
    if request.uri().path() == path {
        return Ok(());
    }

    debug!(path = %request.uri().path(), "Rejecting upgrade for unknown path");
    let mut response = ErrorResponse::new(Some("Not Found".to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    Err(response)
}
