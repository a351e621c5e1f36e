//! Nexus Daemon
//!
//! Serves interactive shell sessions to browser terminals over WebSocket.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use nexus_daemon::config::{default_config_path, Config};
use nexus_daemon::server::TerminalServer;
use tracing_subscriber::EnvFilter;

/// Nexus Daemon - bridges browser terminals to shell processes.
#[derive(Parser, Debug)]
#[command(name = "nexus-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the terminal server
    Start {
        /// Address to listen on (overrides config)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,

        /// Workspace root directory (overrides config)
        #[arg(long, value_name = "DIR")]
        workspace: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Write the effective configuration to the config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides, then command line overrides
    let env_overrides = config.apply_env_overrides();
    if let Commands::Start { bind, workspace } = &cli.command {
        if let Some(bind) = bind {
            config.server.bind_addr = bind.clone();
        }
        if let Some(workspace) = workspace {
            config.workspace.root = workspace.clone();
        }
    }

    // Validate configuration
    config.validate()?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&config, cli.verbose))
        .init();

    tracing::debug!("Using config file: {:?}", config_path);
    for var in env_overrides {
        tracing::info!(var, "Configuration overridden from environment");
    }

    match cli.command {
        Commands::Start { .. } => run_server(config).await?,
        Commands::Config => print!("{}", config.to_toml()?),
        Commands::Init { force } => init_config(&config, &config_path, force)?,
    }

    Ok(())
}

/// Builds the log filter. `RUST_LOG` wins, then `--verbose`, then the config.
fn log_filter(config: &Config, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    EnvFilter::new(level)
}

/// Write the configuration file, refusing to clobber one unless forced.
fn init_config(config: &Config, path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }
    config.save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Run the terminal server until a shutdown signal arrives.
async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("Nexus daemon starting...");

    let server = Arc::new(
        TerminalServer::bind(&config)
            .await
            .context("Failed to start terminal server")?,
    );

    let serving = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.serve().await }
    });

    // Wait for shutdown signal (SIGTERM or SIGINT)
    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    server.shutdown().await;
    serving.await.context("Accept loop panicked")??;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }

    Ok(())
}

/// Wait for a shutdown signal (Ctrl-C).
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}
