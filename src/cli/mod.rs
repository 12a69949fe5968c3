//! CLI command handling.
//!
//! Provides subcommands for:
//! - Fetching the sidecar executable (`download`)
//! - Running the sidecar in the foreground (`start`)
//! - Inspecting whatever listens on the port (`status`, `health`, `node-info`)
//! - Shell completion scripts (`completion`)
//!
//! Each invocation is its own process, so `start` keeps the sidecar attached
//! until Ctrl-C and stops it on the way out.

mod completion;

pub use completion::Completion;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{ColorChoice, Parser, Subcommand, ValueEnum};
use tokio::sync::watch;

use crate::config::{Overrides, Settings};
use crate::sidecar::{
    ApiClient, BinaryProvisioner, CancelPolicy, HealthError, HealthMonitor, ProbeOutcome,
    Provenance, Supervisor, SupervisorConfig, SupervisorError,
};

/// How often `start` checks that the foreground sidecar is still alive.
const FOREGROUND_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "lexe-sidecar")]
#[command(about = "Download, run and query a local Lexe sidecar")]
#[command(
    long_about = "Manages a local Lexe sidecar process.\nExamples:\n  lexe-sidecar start  # Start with credentials from LEXE_CLIENT_CREDENTIALS\n  lexe-sidecar status  # Check the sidecar on the configured port\n  lexe-sidecar node-info  # Print node information"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Base64 client credentials (overrides LEXE_CLIENT_CREDENTIALS)
    #[arg(long, global = true)]
    pub credentials: Option<String>,

    /// Port the sidecar listens on [default: 5393]
    #[arg(long, global = true)]
    pub port: Option<u32>,

    /// TOML settings file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Download the sidecar executable if it is not cached
    Download,

    /// Start the sidecar and keep it running until Ctrl-C
    Start {
        /// Skip waiting for the readiness check
        #[arg(long)]
        no_wait: bool,

        /// Readiness timeout in seconds [default: 30]
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Stop the sidecar
    Stop,

    /// Show whether the sidecar is reachable and healthy
    Status,

    /// Probe the readiness endpoint once
    Health,

    /// Print node information as JSON
    NodeInfo,

    /// Generate shell completion scripts
    Completion(Completion),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Cli {
    /// Command-line values that feed configuration resolution.
    pub fn overrides(&self) -> Overrides {
        let health_timeout_secs = match self.command {
            Command::Start { timeout, .. } => timeout,
            _ => None,
        };
        Overrides {
            credentials: self.credentials.clone(),
            port: self.port,
            config_path: self.config.clone(),
            health_timeout_secs,
        }
    }
}

/// Run one CLI command to completion.
pub async fn run_command(cli: &Cli) -> anyhow::Result<()> {
    if let Command::Completion(ref completion) = cli.command {
        return completion.run();
    }

    let config = Settings::resolve(&cli.overrides())?;
    tracing::debug!(?config, "Resolved configuration");

    match cli.command {
        Command::Download => download(&config).await,
        Command::Start { no_wait, .. } => start_foreground(config, !no_wait).await,
        Command::Stop => {
            // A sidecar started by another invocation is owned by that process.
            println!("Stopping Lexe sidecar...");
            let mut supervisor = Supervisor::new(config);
            supervisor.stop().await?;
            println!("✓ Sidecar stopped");
            Ok(())
        }
        Command::Status => status(&config).await,
        Command::Health => health(&config).await,
        Command::NodeInfo => node_info(&config).await,
        Command::Completion(_) => Ok(()),
    }
}

async fn download(config: &SupervisorConfig) -> anyhow::Result<()> {
    println!("Downloading Lexe sidecar binary...");
    let artifact = BinaryProvisioner::new(config).ensure_binary().await?;
    match artifact.provenance {
        Provenance::Cached => println!("✓ Binary already present at: {}", artifact.path.display()),
        Provenance::Downloaded => println!("✓ Binary ready at: {}", artifact.path.display()),
    }
    if let Some(sha) = artifact.sha256 {
        println!("  sha256: {}", sha);
    }
    Ok(())
}

async fn start_foreground(config: SupervisorConfig, wait_for_health: bool) -> anyhow::Result<()> {
    let port = config.port;
    let mut supervisor = Supervisor::new(config);

    println!("Starting Lexe sidecar...");
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let mut interrupted = cancel_rx.clone();
    let started = supervisor
        .start_with_cancel(wait_for_health, None, cancel_rx, CancelPolicy::Terminate)
        .await;
    if let Err(e) = startup_outcome(started) {
        interrupt.abort();
        return Err(e);
    }

    println!("✓ Sidecar started successfully on port {}", port);
    if wait_for_health {
        println!("✓ Health check passed");
    }
    println!("  URL: {}", supervisor.base_url());
    println!("Press Ctrl-C to stop.");

    let mut check = tokio::time::interval(FOREGROUND_CHECK_INTERVAL);
    let exited = loop {
        tokio::select! {
            Ok(_) = interrupted.wait_for(|cancel| *cancel) => break false,
            _ = check.tick() => {
                if !supervisor.is_running() {
                    break true;
                }
            }
        }
    };
    interrupt.abort();

    if exited {
        let status = supervisor
            .process()
            .and_then(|p| p.exit_status())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown status".to_string());
        supervisor.stop().await?;
        anyhow::bail!("sidecar exited unexpectedly ({})", status);
    }

    println!("\nStopping Lexe sidecar...");
    supervisor.stop().await.context("failed to stop sidecar")?;
    println!("✓ Sidecar stopped");
    Ok(())
}

/// Map a foreground start result to the command's result. An interrupted
/// health wait is a failure, not a clean exit.
fn startup_outcome(started: Result<(), SupervisorError>) -> anyhow::Result<()> {
    match started {
        Ok(()) => Ok(()),
        Err(SupervisorError::Health(HealthError::Cancelled)) => {
            println!("\nInterrupted by user");
            anyhow::bail!("interrupted by user before the sidecar became healthy")
        }
        Err(e) => {
            eprintln!("✗ Failed to start sidecar");
            Err(e.into())
        }
    }
}

async fn status(config: &SupervisorConfig) -> anyhow::Result<()> {
    let endpoint = config.endpoint();
    let listening = tokio::time::timeout(
        config.probe_timeout,
        tokio::net::TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .is_ok_and(|r| r.is_ok());

    println!(
        "Sidecar process: {}",
        if listening { "Running" } else { "Not running" }
    );
    if listening {
        let healthy = HealthMonitor::new(config).probe_once().await.is_healthy();
        println!(
            "Health status: {}",
            if healthy { "Healthy" } else { "Unhealthy" }
        );
        println!("URL: {}", endpoint.http_url());
    }
    Ok(())
}

async fn health(config: &SupervisorConfig) -> anyhow::Result<()> {
    match HealthMonitor::new(config).probe_once().await {
        ProbeOutcome::Healthy => {
            println!("✓ Sidecar is healthy");
            Ok(())
        }
        ProbeOutcome::Unhealthy { reason } => {
            println!("✗ Sidecar is not healthy");
            anyhow::bail!("health check failed: {}", reason)
        }
    }
}

async fn node_info(config: &SupervisorConfig) -> anyhow::Result<()> {
    let info = ApiClient::new(config)
        .node_info()
        .await
        .context("failed to get node info")?;
    println!("Node Information:");
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
