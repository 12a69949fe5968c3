//! Supervision of a local Lexe sidecar process.
//!
//! The sidecar is an external program with an HTTP control surface. The
//! [`Supervisor`] owns exactly one instance of it:
//! - Provisions the executable on first use (download, verify, atomic install)
//! - Spawns it with credentials passed through the environment
//! - Gates `start` on the readiness endpoint
//! - Forwards authenticated API queries
//! - Terminates it with SIGTERM, escalating to SIGKILL
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              Supervisor                                    │
//! │                                                                            │
//! │   start(wait, timeout)                                                    │
//! │         │                                                                  │
//! │         ▼                                                                  │
//! │   ┌──────────────────┐     ┌──────────────────┐     ┌──────────────────┐  │
//! │   │ BinaryProvisioner│────▶│ ProcessController│────▶│ HealthMonitor    │  │
//! │   │ (ensure_binary)  │     │ (spawn)          │     │ (wait until      │  │
//! │   └──────────────────┘     └──────────────────┘     │  healthy)        │  │
//! │                                    ▲                └──────────────────┘  │
//! │   stop() ──────────────────────────┘ terminate                            │
//! │                                                                            │
//! │   status() / check_health() ──▶ HealthMonitor (probe_once)                │
//! │   query(name) ────────────────▶ ApiClient (bearer-authenticated call)     │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use lexe_sidecar::sidecar::{Supervisor, SupervisorConfig};
//! use secrecy::SecretString;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SupervisorConfig::new(Some(SecretString::from("base64-credentials")), 5393)?;
//! let mut supervisor = Supervisor::new(config);
//!
//! supervisor.start(true, None).await?;
//! let info = supervisor.get_node_info().await?;
//! println!("{}", serde_json::to_string_pretty(&info)?);
//!
//! supervisor.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod process;
pub mod provisioner;
pub mod supervisor;

pub use client::{ApiClient, Method, NodeInfo};
pub use config::{HealthCheck, SidecarEndpoint, SupervisorConfig};
pub use error::{
    ApiError, HealthError, ProcessError, ProvisionError, Result, SupervisorError,
};
pub use health::{HealthMonitor, HealthState, ProbeOutcome};
pub use process::{LogSink, OutputStream, ProcessController, ProcessHandle, TracingLogSink};
pub use provisioner::{BinaryArtifact, BinaryProvisioner, Provenance};
pub use supervisor::{CancelPolicy, SidecarStatus, Supervisor};
