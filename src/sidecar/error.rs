//! Error types for sidecar supervision.
//!
//! Each component owns a small closed enum. [`SupervisorError`] wraps them so
//! callers of the facade can still match on the component that failed.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::error::ConfigError;

/// Result type for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Errors from binary provisioning. Retryable; never leave a partial file at
/// the final path.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The download URL or platform could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No release is published for this host.
    #[error("no sidecar release for platform {os}/{arch}")]
    UnsupportedPlatform {
        /// Host operating system.
        os: String,
        /// Host architecture.
        arch: String,
    },

    /// Fetching the artifact failed.
    #[error("failed to download '{url}': {reason}")]
    Download {
        /// Source URL.
        url: String,
        /// Reason for failure.
        reason: String,
    },

    /// The downloaded bytes do not match the pinned digest.
    #[error("checksum mismatch for '{url}': expected {expected}, got {actual}")]
    Checksum {
        /// Source URL.
        url: String,
        /// Pinned SHA-256.
        expected: String,
        /// SHA-256 of the downloaded bytes.
        actual: String,
    },

    /// Writing or finalizing the executable failed.
    #[error("filesystem error at {}: {source}", .path.display())]
    Filesystem {
        /// Path being written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the process controller.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The OS refused to start the binary.
    #[error("failed to spawn {}: {source}", .binary.display())]
    Spawn {
        /// Binary that was launched.
        binary: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A live process is already tracked.
    #[error("a sidecar process (pid {pid}) is already tracked")]
    AlreadySpawned {
        /// PID of the tracked process.
        pid: u32,
    },

    /// Even the forceful kill did not confirm exit.
    #[error("failed to terminate pid {pid}: {reason}")]
    Terminate {
        /// PID being terminated.
        pid: u32,
        /// Reason for failure.
        reason: String,
    },
}

/// Errors from waiting on readiness.
#[derive(Debug, Error)]
pub enum HealthError {
    /// No healthy probe within the budget.
    #[error("sidecar not healthy after {timeout:?} ({attempts} probes, last: {last_error})")]
    Timeout {
        /// Budget that elapsed.
        timeout: Duration,
        /// Number of probes issued.
        attempts: u32,
        /// Reason the last probe was unhealthy.
        last_error: String,
    },

    /// The process exited before becoming healthy.
    #[error("sidecar process exited before becoming healthy")]
    ProcessExited,

    /// The caller cancelled the wait.
    #[error("health wait cancelled")]
    Cancelled,
}

/// Errors from the sidecar API client. Always recoverable by the caller.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No bearer token configured; raised before any network access.
    #[error("no authorization token configured")]
    MissingToken,

    /// The sidecar was unreachable or answered with a non-auth failure.
    #[error("request to {url} failed{}: {detail}", .status.map(|s| format!(" with status {s}")).unwrap_or_default())]
    Transport {
        /// Request URL.
        url: String,
        /// HTTP status, if a response was received.
        status: Option<u16>,
        /// Response body or transport error description.
        detail: String,
    },

    /// The sidecar rejected the credentials.
    #[error("request to {url} was not authorized (status {status}): {body}")]
    Auth {
        /// Request URL.
        url: String,
        /// 401 or 403.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The sidecar answered but the body was not the expected JSON.
    #[error("failed to decode response from {url}: {reason}")]
    Decode {
        /// Request URL.
        url: String,
        /// Decoder message.
        reason: String,
    },
}

/// Errors surfaced by [`crate::sidecar::Supervisor`].
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Bad or missing configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Binary provisioning failed.
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// Spawning or terminating the process failed.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// The sidecar did not become healthy.
    #[error(transparent)]
    Health(#[from] HealthError),

    /// An API call failed.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// `start` was called while a live process is tracked.
    #[error("sidecar already running (pid {pid})")]
    AlreadyRunning {
        /// PID of the running process.
        pid: u32,
    },

    /// The operation needs a live sidecar process.
    #[error("sidecar is not running")]
    NotRunning,

    /// `query` was called with a name it does not know.
    #[error("unknown query '{name}'")]
    UnknownQuery {
        /// The rejected name.
        name: String,
    },
}

impl SupervisorError {
    /// Whether retrying the same call may succeed without changing inputs.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provision(ProvisionError::Config(_))
            | Self::Provision(ProvisionError::UnsupportedPlatform { .. }) => false,
            Self::Provision(_) => true,
            Self::Health(HealthError::Timeout { .. }) => true,
            Self::Api(ApiError::MissingToken) => false,
            Self::Api(_) => true,
            Self::Process(ProcessError::Terminate { .. }) => true,
            Self::Config(_)
            | Self::Process(_)
            | Self::Health(_)
            | Self::AlreadyRunning { .. }
            | Self::NotRunning
            | Self::UnknownQuery { .. } => false,
        }
    }
}
