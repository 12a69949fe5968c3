//! Error types shared across the crate.

use std::path::PathBuf;

use thiserror::Error;

/// Configuration errors. Always fatal and always raised before any side effect.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No client credentials were resolved from any source.
    #[error(
        "client credentials are required; set LEXE_CLIENT_CREDENTIALS or pass --credentials"
    )]
    MissingCredentials,

    /// Port outside 1..=65535.
    #[error("invalid port {value}: must be between 1 and 65535")]
    InvalidPort {
        /// The rejected value.
        value: u32,
    },

    /// A setting could not be parsed or failed validation.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// Setting name (env var or field).
        key: String,
        /// What was wrong with it.
        message: String,
    },

    /// The rendered download URL is unusable.
    #[error("invalid download URL '{url}': {reason}")]
    InvalidDownloadUrl {
        /// Rendered URL.
        url: String,
        /// Reason for rejection.
        reason: String,
    },

    /// The configuration file could not be read or parsed.
    #[error("failed to load config file {}: {reason}", .path.display())]
    FileLoad {
        /// Path of the file.
        path: PathBuf,
        /// Reason for failure.
        reason: String,
    },
}
