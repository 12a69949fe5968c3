//! Configuration types for sidecar supervision.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default port the sidecar listens on.
pub const DEFAULT_PORT: u16 = 5393;

/// Name of the executable inside the binary directory.
pub const DEFAULT_BINARY_NAME: &str = "lexe-sidecar";

/// Release tag fetched when no binary is cached.
pub const DEFAULT_VERSION: &str = "lexe-sidecar-v0.3.0";

/// Release URL template. `{version}` and `{platform}` are substituted.
pub const DEFAULT_DOWNLOAD_URL_TEMPLATE: &str = "https://github.com/lexe-app/lexe-sidecar-sdk/releases/download/{version}/lexe-sidecar-{platform}.tar.gz";

/// Environment variable the sidecar reads its client credentials from.
pub const CREDENTIALS_ENV: &str = "LEXE_CLIENT_CREDENTIALS";

/// Environment variable the sidecar reads its listen address from.
pub const LISTEN_ADDR_ENV: &str = "LISTEN_ADDR";

/// Readiness check against the sidecar's HTTP API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// Path probed with `GET`.
    pub path: String,
    /// Expected value of the `status` field in the response body.
    pub marker: String,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: "/v2/health".to_string(),
            marker: "ok".to_string(),
        }
    }
}

/// Immutable configuration for one supervised sidecar.
///
/// Built once at the boundary (see [`crate::config::Settings::resolve`]) and
/// handed by reference to every component. Nothing in the `sidecar` module
/// reads the process environment on its own.
#[derive(Clone)]
pub struct SupervisorConfig {
    /// Loopback port the sidecar listens on.
    pub port: u16,
    /// Host the sidecar binds to and is reached at.
    pub host: String,
    /// Opaque client credentials, passed to the child via its environment.
    pub credentials: Option<SecretString>,
    /// Directory holding the sidecar executable.
    pub binary_dir: PathBuf,
    /// File name of the executable inside `binary_dir`.
    pub binary_name: String,
    /// Release tag substituted into the download URL.
    pub version: String,
    /// Download URL template with `{version}` and `{platform}` placeholders.
    pub download_url_template: String,
    /// Optional SHA-256 pin (lowercase hex) for freshly downloaded artifacts.
    pub expected_sha256: Option<String>,
    /// Readiness probe definition.
    pub health_check: HealthCheck,
    /// Overall budget for waiting on readiness during `start`.
    pub health_timeout: Duration,
    /// Pause between readiness probes.
    pub health_poll_interval: Duration,
    /// Per-probe HTTP timeout.
    pub probe_timeout: Duration,
    /// Per-call HTTP timeout for API requests.
    pub request_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_timeout: Duration,
}

impl std::fmt::Debug for SupervisorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorConfig")
            .field("port", &self.port)
            .field("host", &self.host)
            .field("credentials", &self.credentials.is_some())
            .field("binary_dir", &self.binary_dir)
            .field("binary_name", &self.binary_name)
            .field("version", &self.version)
            .field("download_url_template", &self.download_url_template)
            .field("expected_sha256", &self.expected_sha256)
            .field("health_check", &self.health_check)
            .field("health_timeout", &self.health_timeout)
            .field("health_poll_interval", &self.health_poll_interval)
            .field("probe_timeout", &self.probe_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("stop_timeout", &self.stop_timeout)
            .finish()
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: "127.0.0.1".to_string(),
            credentials: None,
            binary_dir: default_binary_dir(),
            binary_name: DEFAULT_BINARY_NAME.to_string(),
            version: DEFAULT_VERSION.to_string(),
            download_url_template: DEFAULT_DOWNLOAD_URL_TEMPLATE.to_string(),
            expected_sha256: None,
            health_check: HealthCheck::default(),
            health_timeout: Duration::from_secs(30),
            health_poll_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl SupervisorConfig {
    /// Create a config from caller-supplied credentials and a port.
    ///
    /// The port must fit in 16 bits and be non-zero. Missing credentials are
    /// accepted here and rejected by `start`, so provisioning-only callers do
    /// not need them.
    pub fn new(credentials: Option<SecretString>, port: u32) -> Result<Self, ConfigError> {
        Ok(Self {
            port: validate_port(port)?,
            credentials,
            ..Default::default()
        })
    }

    /// Override the binary directory.
    pub fn with_binary_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.binary_dir = dir.into();
        self
    }

    /// Override the health wait budget.
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    /// Override the poll interval between readiness probes.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.health_poll_interval = interval;
        self
    }

    /// Override the download URL template.
    pub fn with_download_url_template(mut self, template: impl Into<String>) -> Self {
        self.download_url_template = template.into();
        self
    }

    /// Pin the SHA-256 of freshly downloaded artifacts.
    pub fn with_expected_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.expected_sha256 = Some(sha256.into().to_ascii_lowercase());
        self
    }

    /// Override the SIGTERM grace period.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort { value: 0 });
        }
        if self.binary_name.is_empty()
            || self.binary_name.contains('/')
            || self.binary_name.contains('\\')
        {
            return Err(ConfigError::InvalidValue {
                key: "binary_name".to_string(),
                message: "must be a plain file name".to_string(),
            });
        }
        if self.health_poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "health_poll_interval".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "probe_timeout".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if let Some(ref sha) = self.expected_sha256
            && (sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(ConfigError::InvalidValue {
                key: "expected_sha256".to_string(),
                message: "must be 64 hex characters".to_string(),
            });
        }
        Ok(())
    }

    /// Credentials, or a config error if none were resolved.
    pub fn require_credentials(&self) -> Result<&SecretString, ConfigError> {
        self.credentials
            .as_ref()
            .ok_or(ConfigError::MissingCredentials)
    }

    /// Full path of the sidecar executable.
    pub fn binary_path(&self) -> PathBuf {
        self.binary_dir.join(&self.binary_name)
    }

    /// Address the sidecar is told to listen on.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Endpoint the supervisor talks to.
    pub fn endpoint(&self) -> SidecarEndpoint {
        SidecarEndpoint {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Validate a caller-supplied port number.
pub fn validate_port(port: u32) -> Result<u16, ConfigError> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(ConfigError::InvalidPort { value: port }),
    }
}

/// Default directory for the sidecar executable.
pub fn default_binary_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lexe-sidecar")
        .join("bin")
}

/// Release platform tag for the running host, if one is published.
pub fn platform_tag() -> Option<&'static str> {
    platform_tag_for(std::env::consts::OS, std::env::consts::ARCH)
}

pub(crate) fn platform_tag_for(os: &str, arch: &str) -> Option<&'static str> {
    match (os, arch) {
        ("linux", "x86_64") => Some("linux-x86_64"),
        ("linux", "aarch64") => Some("linux-aarch64"),
        ("macos", "x86_64") => Some("macos-x86_64"),
        ("macos", "aarch64") => Some("macos-aarch64"),
        _ => None,
    }
}

/// Where the sidecar's HTTP API is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarEndpoint {
    /// Host address (usually 127.0.0.1).
    pub host: String,
    /// Listen port.
    pub port: u16,
}

impl SidecarEndpoint {
    /// Base HTTP URL, without a trailing slash.
    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// URL for a path on this endpoint.
    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.http_url(), path.trim_start_matches('/'))
    }
}

impl std::fmt::Display for SidecarEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
