//! Boundary configuration resolution.
//!
//! Layers, highest priority first: command-line flags, environment, an
//! optional TOML file, built-in defaults. The result is a validated
//! [`SupervisorConfig`]; nothing past this point reads the environment.

mod helpers;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

pub use helpers::{Env, ProcessEnv};

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;
use crate::sidecar::config::{CREDENTIALS_ENV, DEFAULT_PORT, SupervisorConfig, default_binary_dir};

pub const PORT_ENV: &str = "LEXE_SIDECAR_PORT";
pub const BINARY_DIR_ENV: &str = "LEXE_SIDECAR_BINARY_DIR";
pub const HEALTH_TIMEOUT_ENV: &str = "LEXE_SIDECAR_HEALTH_TIMEOUT_SECS";
pub const VERSION_ENV: &str = "LEXE_SIDECAR_VERSION";
pub const DOWNLOAD_URL_ENV: &str = "LEXE_SIDECAR_DOWNLOAD_URL";
pub const SHA256_ENV: &str = "LEXE_SIDECAR_SHA256";

/// Values supplied on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub credentials: Option<String>,
    pub port: Option<u32>,
    pub config_path: Option<PathBuf>,
    pub health_timeout_secs: Option<u64>,
}

/// Contents of the optional TOML settings file.
///
/// ```toml
/// port = 5393
/// binary_dir = "/opt/lexe/bin"
/// health_timeout_secs = 45
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub credentials: Option<String>,
    pub port: Option<u32>,
    pub binary_dir: Option<PathBuf>,
    pub version: Option<String>,
    pub download_url: Option<String>,
    pub sha256: Option<String>,
    pub health_timeout_secs: Option<u64>,
    pub health_poll_interval_ms: Option<u64>,
    pub stop_timeout_secs: Option<u64>,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::FileLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&raw).map_err(|reason| ConfigError::FileLoad {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn parse(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|e| e.to_string())
    }

    /// Resolve a supervisor config from the process environment.
    pub fn resolve(overrides: &Overrides) -> Result<SupervisorConfig, ConfigError> {
        Self::resolve_with(overrides, &ProcessEnv)
    }

    /// Resolve a supervisor config from an explicit environment.
    pub fn resolve_with(
        overrides: &Overrides,
        env: &dyn Env,
    ) -> Result<SupervisorConfig, ConfigError> {
        let file = match overrides.config_path {
            Some(ref path) => Self::load(path)?,
            None => Self::default(),
        };

        let port = match overrides.port {
            Some(port) => port,
            None => parse_optional_env::<u32>(env, PORT_ENV)?
                .or(file.port)
                .unwrap_or(u32::from(DEFAULT_PORT)),
        };

        let credentials = overrides
            .credentials
            .clone()
            .filter(|c| !c.trim().is_empty())
            .or(optional_env(env, CREDENTIALS_ENV)?)
            .or(file.credentials.filter(|c| !c.trim().is_empty()))
            .map(SecretString::from);

        let mut config = SupervisorConfig::new(credentials, port)?.with_binary_dir(
            optional_env(env, BINARY_DIR_ENV)?
                .map(PathBuf::from)
                .or(file.binary_dir)
                .unwrap_or_else(default_binary_dir),
        );

        let health_timeout_secs = match overrides.health_timeout_secs {
            Some(secs) => Some(secs),
            None => parse_optional_env::<u64>(env, HEALTH_TIMEOUT_ENV)?.or(file.health_timeout_secs),
        };
        if let Some(secs) = health_timeout_secs {
            config = config.with_health_timeout(Duration::from_secs(secs));
        }
        if let Some(version) = optional_env(env, VERSION_ENV)?.or(file.version) {
            config.version = version;
        }
        if let Some(template) = optional_env(env, DOWNLOAD_URL_ENV)?.or(file.download_url) {
            config = config.with_download_url_template(template);
        }
        if let Some(sha) = optional_env(env, SHA256_ENV)?.or(file.sha256) {
            config = config.with_expected_sha256(sha);
        }
        if let Some(ms) = file.health_poll_interval_ms {
            config = config.with_poll_interval(Duration::from_millis(ms));
        }
        if let Some(secs) = file.stop_timeout_secs {
            config = config.with_stop_timeout(Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn settings_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_any_source() {
        let config = Settings::resolve_with(&Overrides::default(), &env(&[])).unwrap();

        assert_eq!(config.port, 5393);
        assert!(config.credentials.is_none());
        assert_eq!(config.health_timeout, Duration::from_secs(30));
        assert_eq!(config.binary_dir, default_binary_dir());
    }

    #[test]
    fn test_flags_beat_env_beat_file() {
        let file = settings_file(
            r#"
            credentials = "from-file"
            port = 7000
            health_timeout_secs = 60
            version = "lexe-sidecar-v0.2.0"
            "#,
        );
        let env = env(&[
            (CREDENTIALS_ENV, "from-env"),
            (PORT_ENV, "6000"),
            (VERSION_ENV, "lexe-sidecar-v0.4.0"),
        ]);
        let overrides = Overrides {
            port: Some(5000),
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        let config = Settings::resolve_with(&overrides, &env).unwrap();

        assert_eq!(config.port, 5000);
        assert_eq!(
            config.credentials.as_ref().map(|c| c.expose_secret().to_string()),
            Some("from-env".to_string())
        );
        assert_eq!(config.version, "lexe-sidecar-v0.4.0");
        assert_eq!(config.health_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_file_only_fields() {
        let file = settings_file(
            r#"
            binary_dir = "/opt/lexe/bin"
            health_poll_interval_ms = 250
            stop_timeout_secs = 3
            sha256 = "ABCDEF0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF0123456789"
            "#,
        );
        let overrides = Overrides {
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        let config = Settings::resolve_with(&overrides, &env(&[])).unwrap();

        assert_eq!(config.binary_dir, PathBuf::from("/opt/lexe/bin"));
        assert_eq!(config.health_poll_interval, Duration::from_millis(250));
        assert_eq!(config.stop_timeout, Duration::from_secs(3));
        assert_eq!(
            config.expected_sha256.as_deref(),
            Some("abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789")
        );
    }

    #[test]
    fn test_invalid_port_in_env() {
        let err = Settings::resolve_with(&Overrides::default(), &env(&[(PORT_ENV, "70000")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort { value: 70000 }));

        let err = Settings::resolve_with(&Overrides::default(), &env(&[(PORT_ENV, "http")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == PORT_ENV));
    }

    #[test]
    fn test_blank_flag_credentials_fall_through() {
        let overrides = Overrides {
            credentials: Some("   ".to_string()),
            ..Default::default()
        };
        let config =
            Settings::resolve_with(&overrides, &env(&[(CREDENTIALS_ENV, "env-token")])).unwrap();
        assert_eq!(
            config.credentials.as_ref().map(|c| c.expose_secret().to_string()),
            Some("env-token".to_string())
        );
    }

    #[test]
    fn test_unknown_file_key_is_rejected() {
        let file = settings_file("prot = 5393\n");
        let overrides = Overrides {
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        let err = Settings::resolve_with(&overrides, &env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::FileLoad { .. }));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let overrides = Overrides {
            config_path: Some(PathBuf::from("/nonexistent/lexe-sidecar.toml")),
            ..Default::default()
        };
        let err = Settings::resolve_with(&overrides, &env(&[])).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/lexe-sidecar.toml"));
    }

    #[test]
    fn test_short_health_timeout_is_accepted() {
        for secs in [1, 2] {
            let overrides = Overrides {
                health_timeout_secs: Some(secs),
                ..Default::default()
            };
            let config = Settings::resolve_with(&overrides, &env(&[])).unwrap();
            assert_eq!(config.health_timeout, Duration::from_secs(secs));
        }

        let config =
            Settings::resolve_with(&Overrides::default(), &env(&[(HEALTH_TIMEOUT_ENV, "2")]))
                .unwrap();
        assert_eq!(config.health_timeout, Duration::from_secs(2));
    }
}
