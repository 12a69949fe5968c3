use std::env::VarError;
use std::str::FromStr;

use crate::error::ConfigError;

/// Source of environment variables. The process environment in production,
/// a map in tests.
pub trait Env {
    fn var(&self, key: &str) -> Result<String, VarError>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl Env for ProcessEnv {
    fn var(&self, key: &str) -> Result<String, VarError> {
        std::env::var(key)
    }
}

impl Env for std::collections::HashMap<String, String> {
    fn var(&self, key: &str) -> Result<String, VarError> {
        self.get(key).cloned().ok_or(VarError::NotPresent)
    }
}

/// Read an env var, treating unset and blank the same.
pub(crate) fn optional_env(env: &dyn Env, key: &str) -> Result<Option<String>, ConfigError> {
    match env.var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "not valid unicode".to_string(),
        }),
    }
}

/// Parse an optional env var into `T`.
pub(crate) fn parse_optional_env<T>(env: &dyn Env, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(env, key)?
        .map(|s| s.parse::<T>())
        .transpose()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_optional_env_blank_is_unset() {
        let env = env(&[("A", "  "), ("B", " value ")]);
        assert_eq!(optional_env(&env, "A").unwrap(), None);
        assert_eq!(optional_env(&env, "B").unwrap(), Some("value".to_string()));
        assert_eq!(optional_env(&env, "C").unwrap(), None);
    }

    #[test]
    fn test_parse_optional_env_reports_key() {
        let env = env(&[("PORT", "abc"), ("SECS", "12")]);

        assert_eq!(parse_optional_env::<u64>(&env, "SECS").unwrap(), Some(12));
        let err = parse_optional_env::<u32>(&env, "PORT").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "PORT"));
    }
}
