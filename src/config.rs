//! Orchestrator configuration.
//!
//! Loaded from TOML, then overridden from `HAL_ORCH_*` environment
//! variables, then validated. Every field has a default, so an empty
//! file is a valid configuration.
//!
//! ```toml
//! ttl_days = 30
//! failure_threshold = 5
//! recovery_timeout_secs = 60
//! max_retries = 3
//! base_delay_ms = 500
//! max_delay_ms = 60000
//! workers = 4
//! fallback_chain = ["primary-quantum", "classical-a", "classical-b"]
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value {value:?} for environment variable {var}")]
    InvalidEnv { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Retention and resilience settings for the orchestration core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Days a terminal job stays queryable before archival.
    pub ttl_days: u32,
    /// Consecutive failures that open a backend's breaker.
    pub failure_threshold: u32,
    /// Seconds an open breaker waits before allowing a trial.
    pub recovery_timeout_secs: u64,
    /// Re-queue cycles before a job fails.
    pub max_retries: u32,
    /// Backoff base, in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff cap, in milliseconds.
    pub max_delay_ms: u64,
    /// Dispatch worker count.
    pub workers: usize,
    /// Per-attempt timeout for jobs that do not set one, in seconds.
    pub default_timeout_secs: u64,
    /// Seconds between archival sweeps.
    pub sweep_interval_secs: u64,
    /// Backend ids tried in order after the job's preference.
    pub fallback_chain: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            ttl_days: 30,
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            workers: 4,
            default_timeout_secs: 300,
            sweep_interval_secs: 3600,
            fallback_chain: vec![
                "primary-quantum".to_string(),
                "classical-a".to_string(),
                "classical-b".to_string(),
            ],
        }
    }
}

impl OrchestratorConfig {
    /// Parse configuration from a TOML string. Does not validate.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Read configuration from a TOML file. Does not validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from an optional file, apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Override the retention/resilience knobs from `HAL_ORCH_*` variables.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = parse_override(&lookup, "HAL_ORCH_TTL_DAYS")? {
            self.ttl_days = v;
        }
        if let Some(v) = parse_override(&lookup, "HAL_ORCH_FAILURE_THRESHOLD")? {
            self.failure_threshold = v;
        }
        if let Some(v) = parse_override(&lookup, "HAL_ORCH_RECOVERY_TIMEOUT_SECS")? {
            self.recovery_timeout_secs = v;
        }
        if let Some(v) = parse_override(&lookup, "HAL_ORCH_MAX_RETRIES")? {
            self.max_retries = v;
        }
        if let Some(v) = parse_override(&lookup, "HAL_ORCH_BASE_DELAY_MS")? {
            self.base_delay_ms = v;
        }
        if let Some(v) = parse_override(&lookup, "HAL_ORCH_MAX_DELAY_MS")? {
            self.max_delay_ms = v;
        }
        Ok(())
    }

    /// Reject values the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("ttl_days", u64::from(self.ttl_days)),
            ("failure_threshold", u64::from(self.failure_threshold)),
            ("recovery_timeout_secs", self.recovery_timeout_secs),
            ("base_delay_ms", self.base_delay_ms),
            ("max_delay_ms", self.max_delay_ms),
            ("workers", self.workers as u64),
            ("default_timeout_secs", self.default_timeout_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if self.fallback_chain.is_empty() {
            return Err(ConfigError::Invalid("fallback_chain is empty".into()));
        }
        if self.fallback_chain.iter().any(|id| id.trim().is_empty()) {
            return Err(ConfigError::Invalid("fallback_chain contains a blank id".into()));
        }
        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.ttl_days) * 24 * 60 * 60)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_override<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retention(), Duration::from_secs(30 * 86_400));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            failure_threshold = 3
            max_retries = 2
            fallback_chain = ["annealer", "milp"]
            "#,
        )
        .unwrap();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.fallback_chain, vec!["annealer", "milp"]);
        assert_eq!(config.ttl_days, 30);
    }

    #[test]
    fn test_parse_error() {
        let err = OrchestratorConfig::from_toml_str("max_retries = \"three\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let config = OrchestratorConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("failure_threshold"));
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let config = OrchestratorConfig {
            base_delay_ms: 10_000,
            max_delay_ms: 1_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_allows_zero_retries() {
        let config = OrchestratorConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = OrchestratorConfig::default();
        config
            .apply_overrides(|var| match var {
                "HAL_ORCH_MAX_RETRIES" => Some("7".into()),
                "HAL_ORCH_RECOVERY_TIMEOUT_SECS" => Some(" 15 ".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.recovery_timeout_secs, 15);
        assert_eq!(config.failure_threshold, 5);
    }

    #[test]
    fn test_env_override_invalid() {
        let mut config = OrchestratorConfig::default();
        let err = config
            .apply_overrides(|var| (var == "HAL_ORCH_TTL_DAYS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }
}
