//! Process configuration for the `ratewarden` binary.
//!
//! Wraps the engine configuration with logging settings. Values come from a
//! YAML file and may be overridden by `RATEWARDEN_*` environment variables,
//! with `__` separating nested keys (`RATEWARDEN_LOGGING__LEVEL=debug`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{RateLimitError, Result};
use crate::ratelimit::RateLimiterConfig;

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for a Ratewarden process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Engine configuration: key prefix, storage and rules
    #[serde(default)]
    pub limiter: RateLimiterConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl WardenConfig {
    /// Load configuration from a YAML file layered with environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let config = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize::<WardenConfig>())
            .map_err(|e| RateLimitError::Config(format!("Failed to load configuration: {}", e)))?;

        config.limiter.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WardenConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateLimitError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.limiter.validate()?;
        Ok(config)
    }
}
