//! Configuration loading for the query client.
//!
//! Values come from a TOML file located with `--config <path>` or the
//! `COACH_QUERY_CONFIG` environment variable. Every field is required when
//! loading from a file; [`QueryClientConfig::default`] exists for embedding
//! and tests.

use coach_core::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::freshness::{QueryOptions, STANDARD_STALE_AFTER};

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "COACH_QUERY_CONFIG";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryClientConfig {
    /// Staleness window for reads that do not pass their own options.
    pub default_stale_after_ms: u64,
    /// Whether reads retry by default.
    pub default_retry: bool,
    pub retry: RetryConfig,
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub log_filter: String,
}

/// Backoff schedule for fetches made with `retry = true`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl RetryConfig {
    /// Delay before retry number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let scaled = self.initial_backoff_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl Default for QueryClientConfig {
    fn default() -> Self {
        Self {
            default_stale_after_ms: STANDARD_STALE_AFTER.as_millis() as u64,
            default_retry: false,
            retry: RetryConfig::default(),
            log_filter: "coach_query=info,warn".to_string(),
        }
    }
}

impl QueryClientConfig {
    /// Locate, parse, and validate the config file.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.initial_backoff_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.initial_backoff_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_backoff_ms",
                reason: "must be >= initial_backoff_ms".to_string(),
            });
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.multiplier",
                reason: "must be >= 1.0".to_string(),
            });
        }
        if self.log_filter.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "log_filter",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn default_stale_after(&self) -> Duration {
        Duration::from_millis(self.default_stale_after_ms)
    }

    /// Options used by reads that do not specify their own.
    pub fn default_options(&self) -> QueryOptions {
        QueryOptions::standard()
            .with_stale_after(self.default_stale_after())
            .with_retry(self.default_retry)
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
