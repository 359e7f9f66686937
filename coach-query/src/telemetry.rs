//! Logging setup for binaries and long-running hosts.

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("invalid log filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("failed to install subscriber: {reason}")]
    Install { reason: String },
}

/// Build the filter from `RUST_LOG`, falling back to `fallback`.
pub fn env_filter(fallback: &str) -> Result<EnvFilter, TelemetryError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(fallback).map_err(|e| TelemetryError::InvalidFilter {
            filter: fallback.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Install a JSON `fmt` subscriber as the global default.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(fallback_filter: &str) -> Result<(), TelemetryError> {
    let filter = env_filter(fallback_filter)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .map_err(|e| TelemetryError::Install {
            reason: e.to_string(),
        })?;

    tracing::debug!(filter = fallback_filter, "tracing initialized");
    Ok(())
}
