//! Error types for Coach data operations

use crate::QueryKey;
use thiserror::Error;

/// Failures reported by a fetch collaborator.
///
/// Every caller attached to the same in-flight fetch receives a clone of the
/// same error, so this type is `Clone`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Transport failure: {reason}")]
    Transport { reason: String },

    #[error("Request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Failed to decode response: {reason}")]
    Decode { reason: String },

    #[error("Fetch aborted before completion: {reason}")]
    Aborted { reason: String },
}

impl FetchError {
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode {
            reason: err.to_string(),
        }
    }
}

/// Cache store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("No cached value for {key} and no fetch attempted")]
    NotFound { key: QueryKey },

    #[error("Cached value for {key} is not a {expected}")]
    TypeMismatch { key: QueryKey, expected: &'static str },

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or COACH_QUERY_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for all Coach errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoachError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CoachError {
    /// Returns true if this error came from the fetch collaborator.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, Self::Fetch(_))
    }

    /// Returns true if this is a `NotFound` cache error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Cache(CacheError::NotFound { .. }))
    }
}

/// Result type alias for Coach operations.
pub type CoachResult<T> = Result<T, CoachError>;

// =============================================================================
// TESTS
// =============================================================================
