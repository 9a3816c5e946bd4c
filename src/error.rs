//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Non-positive capacity or refill rate, or otherwise unusable settings.
    /// Fatal at initialization.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The shared store could not be reached, timed out, or failed to run the script.
    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored bucket record could not be parsed.
    #[error("Corrupt bucket state: {0}")]
    StateCorrupt(String),

    /// Configuration loading/parsing errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether the error comes from the shared store and is subject to the fallback policy.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, TollgateError::StoreUnavailable(_))
    }
}

impl From<redis::RedisError> for TollgateError {
    fn from(err: redis::RedisError) -> Self {
        TollgateError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
