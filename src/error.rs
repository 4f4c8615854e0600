//! Error types for the Tollgate service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum GateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store could not be reached at startup
    #[error("Connection error: {0}")]
    Connection(String),

    /// Counter store errors at runtime
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for GateError {
    fn from(err: config::ConfigError) -> Self {
        GateError::Config(err.to_string())
    }
}

/// Errors raised by a counter store operation.
///
/// A store error means "no decision could be made"; callers must never read it
/// as an admission.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store has not been connected, or was disconnected.
    #[error("counter store is not connected")]
    NotConnected,

    /// The operation did not complete within its deadline.
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// The backing service failed or returned a protocol error.
    #[error("backend failure: {0}")]
    Backend(String),

    /// A stored counter could not be parsed as an integer.
    #[error("malformed counter record for key {key}: {reason}")]
    MalformedRecord { key: String, reason: String },
}

impl StoreError {
    /// Classify a Redis error raised while operating on `key`.
    pub fn from_redis(key: &str, err: redis::RedisError) -> Self {
        let detail = err.to_string();
        if detail.contains("not an integer") {
            StoreError::MalformedRecord {
                key: key.to_string(),
                reason: detail,
            }
        } else {
            StoreError::Backend(detail)
        }
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, GateError>;
