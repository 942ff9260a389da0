//! Cache error types

use redis::RedisError;

/// Boxed error returned by caller-supplied compute functions
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The backing store could not be reached, after transparent retries
    #[error("Connection error: {0}")]
    Connection(String),

    /// A single backing-store call exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Could not acquire lock for key {key} within {waited:?}")]
    LockTimeout {
        key: String,
        waited: std::time::Duration,
    },

    /// Release attempted on a lock that expired and was reassigned
    #[error("Lock for key {key} is no longer owned by {owner_id}")]
    LockNotOwned { key: String, owner_id: String },

    #[error("Schema mismatch for key {key} at {path}: {reason}")]
    Schema {
        key: String,
        path: String,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compute error: {0}")]
    Compute(BoxError),

    #[error("Invalid configuration for `{key}`: {reason}")]
    Config { key: &'static str, reason: String },

    #[error("Redis error: {0}")]
    Redis(RedisError),
}

impl CacheError {
    /// True for failures that mean the backing store is unavailable
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CacheError::Connection(_) | CacheError::Timeout(_))
    }

    pub(crate) fn config(key: &'static str, reason: impl Into<String>) -> Self {
        CacheError::Config {
            key,
            reason: reason.into(),
        }
    }
}

impl From<RedisError> for CacheError {
    fn from(e: RedisError) -> Self {
        if e.is_timeout() {
            CacheError::Timeout(std::time::Duration::ZERO)
        } else if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
            CacheError::Connection(e.to_string())
        } else {
            CacheError::Redis(e)
        }
    }
}

impl From<config::ConfigError> for CacheError {
    fn from(e: config::ConfigError) -> Self {
        CacheError::config("settings", e.to_string())
    }
}
