//! Error types for the cache client.

use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by cache operations.
///
/// The enum is `Clone` so a single loader failure can be delivered to every
/// waiter coordinated by the single-flight layer. Variants therefore carry
/// owned strings (or an `Arc` for the wrapped loader error) rather than the
/// underlying error values.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Database connection or query failed after retries.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Value serialization or deserialization failed. Never cached.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The caller-supplied loader failed. Delivered to all current waiters
    /// for the key; the failure itself is not cached.
    #[error("loader failed: {0}")]
    Loader(Arc<anyhow::Error>),

    /// The operation deadline elapsed or the caller abandoned the wait.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation attempted after `close()`.
    #[error("cache client is closed")]
    Closed,

    /// Invalid configuration. Surfaced at construction, never at steady state.
    #[error("configuration error: {0}")]
    Config(String),

    /// A key failed validation (empty, or longer than the allowed maximum).
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

impl CacheError {
    /// Create a configuration error from any message.
    pub fn config<S: Into<String>>(message: S) -> Self {
        CacheError::Config(message.into())
    }

    /// Create an encoding error from any message.
    pub fn encoding<S: Into<String>>(message: S) -> Self {
        CacheError::Encoding(message.into())
    }

    /// Wrap an arbitrary loader error.
    pub fn loader(error: impl Into<anyhow::Error>) -> Self {
        CacheError::Loader(Arc::new(error.into()))
    }
}

impl From<sqlx::Error> for CacheError {
    fn from(error: sqlx::Error) -> Self {
        CacheError::BackendUnavailable(error.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(error: serde_json::Error) -> Self {
        CacheError::Encoding(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
