//! Error types for the response cache.
//!
//! Most cache failures never reach callers: `get`/`set` degrade to a miss
//! or a no-op and log instead. `CacheError` is what the internal layers
//! return so the façade can decide, and what configuration validation
//! surfaces at open time.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the cache layers.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem failure on the backing store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to (de)serialize an entry header, metadata or stats record.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The payload codec rejected a value.
    #[error("payload codec error: {0}")]
    Codec(String),

    /// A persisted record exists but cannot be decoded.
    #[error("corrupt entry: {0}")]
    Corrupt(String),

    /// A backing-store call did not finish within the configured bound.
    #[error("backing store timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid configuration or settings.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;
