//! Cache Error Types

use thiserror::Error;

/// Cache error types
#[derive(Error, Debug)]
pub enum CacheError {
    /// Misuse of the public API, e.g. calling an operation after `close`.
    #[error("{0}")]
    User(String),

    /// Constructor/config rejection for an out-of-range or malformed option.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// A write stream exceeded `max_entry_size` before it finalized.
    #[error("entry size {size} exceeds maximum {max}")]
    MaxEntrySizeExceeded { size: usize, max: usize },

    /// Redis transport/protocol failure.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Metadata/identifier JSON did not round-trip.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Body chunk failed to base64-decode.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Keyspace-notification or client-tracking subscription setup failed.
    #[error("subscription setup failed: {0}")]
    SubscriptionSetup(String),
}

/// Cache result type
pub type CacheResult<T> = Result<T, CacheError>;
