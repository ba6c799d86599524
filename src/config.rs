//! Cache Configuration

use validator::Validate;

use crate::errors::{CacheError, CacheResult};

/// Engine configuration. All fields are optional in the sense that
/// `Default` produces a usable instance; `validate_config` rejects
/// out-of-range values before a `CacheEngine` is built from it.
#[derive(Debug, Clone, Validate)]
pub struct CacheEngineConfig {
    /// Redis key namespace; separator is implicit and omitted when empty.
    pub prefix: String,

    /// Redis connection string for the primary connection. The secondary
    /// (cleanup) and subscription connections are opened against the same
    /// URL.
    pub redis_url: String,

    /// Body write cutoff, in bytes of base64-encoded payload.
    #[validate(range(min = 1))]
    pub max_entry_size: usize,

    /// Lex-scan page size for `ZRANGE ... BYLEX REV LIMIT`.
    #[validate(range(min = 1))]
    pub max_batch_size: usize,

    /// Fan-out bound for concurrent per-id/per-prefix operations.
    #[validate(range(min = 1))]
    pub concurrency: usize,

    /// Enable the local tracking cache kept coherent via client-side
    /// invalidation.
    pub tracking: bool,

    /// Tracking cache entry count cap.
    pub max_count: u64,

    /// Tracking cache weighted-size cap (`u64::MAX` disables weighing).
    pub max_size: u64,

    /// Header name (case-insensitive) to read cache tags from on write.
    pub cache_tags_header: Option<String>,

    /// If true, issue `CONFIG SET notify-keyspace-events AKE` when the
    /// manager subscription is established. Managed Redis deployments
    /// often disallow this; when it fails the error is surfaced without a
    /// retry (see `subscription.rs`).
    pub client_config_keyspace_event_notify: bool,
}

impl Default for CacheEngineConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_entry_size: 10 * 1024 * 1024,
            max_batch_size: 100,
            concurrency: 10,
            tracking: true,
            max_count: u64::MAX,
            max_size: u64::MAX,
            cache_tags_header: None,
            client_config_keyspace_event_notify: false,
        }
    }
}

impl CacheEngineConfig {
    pub fn validate_config(&self) -> CacheResult<()> {
        self.validate()
            .map_err(|e| CacheError::InvalidOption(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(CacheEngineConfig::default().validate_config().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = CacheEngineConfig::default();
        config.concurrency = 0;
        assert!(config.validate_config().is_err());
    }

    #[test]
    fn zero_max_batch_size_is_rejected() {
        let mut config = CacheEngineConfig::default();
        config.max_batch_size = 0;
        assert!(config.validate_config().is_err());
    }
}
