//! Cache configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::CacheError;

/// Default identity field name.
pub const DEFAULT_ID_FIELD: &str = "id";

/// How long an event lock stays armed before it expires on its own.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 250;

/// Broadcast channel capacity for cache updates.
/// Sized for realtime reconnection bursts so slow observers rarely lag.
pub const DEFAULT_UPDATE_CAPACITY: usize = 4096;

/// Configuration for a [`RecordCache`](crate::RecordCache).
///
/// The identity field is fixed for the lifetime of a cache instance.
///
/// ```rust
/// use tether_cache::CacheConfig;
///
/// let config = CacheConfig::builder()
///     .id_field("_id")
///     .lock_timeout_ms(500)
///     .build()
///     .unwrap();
/// assert_eq!(config.id_field, "_id");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name of the record attribute holding the identity.
    pub id_field: String,

    /// Event lock expiry in milliseconds.
    pub lock_timeout_ms: u64,

    /// Capacity of the update broadcast channel.
    pub update_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            id_field: DEFAULT_ID_FIELD.to_string(),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            update_capacity: DEFAULT_UPDATE_CAPACITY,
        }
    }
}

impl CacheConfig {
    /// Create a new configuration builder.
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::new()
    }

    /// Event lock expiry as a [`Duration`].
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Config` if the identity field is blank, or if
    /// the lock timeout or update capacity is zero.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.id_field.trim().is_empty() {
            return Err(CacheError::Config(
                "identity field name cannot be empty".to_string(),
            ));
        }
        if self.lock_timeout_ms == 0 {
            return Err(CacheError::Config(
                "lock timeout must be at least 1ms".to_string(),
            ));
        }
        if self.update_capacity == 0 {
            return Err(CacheError::Config(
                "update channel capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`CacheConfig`].
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
        }
    }

    /// Set the identity field name.
    pub fn id_field(mut self, field: impl Into<String>) -> Self {
        self.config.id_field = field.into();
        self
    }

    /// Set the event lock expiry in milliseconds.
    pub fn lock_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lock_timeout_ms = ms;
        self
    }

    /// Set the update broadcast capacity.
    pub fn update_capacity(mut self, capacity: usize) -> Self {
        self.config.update_capacity = capacity;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<CacheConfig, CacheError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.id_field, "id");
        assert_eq!(config.lock_timeout(), Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_blank_id_field() {
        let err = CacheConfig::builder().id_field("  ").build().unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn test_builder_rejects_zero_timeout() {
        assert!(CacheConfig::builder().lock_timeout_ms(0).build().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: CacheConfig = serde_json::from_str(r#"{"id_field": "_id"}"#).unwrap();
        assert_eq!(config.id_field, "_id");
        assert_eq!(config.lock_timeout_ms, DEFAULT_LOCK_TIMEOUT_MS);
        assert_eq!(config.update_capacity, DEFAULT_UPDATE_CAPACITY);
    }
}
