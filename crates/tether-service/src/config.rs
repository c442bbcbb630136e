//! Service configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use tether_cache::CacheConfig;

use crate::ServiceError;

/// Field holding the temporary identity of a record not yet saved.
pub const TEMP_ID_FIELD: &str = "__tempId";

/// Default maximum number of realtime events buffered before a flush.
pub const DEFAULT_MAX_BATCH: usize = 256;

/// Configuration for a [`Service`](crate::Service) and its realtime listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Cache settings.
    pub cache: CacheConfig,

    /// Apply writes to the cache before the server confirms them.
    pub optimistic: bool,

    /// Quiet period before buffered realtime events are applied.
    /// `None` applies each event as it arrives.
    pub debounce_ms: Option<u64>,

    /// Flush buffered events once this many are queued.
    pub max_batch: usize,

    /// Storage key used by [`Service::hydrate`](crate::Service::hydrate),
    /// [`Service::persist`](crate::Service::persist) and
    /// [`Service::sync_storage`](crate::Service::sync_storage).
    pub storage_key: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            optimistic: true,
            debounce_ms: None,
            max_batch: DEFAULT_MAX_BATCH,
            storage_key: None,
        }
    }
}

impl ServiceConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::new()
    }

    pub fn debounce(&self) -> Option<Duration> {
        self.debounce_ms.map(Duration::from_millis)
    }

    /// Validate the configuration, including the cache section.
    pub fn validate(&self) -> Result<(), ServiceError> {
        self.cache.validate()?;
        if self.max_batch == 0 {
            return Err(ServiceError::Config(
                "max_batch must be at least 1".to_string(),
            ));
        }
        if let Some(key) = &self.storage_key {
            if key.is_empty() {
                return Err(ServiceError::Config(
                    "storage key cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug, Default)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ServiceConfig::default(),
        }
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn optimistic(mut self, optimistic: bool) -> Self {
        self.config.optimistic = optimistic;
        self
    }

    pub fn debounce_ms(mut self, ms: u64) -> Self {
        self.config.debounce_ms = Some(ms);
        self
    }

    pub fn max_batch(mut self, max_batch: usize) -> Self {
        self.config.max_batch = max_batch;
        self
    }

    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.config.storage_key = Some(key.into());
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<ServiceConfig, ServiceError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.optimistic);
        assert_eq!(config.debounce(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nested_cache_config_is_validated() {
        let err = ServiceConfig::builder()
            .cache(CacheConfig {
                id_field: String::new(),
                ..CacheConfig::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, ServiceError::Cache(_)));
    }

    #[test]
    fn test_rejects_zero_batch() {
        assert!(matches!(
            ServiceConfig::builder().max_batch(0).build(),
            Err(ServiceError::Config(_))
        ));
    }

    #[test]
    fn test_deserialize() {
        let config: ServiceConfig = serde_json::from_str(
            r#"{"cache": {"id_field": "_id"}, "debounce_ms": 20, "optimistic": false}"#,
        )
        .unwrap();
        assert_eq!(config.cache.id_field, "_id");
        assert_eq!(config.debounce(), Some(Duration::from_millis(20)));
        assert!(!config.optimistic);
        assert_eq!(config.max_batch, DEFAULT_MAX_BATCH);
    }
}
