//! Session configuration.
//!
//! [`SessionConfig`] deserializes from any serde format; missing keys take their defaults.

use serde::{Deserialize, Serialize};

/// What `wrap` does with a required field that a partial projection never loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialWritePolicy {
    /// Fail with [`MapperError::FieldNotRetrieved`](crate::error::MapperError::FieldNotRetrieved).
    #[default]
    Error,
    /// Leave the field out of the written document.
    SkipIfUnfetched,
}

/// Tunables of a [`Session`](crate::session::Session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the identity cache; `0` disables caching.
    pub cache_size: usize,
    /// Ensure a schema's indexes before the first operation touching it.
    pub auto_ensure_indexes: bool,
    /// Default acknowledgement flag for enqueued operations.
    pub safe: bool,
    /// Group consecutive same-collection operations into one ordered bulk write.
    pub bulk_writes: bool,
    pub partial_write_policy: PartialWritePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_size: 10_000,
            auto_ensure_indexes: false,
            safe: true,
            bulk_writes: true,
            partial_write_policy: PartialWritePolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.config.cache_size = cache_size;
        self
    }

    pub fn with_auto_ensure_indexes(mut self, enabled: bool) -> Self {
        self.config.auto_ensure_indexes = enabled;
        self
    }

    pub fn with_safe(mut self, safe: bool) -> Self {
        self.config.safe = safe;
        self
    }

    pub fn with_bulk_writes(mut self, enabled: bool) -> Self {
        self.config.bulk_writes = enabled;
        self
    }

    pub fn with_partial_write_policy(mut self, policy: PartialWritePolicy) -> Self {
        self.config.partial_write_policy = policy;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = SessionConfig::builder()
            .with_cache_size(0)
            .with_partial_write_policy(PartialWritePolicy::SkipIfUnfetched)
            .build();

        assert_eq!(config.cache_size, 0);
        assert_eq!(config.partial_write_policy, PartialWritePolicy::SkipIfUnfetched);
        assert!(config.safe);
        assert!(config.bulk_writes);
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"cache_size": 16, "partial_write_policy": "skip_if_unfetched"}"#).unwrap();

        assert_eq!(config.cache_size, 16);
        assert_eq!(config.partial_write_policy, PartialWritePolicy::SkipIfUnfetched);
        assert!(config.safe);
        assert!(!config.auto_ensure_indexes);
    }
}
