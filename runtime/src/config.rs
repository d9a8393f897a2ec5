//! Client configuration.
//!
//! Configuration can be built in code or loaded from TOML:
//!
//! ```
//! use apiflow_runtime::config::{ClientConfig, StorageType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::from_toml_str(r#"
//!     storage_type = "memory"
//!     cacheable_header_keys = ["x-tenant"]
//!
//!     [cache]
//!     ttl_ms = 60000
//!     invalidate_on_error = true
//!
//!     [[cache.rules]]
//!     method = "getUser"
//!     ttl_ms = 5000
//!     tags = ["users"]
//! "#)?;
//!
//! assert_eq!(config.storage_type, StorageType::Memory);
//! assert_eq!(config.global_ttl_ms(), Some(60_000));
//! # Ok(())
//! # }
//! ```
//!
//! The `cache` key is tri-state: absent (no global signal), a boolean, or a
//! table of [`CacheOptions`].

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default TTL when caching is on but nothing configures one (30 minutes).
pub const DEFAULT_TTL_MS: u64 = 30 * 60 * 1000;

/// Default interval of the expired-entry sweeper.
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 60 * 1000;

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Backing store for cache entries and endpoint state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Process-local [`MemoryStore`](crate::store::MemoryStore)
    #[default]
    Memory,
    /// Caller-supplied persistent store
    Persistent,
}

/// Global or endpoint cache switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheSetting {
    /// `true` / `false`
    Toggle(bool),
    /// Detailed options (decision falls through to rules and TTL)
    Options(CacheOptions),
}

/// Expired-entry sweeper settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupOptions {
    /// Run the sweeper
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sweep interval
    #[serde(default = "default_cleanup_interval")]
    pub interval_ms: u64,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
        }
    }
}

/// Per-endpoint cache rule.
///
/// `method` names the endpoint (API method) the rule applies to; a trailing
/// `*` matches every endpoint starting with the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRule {
    /// Endpoint name or `prefix*`
    pub method: String,
    /// TTL for matching endpoints
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    /// Extra tags stamped on matching entries
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CacheRule {
    /// Whether the rule applies to `endpoint_name`.
    #[must_use]
    pub fn matches(&self, endpoint_name: &str) -> bool {
        match self.method.strip_suffix('*') {
            Some(prefix) => endpoint_name.starts_with(prefix),
            None => self.method == endpoint_name,
        }
    }
}

/// Global cache options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Global TTL
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    /// Sweeper settings
    #[serde(default)]
    pub cleanup: CleanupOptions,
    /// Invalidate endpoint tags when a call fails
    #[serde(default)]
    pub invalidate_on_error: bool,
    /// Per-endpoint rules
    #[serde(default)]
    pub rules: Vec<CacheRule>,
}

/// Top-level client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Backing store type
    #[serde(default)]
    pub storage_type: StorageType,
    /// Global cache setting (`None` = no global signal)
    #[serde(default)]
    pub cache: Option<CacheSetting>,
    /// Header names eligible for the cache key on every endpoint
    #[serde(default)]
    pub cacheable_header_keys: Vec<String>,
}

impl ClientConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Validation`] for invalid values.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] when a TTL or sweep interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Some(options) = self.cache_options() else {
            return Ok(());
        };
        if options.ttl_ms == Some(0) {
            return Err(ConfigError::Validation("cache.ttl_ms must be > 0".to_string()));
        }
        if options.cleanup.enabled && options.cleanup.interval_ms == 0 {
            return Err(ConfigError::Validation(
                "cache.cleanup.interval_ms must be > 0".to_string(),
            ));
        }
        if let Some(rule) = options.rules.iter().find(|rule| rule.ttl_ms == Some(0)) {
            return Err(ConfigError::Validation(format!(
                "cache rule '{}' has ttl_ms = 0",
                rule.method
            )));
        }
        Ok(())
    }

    /// Builder: set the storage type
    #[must_use]
    pub const fn with_storage(mut self, storage_type: StorageType) -> Self {
        self.storage_type = storage_type;
        self
    }

    /// Builder: set the global cache setting
    #[must_use]
    pub fn with_cache(mut self, cache: CacheSetting) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Builder: add a globally cache-key-eligible header
    #[must_use]
    pub fn with_cacheable_header(mut self, name: impl Into<String>) -> Self {
        self.cacheable_header_keys.push(name.into());
        self
    }

    /// Detailed cache options, when configured.
    #[must_use]
    pub const fn cache_options(&self) -> Option<&CacheOptions> {
        match &self.cache {
            Some(CacheSetting::Options(options)) => Some(options),
            _ => None,
        }
    }

    /// Global TTL, when configured.
    #[must_use]
    pub fn global_ttl_ms(&self) -> Option<u64> {
        self.cache_options().and_then(|options| options.ttl_ms)
    }

    /// Whether failed calls invalidate endpoint tags.
    #[must_use]
    pub fn invalidate_on_error(&self) -> bool {
        self.cache_options()
            .is_some_and(|options| options.invalidate_on_error)
    }

    /// Sweep interval; only set when a global TTL exists, cleanup is enabled
    /// and the interval is non-zero.
    #[must_use]
    pub fn cleanup_interval(&self) -> Option<Duration> {
        let options = self.cache_options()?;
        options.ttl_ms?;
        (options.cleanup.enabled && options.cleanup.interval_ms > 0)
            .then(|| Duration::from_millis(options.cleanup.interval_ms))
    }
}

const fn default_true() -> bool {
    true
}

const fn default_cleanup_interval() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_accepts_boolean() -> Result<(), ConfigError> {
        let config = ClientConfig::from_toml_str("cache = false")?;
        assert_eq!(config.cache, Some(CacheSetting::Toggle(false)));
        assert_eq!(config.cleanup_interval(), None);
        Ok(())
    }

    #[test]
    fn absent_cache_is_no_signal() -> Result<(), ConfigError> {
        let config = ClientConfig::from_toml_str("")?;
        assert_eq!(config.cache, None);
        assert_eq!(config.storage_type, StorageType::Memory);
        Ok(())
    }

    #[test]
    fn cleanup_requires_ttl() -> Result<(), ConfigError> {
        let config = ClientConfig::from_toml_str("[cache]\ninvalidate_on_error = true")?;
        assert!(config.invalidate_on_error());
        assert_eq!(config.cleanup_interval(), None);

        let config = ClientConfig::from_toml_str("[cache]\nttl_ms = 1000")?;
        assert_eq!(
            config.cleanup_interval(),
            Some(Duration::from_millis(DEFAULT_CLEANUP_INTERVAL_MS))
        );
        Ok(())
    }

    #[test]
    fn zero_cleanup_interval_never_yields_a_sweep_interval() {
        let config = ClientConfig::default().with_cache(CacheSetting::Options(CacheOptions {
            ttl_ms: Some(1000),
            cleanup: CleanupOptions {
                enabled: true,
                interval_ms: 0,
            },
            ..CacheOptions::default()
        }));
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
        assert_eq!(config.cleanup_interval(), None);
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let result = ClientConfig::from_toml_str("[cache]\nttl_ms = 0");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let result = ClientConfig::from_toml_str("cache = [");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn rules_match_names_and_prefixes() {
        let exact = CacheRule {
            method: "getUser".into(),
            ttl_ms: None,
            tags: vec![],
        };
        let prefix = CacheRule {
            method: "list*".into(),
            ..exact.clone()
        };
        assert!(exact.matches("getUser"));
        assert!(!exact.matches("getUsers"));
        assert!(prefix.matches("listUsers"));
        assert!(!prefix.matches("getUser"));
    }
}
