//! Tag/TTL cache manager.
//!
//! The cache manager owns every `api:` key in the store. It decides whether
//! a call is cacheable, derives stable keys from request descriptions,
//! stamps TTL and tag metadata, sweeps expired entries and invalidates by
//! tag.
//!
//! # Key derivation
//!
//! ```text
//! api:<endpoint>:<sha256(canonical key_params)>
//!
//! key_params = { method, path, query: "<canonical json>", headers: "<canonical json>" }
//! ```
//!
//! Null and empty fields are pruned and maps are sorted before hashing, so
//! requests that differ only in absent fields share a key. Only headers named
//! in the call's allow-list take part; everything else (trace ids, auth
//! tokens, ...) never fragments the cache.
//!
//! # Failure policy
//!
//! Cache I/O is best-effort. Store failures are logged and reported as a
//! miss or a no-op; they never fail the call that triggered them.

use crate::config::{CacheSetting, ClientConfig, DEFAULT_TTL_MS};
use apiflow_core::environment::Clock;
use apiflow_core::store::{CACHE_NAMESPACE, KeyValueStore};
use apiflow_core::{ExecutionOptions, RequestDescription, ResultEnvelope};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Capacity of the notification channel.
const NOTIFICATION_CAPACITY: usize = 256;

/// Endpoint-level cache override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCacheOptions {
    /// TTL for this endpoint's entries
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

/// Endpoint cache switch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Defer to the global policy
    #[default]
    Inherit,
    /// Never cache this endpoint
    Disabled,
    /// Cache this endpoint, optionally with its own TTL
    Enabled(Option<EndpointCacheOptions>),
}

impl CachePolicy {
    /// Enabled with a TTL override (saturating at `u64::MAX` milliseconds).
    #[must_use]
    pub fn ttl(ttl: Duration) -> Self {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Self::Enabled(Some(EndpointCacheOptions {
            ttl_ms: Some(ttl_ms),
        }))
    }
}

/// Cache-relevant slice of an endpoint configuration.
#[derive(Debug, Clone, Copy)]
pub struct CacheScope<'a> {
    /// Endpoint cache switch
    pub policy: &'a CachePolicy,
    /// Tags stamped on the endpoint's entries
    pub tags: &'a [String],
    /// Tags invalidated after the endpoint writes
    pub invalidates_tags: &'a [String],
}

/// Bookkeeping stored with each entry (epoch milliseconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    /// Write time
    pub created_at: i64,
    /// Last write or read time
    pub updated_at: i64,
    /// Expiry time; `expires_at >= created_at`
    pub expires_at: i64,
    /// Number of hits served
    #[serde(default)]
    pub access_count: u64,
    /// Invalidation tags
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CacheMetadata {
    /// Whether the entry is expired at `now`.
    #[must_use]
    pub const fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// A stored cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Cached envelope
    pub data: ResultEnvelope,
    /// Canonical key parameters the entry was stored under
    #[serde(default)]
    pub key_params: Value,
    /// TTL and tags
    pub metadata: CacheMetadata,
}

/// A derived cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    /// Store key (`api:<endpoint>:<digest>`)
    pub key: String,
    /// Canonical parameters the digest was computed from
    pub params: Value,
}

/// Observability notifications from the cache manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheNotification {
    /// A lookup was answered from the cache
    Hit {
        /// Endpoint name
        endpoint: String,
        /// Store key
        key: String,
    },
    /// A lookup found nothing usable
    Miss {
        /// Endpoint name
        endpoint: String,
        /// Store key
        key: String,
    },
    /// An entry was written
    Set {
        /// Endpoint name
        endpoint: String,
        /// Store key
        key: String,
        /// Applied TTL
        ttl_ms: u64,
    },
    /// Entries were invalidated by tag
    Invalidate {
        /// Tags requested
        tags: Vec<String>,
        /// Entries removed
        removed: usize,
    },
    /// Expired entries were swept
    Cleanup {
        /// Entries removed
        removed: usize,
    },
}

/// Owns TTL/tag metadata and every `api:` key.
pub struct CacheManager {
    store: Arc<dyn KeyValueStore>,
    config: Arc<ClientConfig>,
    clock: Arc<dyn Clock>,
    notifications: broadcast::Sender<CacheNotification>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    /// Create a cache manager over `store`.
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: Arc<ClientConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            store,
            config,
            clock,
            notifications,
        }
    }

    /// Receive hit/miss/set/invalidate/cleanup notifications.
    #[must_use]
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<CacheNotification> {
        self.notifications.subscribe()
    }

    fn notify(&self, notification: CacheNotification) {
        // No receivers is fine
        let _ = self.notifications.send(notification);
    }

    /// Decide whether a call is cacheable.
    ///
    /// First decisive signal wins: per-call override, endpoint policy,
    /// global `true`/`false`, a matching rule, a global TTL. No signal means
    /// no caching.
    #[must_use]
    pub fn should_cache(
        &self,
        endpoint_name: &str,
        scope: Option<&CacheScope<'_>>,
        options: Option<&ExecutionOptions>,
    ) -> bool {
        if let Some(options) = options {
            if options.disable_cache {
                return false;
            }
            if options.enable_cache {
                return true;
            }
        }

        if let Some(scope) = scope {
            match scope.policy {
                CachePolicy::Disabled => return false,
                CachePolicy::Enabled(_) => return true,
                CachePolicy::Inherit => {}
            }
        }

        match &self.config.cache {
            Some(CacheSetting::Toggle(enabled)) => *enabled,
            Some(CacheSetting::Options(options)) => {
                options.rules.iter().any(|rule| rule.matches(endpoint_name))
                    || options.ttl_ms.is_some()
            }
            None => false,
        }
    }

    /// TTL for an endpoint: endpoint override, matching rule, global TTL, then 30 minutes.
    #[must_use]
    pub fn cache_ttl(&self, endpoint_name: &str, scope: Option<&CacheScope<'_>>) -> u64 {
        if let Some(CachePolicy::Enabled(Some(EndpointCacheOptions { ttl_ms: Some(ttl) }))) =
            scope.map(|scope| scope.policy)
        {
            return *ttl;
        }

        let Some(options) = self.config.cache_options() else {
            return DEFAULT_TTL_MS;
        };
        options
            .rules
            .iter()
            .filter(|rule| rule.matches(endpoint_name))
            .find_map(|rule| rule.ttl_ms)
            .or(options.ttl_ms)
            .unwrap_or(DEFAULT_TTL_MS)
    }

    fn rule_tags(&self, endpoint_name: &str) -> Vec<String> {
        self.config
            .cache_options()
            .map(|options| {
                options
                    .rules
                    .iter()
                    .filter(|rule| rule.matches(endpoint_name))
                    .flat_map(|rule| rule.tags.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Derive the cache key for a request.
    ///
    /// Allow-listed headers are read from the request first; `result`
    /// metadata only fills names the request does not carry.
    #[must_use]
    pub fn create_cache_key(
        &self,
        endpoint_name: &str,
        request: &RequestDescription,
        options: Option<&ExecutionOptions>,
        result: Option<&ResultEnvelope>,
    ) -> CacheKey {
        create_cache_key(endpoint_name, request, options, result)
    }

    /// Look up a cached envelope.
    pub async fn get(
        &self,
        endpoint_name: &str,
        request: &RequestDescription,
        options: Option<&ExecutionOptions>,
    ) -> Option<CacheEntry> {
        let key = self.create_cache_key(endpoint_name, request, options, None);
        self.get_at(endpoint_name, &key).await
    }

    /// Look up the entry stored under an already-derived key.
    pub async fn get_at(&self, endpoint_name: &str, key: &CacheKey) -> Option<CacheEntry> {
        let raw = match self.store.get(&key.key).await {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(endpoint = endpoint_name, key = %key.key, %error, "Cache read failed");
                None
            }
        };

        let Some(raw) = raw else {
            self.record_miss(endpoint_name, &key.key);
            return None;
        };

        let now = self.clock.now_millis();
        let Some(mut entry) = decode_entry(raw, &key.params, now) else {
            tracing::warn!(endpoint = endpoint_name, key = %key.key, "Dropping unreadable cache entry");
            self.delete_quietly(&key.key).await;
            self.record_miss(endpoint_name, &key.key);
            return None;
        };

        if entry.metadata.is_expired(now) {
            tracing::debug!(endpoint = endpoint_name, key = %key.key, "Cache entry expired");
            self.delete_quietly(&key.key).await;
            self.record_miss(endpoint_name, &key.key);
            return None;
        }

        entry.metadata.access_count += 1;
        entry.metadata.updated_at = now;
        self.write_entry(&key.key, &entry).await;

        tracing::debug!(endpoint = endpoint_name, key = %key.key, "Cache hit");
        metrics::counter!("apiflow_cache_hits_total", "endpoint" => endpoint_name.to_string())
            .increment(1);
        self.notify(CacheNotification::Hit {
            endpoint: endpoint_name.to_string(),
            key: key.key.clone(),
        });
        Some(entry)
    }

    fn record_miss(&self, endpoint_name: &str, key: &str) {
        tracing::debug!(endpoint = endpoint_name, key, "Cache miss");
        metrics::counter!("apiflow_cache_misses_total", "endpoint" => endpoint_name.to_string())
            .increment(1);
        self.notify(CacheNotification::Miss {
            endpoint: endpoint_name.to_string(),
            key: key.to_string(),
        });
    }

    /// Store an envelope, then invalidate the endpoint's `invalidates_tags`.
    pub async fn set(
        &self,
        endpoint_name: &str,
        scope: Option<&CacheScope<'_>>,
        request: &RequestDescription,
        result: &ResultEnvelope,
        options: Option<&ExecutionOptions>,
    ) {
        let key = self.create_cache_key(endpoint_name, request, options, Some(result));
        self.set_at(endpoint_name, scope, &key, result).await;
    }

    /// Store an envelope under an already-derived key.
    pub async fn set_at(
        &self,
        endpoint_name: &str,
        scope: Option<&CacheScope<'_>>,
        key: &CacheKey,
        result: &ResultEnvelope,
    ) {
        let ttl_ms = self.cache_ttl(endpoint_name, scope);
        let now = self.clock.now_millis();

        let mut tags: Vec<String> = scope.map(|scope| scope.tags.to_vec()).unwrap_or_default();
        for tag in self.rule_tags(endpoint_name) {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        let entry = CacheEntry {
            data: result.clone(),
            key_params: key.params.clone(),
            metadata: CacheMetadata {
                created_at: now,
                updated_at: now,
                expires_at: now.saturating_add(i64::try_from(ttl_ms).unwrap_or(i64::MAX)),
                access_count: 0,
                tags,
            },
        };

        if !self.write_entry(&key.key, &entry).await {
            return;
        }

        tracing::debug!(endpoint = endpoint_name, key = %key.key, ttl_ms, "Cache entry stored");
        metrics::counter!("apiflow_cache_writes_total", "endpoint" => endpoint_name.to_string())
            .increment(1);
        self.notify(CacheNotification::Set {
            endpoint: endpoint_name.to_string(),
            key: key.key.clone(),
            ttl_ms,
        });

        if let Some(scope) = scope.filter(|scope| !scope.invalidates_tags.is_empty()) {
            self.invalidate_tags_except(scope.invalidates_tags, Some(&key.key))
                .await;
        }
    }

    async fn write_entry(&self, key: &str, entry: &CacheEntry) -> bool {
        let value = match serde_json::to_value(entry) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(key, %error, "Failed to encode cache entry");
                return false;
            }
        };
        match self.store.set(key, value).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(key, %error, "Cache write failed");
                false
            }
        }
    }

    async fn delete_quietly(&self, key: &str) -> bool {
        match self.store.delete(key).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(key, %error, "Cache delete failed");
                false
            }
        }
    }

    async fn cache_keys(&self) -> Vec<String> {
        match self.store.keys().await {
            Ok(keys) => keys
                .into_iter()
                .filter(|key| key.starts_with(CACHE_NAMESPACE))
                .collect(),
            Err(error) => {
                tracing::warn!(%error, "Failed to list cache keys");
                Vec::new()
            }
        }
    }

    /// Delete every entry whose tags intersect `tags`. Returns the number removed.
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        self.invalidate_tags_except(tags, None).await
    }

    async fn invalidate_tags_except(&self, tags: &[String], keep: Option<&str>) -> usize {
        if tags.is_empty() {
            return 0;
        }

        let mut removed = 0;
        for key in self.cache_keys().await {
            if keep == Some(key.as_str()) {
                continue;
            }
            let raw = match self.store.get(&key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(error) => {
                    tracing::warn!(key, %error, "Cache read failed during invalidation");
                    continue;
                }
            };
            if entry_tags(&raw).iter().any(|tag| tags.contains(tag)) && self.delete_quietly(&key).await {
                removed += 1;
            }
        }

        tracing::debug!(?tags, removed, "Invalidated cache entries by tag");
        metrics::counter!("apiflow_cache_invalidations_total").increment(removed as u64);
        self.notify(CacheNotification::Invalidate {
            tags: tags.to_vec(),
            removed,
        });
        removed
    }

    /// Delete every entry of one endpoint. Returns the number removed.
    pub async fn invalidate_endpoint(&self, endpoint_name: &str) -> usize {
        let prefix = format!("{CACHE_NAMESPACE}{endpoint_name}:");
        let mut removed = 0;
        for key in self.cache_keys().await {
            if key.starts_with(&prefix) && self.delete_quietly(&key).await {
                removed += 1;
            }
        }
        removed
    }

    /// Delete expired and unreadable entries. Returns the number removed.
    pub async fn clear_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;
        for key in self.cache_keys().await {
            let expired = match self.store.get(&key).await {
                Ok(Some(raw)) => entry_expires_at(&raw).is_none_or(|expires_at| now >= expires_at),
                Ok(None) => false,
                Err(error) => {
                    tracing::warn!(key, %error, "Cache read failed during cleanup");
                    false
                }
            };
            if expired && self.delete_quietly(&key).await {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!(removed, "Swept expired cache entries");
        }
        self.notify(CacheNotification::Cleanup { removed });
        removed
    }

    /// Delete every cache entry. Returns the number removed.
    pub async fn clear_all(&self) -> usize {
        let mut removed = 0;
        for key in self.cache_keys().await {
            if self.delete_quietly(&key).await {
                removed += 1;
            }
        }
        self.notify(CacheNotification::Cleanup { removed });
        removed
    }

    /// Start the periodic sweeper.
    ///
    /// Must be called from within a tokio runtime. Cancel the returned token
    /// to stop it. A zero interval starts nothing and returns a cancelled
    /// token.
    #[must_use]
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        if interval.is_zero() {
            tracing::warn!("Zero cleanup interval, expired-entry sweeper not started");
            cancel.cancel();
            return cancel;
        }
        let cancel_clone = cancel.clone();
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            tracing::debug!(interval_ms = interval.as_millis(), "Cache cleanup task started");
            loop {
                tokio::select! {
                    () = cancel_clone.cancelled() => {
                        tracing::debug!("Cache cleanup task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.clear_expired().await;
                    }
                }
            }
        });

        cancel
    }
}

/// Pure key derivation shared by [`CacheManager::create_cache_key`].
#[must_use]
pub fn create_cache_key(
    endpoint_name: &str,
    request: &RequestDescription,
    options: Option<&ExecutionOptions>,
    result: Option<&ResultEnvelope>,
) -> CacheKey {
    let mut params = Map::new();
    params.insert("method".to_string(), Value::from(request.method.as_str()));
    params.insert("path".to_string(), Value::from(request.path.clone()));

    let query = prune(Value::Object(
        request
            .query
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    ));
    if let Some(query) = query {
        params.insert("query".to_string(), Value::from(query.to_string()));
    }

    if let Some(headers) = keyed_headers(request, options, result) {
        params.insert("headers".to_string(), Value::from(headers.to_string()));
    }

    let params = prune(Value::Object(params)).unwrap_or(Value::Null);
    let digest = hex::encode(Sha256::digest(params.to_string().as_bytes()));

    CacheKey {
        key: format!("{CACHE_NAMESPACE}{endpoint_name}:{digest}"),
        params,
    }
}

fn keyed_headers(
    request: &RequestDescription,
    options: Option<&ExecutionOptions>,
    result: Option<&ResultEnvelope>,
) -> Option<Value> {
    let allow = options.map(|options| options.cacheable_header_keys.as_slice())?;
    if allow.is_empty() {
        return None;
    }

    let metadata = result.and_then(|result| result.metadata.as_ref());
    let find = |headers: &BTreeMap<String, String>, name: &str| {
        headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    };

    let mut selected = Map::new();
    for name in allow {
        let value = request.header(name).map(str::to_string).or_else(|| {
            metadata.and_then(|metadata| {
                find(&metadata.cacheable_headers, name).or_else(|| find(&metadata.request_headers, name))
            })
        });
        if let Some(value) = value {
            selected.insert(name.to_ascii_lowercase(), Value::from(value));
        }
    }

    prune(Value::Object(selected))
}

/// Remove nulls, empty strings, empty arrays and empty objects, recursively.
fn prune(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::Array(items) => {
            let items: Vec<Value> = items.into_iter().filter_map(prune).collect();
            (!items.is_empty()).then_some(Value::Array(items))
        }
        Value::Object(map) => {
            let map: Map<String, Value> = map
                .into_iter()
                .filter_map(|(key, value)| prune(value).map(|value| (key, value)))
                .collect();
            (!map.is_empty()).then_some(Value::Object(map))
        }
        other => Some(other),
    }
}

/// Decode any supported storage shape into an entry.
///
/// Shapes, newest first: full entry, `{data: envelope}`, bare envelope.
/// Older shapes carry no metadata and are stamped with the default TTL.
fn decode_entry(raw: Value, key_params: &Value, now: i64) -> Option<CacheEntry> {
    if raw.get("metadata").is_some() {
        return serde_json::from_value(raw).ok();
    }

    let envelope = match raw.get("data") {
        Some(data) if data.get("ok").is_some() => data.clone(),
        _ if raw.get("ok").is_some() => raw,
        _ => return None,
    };
    let data: ResultEnvelope = serde_json::from_value(envelope).ok()?;

    Some(CacheEntry {
        data,
        key_params: key_params.clone(),
        metadata: CacheMetadata {
            created_at: now,
            updated_at: now,
            expires_at: now.saturating_add(i64::try_from(DEFAULT_TTL_MS).unwrap_or(i64::MAX)),
            access_count: 0,
            tags: Vec::new(),
        },
    })
}

fn entry_tags(raw: &Value) -> Vec<String> {
    raw.get("metadata")
        .and_then(|metadata| metadata.get("tags"))
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn entry_expires_at(raw: &Value) -> Option<i64> {
    if raw.get("metadata").is_none() && (raw.get("ok").is_some() || raw.get("data").is_some()) {
        // Legacy shapes have no expiry; they are re-stamped on read
        return Some(i64::MAX);
    }
    raw.get("metadata")
        .and_then(|metadata| metadata.get("expiresAt"))
        .and_then(Value::as_i64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::config::{CacheOptions, CacheRule};
    use crate::store::MemoryStore;
    use apiflow_core::Method;
    use apiflow_testing::ManualClock;
    use proptest::prelude::*;
    use serde_json::json;

    fn manager(config: ClientConfig) -> (CacheManager, MemoryStore, ManualClock) {
        let store = MemoryStore::new();
        let clock = ManualClock::new();
        let manager = CacheManager::new(
            Arc::new(store.clone()),
            Arc::new(config),
            Arc::new(clock.clone()),
        );
        (manager, store, clock)
    }

    fn scope<'a>(policy: &'a CachePolicy, tags: &'a [String], invalidates: &'a [String]) -> CacheScope<'a> {
        CacheScope {
            policy,
            tags,
            invalidates_tags: invalidates,
        }
    }

    fn options_with_ttl(ttl_ms: u64) -> ClientConfig {
        ClientConfig::default().with_cache(CacheSetting::Options(CacheOptions {
            ttl_ms: Some(ttl_ms),
            ..CacheOptions::default()
        }))
    }

    #[test]
    fn should_cache_resolution_order() {
        let (global_off, _, _) = manager(ClientConfig::default().with_cache(CacheSetting::Toggle(false)));
        let enabled = CachePolicy::Enabled(None);
        let endpoint_on = scope(&enabled, &[], &[]);

        // Endpoint beats global
        assert!(global_off.should_cache("e", Some(&endpoint_on), None));
        // Call beats endpoint
        let off = ExecutionOptions::new().disable_cache();
        assert!(!global_off.should_cache("e", Some(&endpoint_on), Some(&off)));
        // Disable beats enable on the same call
        let both = ExecutionOptions::new().enable_cache().disable_cache();
        assert!(!global_off.should_cache("e", None, Some(&both)));
        // Global false
        assert!(!global_off.should_cache("e", None, None));

        let (global_on, _, _) = manager(ClientConfig::default().with_cache(CacheSetting::Toggle(true)));
        let disabled = CachePolicy::Disabled;
        assert!(!global_on.should_cache("e", Some(&scope(&disabled, &[], &[])), None));
        assert!(global_on.should_cache("e", None, None));
    }

    #[test]
    fn should_cache_falls_back_to_rules_then_ttl() {
        let rules_only = ClientConfig::default().with_cache(CacheSetting::Options(CacheOptions {
            rules: vec![CacheRule {
                method: "getUser".into(),
                ttl_ms: Some(10),
                tags: vec![],
            }],
            ..CacheOptions::default()
        }));
        let (manager_rules, _, _) = manager(rules_only);
        assert!(manager_rules.should_cache("getUser", None, None));
        assert!(!manager_rules.should_cache("listUsers", None, None));

        let (manager_ttl, _, _) = manager(options_with_ttl(1000));
        assert!(manager_ttl.should_cache("anything", None, None));

        let (manager_none, _, _) = manager(ClientConfig::default());
        assert!(!manager_none.should_cache("anything", None, None));
    }

    #[test]
    fn ttl_resolution_order() {
        let config = ClientConfig::default().with_cache(CacheSetting::Options(CacheOptions {
            ttl_ms: Some(5_000),
            rules: vec![CacheRule {
                method: "get*".into(),
                ttl_ms: Some(2_000),
                tags: vec![],
            }],
            ..CacheOptions::default()
        }));
        let (manager, _, _) = manager(config);

        let endpoint_ttl = CachePolicy::ttl(Duration::from_millis(700));
        assert_eq!(manager.cache_ttl("getUser", Some(&scope(&endpoint_ttl, &[], &[]))), 700);
        assert_eq!(manager.cache_ttl("getUser", None), 2_000);
        assert_eq!(manager.cache_ttl("listUsers", None), 5_000);

        let (bare, _, _) = self::manager(ClientConfig::default());
        assert_eq!(bare.cache_ttl("x", None), DEFAULT_TTL_MS);
    }

    #[test]
    fn ttl_policy_saturates_huge_durations() {
        assert_eq!(
            CachePolicy::ttl(Duration::from_millis(1_500)),
            CachePolicy::Enabled(Some(EndpointCacheOptions { ttl_ms: Some(1_500) }))
        );
        assert_eq!(
            CachePolicy::ttl(Duration::MAX),
            CachePolicy::Enabled(Some(EndpointCacheOptions { ttl_ms: Some(u64::MAX) }))
        );
    }

    #[test]
    fn key_ignores_absent_and_empty_fields() {
        let plain = RequestDescription::get("/users").with_query("id", json!(1));
        let noisy = plain
            .clone()
            .with_query("filter", json!(null))
            .with_query("search", json!(""))
            .with_query("tags", json!([]));

        assert_eq!(
            create_cache_key("listUsers", &plain, None, None),
            create_cache_key("listUsers", &noisy, None, None)
        );
    }

    #[test]
    fn key_only_uses_allow_listed_headers() {
        let options = ExecutionOptions::new().with_cacheable_header("X-Tenant");
        let a = RequestDescription::get("/users")
            .with_header("x-tenant", "acme")
            .with_header("x-trace-id", "1");
        let b = RequestDescription::get("/users")
            .with_header("X-Tenant", "acme")
            .with_header("x-trace-id", "2");
        let c = RequestDescription::get("/users").with_header("x-tenant", "globex");

        let key_a = create_cache_key("listUsers", &a, Some(&options), None);
        assert_eq!(key_a, create_cache_key("listUsers", &b, Some(&options), None));
        assert_ne!(key_a, create_cache_key("listUsers", &c, Some(&options), None));
        assert_eq!(key_a.params["headers"], json!("{\"x-tenant\":\"acme\"}"));

        // Without an allow-list headers never matter
        assert_eq!(
            create_cache_key("listUsers", &a, None, None),
            create_cache_key("listUsers", &c, None, None)
        );
    }

    #[test]
    fn key_is_namespaced_by_endpoint() {
        let request = RequestDescription::get("/users");
        let key = create_cache_key("listUsers", &request, None, None);
        assert!(key.key.starts_with("api:listUsers:"));
        assert_eq!(key.params, json!({"method": "GET", "path": "/users"}));
        assert_ne!(key.key, create_cache_key("other", &request, None, None).key);
    }

    #[tokio::test]
    async fn round_trip_then_expiry() {
        let (manager, store, clock) = manager(options_with_ttl(1_000));
        let request = RequestDescription::get("/users/1");
        let envelope = ResultEnvelope::success(200, json!({"id": 1}));

        manager.set("getUser", None, &request, &envelope, None).await;
        let entry = manager.get("getUser", &request, None).await.unwrap();
        assert_eq!(entry.data, envelope);
        assert_eq!(entry.metadata.access_count, 1);

        clock.advance(Duration::from_millis(1_000));
        assert!(manager.get("getUser", &request, None).await.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn invalidation_is_tag_precise() {
        let (manager, store, _) = manager(options_with_ttl(60_000));
        let users = vec!["users".to_string(), "people".to_string()];
        let posts = vec!["posts".to_string()];
        let inherit = CachePolicy::Inherit;
        let envelope = ResultEnvelope::success(200, json!([]));

        let user_req = RequestDescription::get("/users");
        let post_req = RequestDescription::get("/posts");
        manager.set("listUsers", Some(&scope(&inherit, &users, &[])), &user_req, &envelope, None).await;
        manager.set("listPosts", Some(&scope(&inherit, &posts, &[])), &post_req, &envelope, None).await;

        let removed = manager.invalidate_by_tags(&["people".to_string()]).await;
        assert_eq!(removed, 1);
        assert!(manager.get("listUsers", &user_req, None).await.is_none());
        assert!(manager.get("listPosts", &post_req, None).await.is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn set_invalidates_declared_tags_but_keeps_itself() {
        let (manager, _, _) = manager(options_with_ttl(60_000));
        let inherit = CachePolicy::Inherit;
        let users = vec!["users".to_string()];
        let envelope = ResultEnvelope::success(200, json!({}));

        let list = RequestDescription::get("/users");
        manager.set("listUsers", Some(&scope(&inherit, &users, &[])), &list, &envelope, None).await;

        let update = RequestDescription::new(Method::Put, "/users/1");
        manager
            .set("updateUser", Some(&scope(&inherit, &users, &users)), &update, &envelope, None)
            .await;

        assert!(manager.get("listUsers", &list, None).await.is_none());
        assert!(manager.get("updateUser", &update, None).await.is_some());
    }

    #[tokio::test]
    async fn legacy_shapes_are_readable() {
        let (manager, store, _) = manager(options_with_ttl(60_000));
        let request = RequestDescription::get("/legacy");
        let key = manager.create_cache_key("legacy", &request, None, None);
        let envelope = ResultEnvelope::success(200, json!("old"));

        store
            .set(&key.key, json!({"data": serde_json::to_value(&envelope).unwrap()}))
            .await
            .unwrap();
        assert_eq!(manager.get("legacy", &request, None).await.unwrap().data, envelope);

        store.set(&key.key, serde_json::to_value(&envelope).unwrap()).await.unwrap();
        assert_eq!(manager.get("legacy", &request, None).await.unwrap().data, envelope);
    }

    #[tokio::test]
    async fn corrupt_entries_are_dropped_as_misses() {
        let (manager, store, _) = manager(options_with_ttl(60_000));
        let request = RequestDescription::get("/broken");
        let key = manager.create_cache_key("broken", &request, None, None);
        store.set(&key.key, json!("garbage")).await.unwrap();

        let mut notifications = manager.subscribe_notifications();
        assert!(manager.get("broken", &request, None).await.is_none());
        assert!(!store.contains_key(&key.key));
        assert!(matches!(notifications.try_recv(), Ok(CacheNotification::Miss { .. })));
    }

    #[tokio::test]
    async fn store_failures_are_misses_and_noops() {
        let manager = CacheManager::new(
            Arc::new(apiflow_testing::FailingStore::new()),
            Arc::new(options_with_ttl(1_000)),
            Arc::new(ManualClock::new()),
        );
        let request = RequestDescription::get("/x");
        manager
            .set("x", None, &request, &ResultEnvelope::success(200, json!(1)), None)
            .await;
        assert!(manager.get("x", &request, None).await.is_none());
        assert_eq!(manager.invalidate_by_tags(&["t".to_string()]).await, 0);
    }

    #[tokio::test]
    async fn clear_expired_only_removes_expired() {
        let (manager, store, clock) = manager(options_with_ttl(1_000));
        let short = CachePolicy::ttl(Duration::from_millis(100));
        let envelope = ResultEnvelope::success(200, json!(1));

        manager.set("a", Some(&scope(&short, &[], &[])), &RequestDescription::get("/a"), &envelope, None).await;
        manager.set("b", None, &RequestDescription::get("/b"), &envelope, None).await;
        store.set("endpoint:a", json!({"status": "idle"})).await.unwrap();

        clock.advance(Duration::from_millis(500));
        assert_eq!(manager.clear_expired().await, 1);
        assert_eq!(store.len(), 2);
        assert!(store.contains_key("endpoint:a"));

        assert_eq!(manager.clear_all().await, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn invalidate_endpoint_only_touches_its_namespace() {
        let (manager, store, _) = manager(options_with_ttl(60_000));
        let envelope = ResultEnvelope::success(200, json!(1));
        manager.set("getUser", None, &RequestDescription::get("/u/1"), &envelope, None).await;
        manager.set("getUser", None, &RequestDescription::get("/u/2"), &envelope, None).await;
        manager.set("getUserPosts", None, &RequestDescription::get("/u/1/p"), &envelope, None).await;

        assert_eq!(manager.invalidate_endpoint("getUser").await, 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_until_cancelled() {
        let store = MemoryStore::new();
        let clock = ManualClock::new();
        let manager = Arc::new(CacheManager::new(
            Arc::new(store.clone()),
            Arc::new(options_with_ttl(10)),
            Arc::new(clock.clone()),
        ));
        manager
            .set("a", None, &RequestDescription::get("/a"), &ResultEnvelope::success(200, json!(1)), None)
            .await;
        clock.advance(Duration::from_millis(20));

        let mut notifications = manager.subscribe_notifications();
        let cancel = manager.spawn_cleanup(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert!(matches!(
            notifications.recv().await,
            Ok(CacheNotification::Cleanup { removed: 1 })
        ));
        assert!(store.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn zero_interval_sweeper_is_not_started() {
        let (manager, _, _) = manager(options_with_ttl(10));
        let cancel = Arc::new(manager).spawn_cleanup(Duration::ZERO);
        assert!(cancel.is_cancelled());
    }

    proptest! {
        #[test]
        fn non_allow_listed_headers_never_change_the_key(
            path in "/[a-z]{1,8}",
            header in "x-[a-z]{1,8}",
            a in "[a-z0-9]{1,8}",
            b in "[a-z0-9]{1,8}",
        ) {
            let options = ExecutionOptions::new().with_cacheable_header("x-tenant");
            prop_assume!(header != "x-tenant");
            let left = RequestDescription::get(path.clone()).with_header(header.clone(), a);
            let right = RequestDescription::get(path).with_header(header, b);
            prop_assert_eq!(
                create_cache_key("e", &left, Some(&options), None),
                create_cache_key("e", &right, Some(&options), None)
            );
        }
    }
}
