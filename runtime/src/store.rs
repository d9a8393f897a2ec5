//! Process-local key/value store.
//!
//! [`MemoryStore`] backs [`StorageType::Memory`](crate::config::StorageType)
//! and is the store used in tests. Values live in a `HashMap` behind a
//! `RwLock`; key watchers are notified after the lock is released.

use apiflow_core::store::{KeyValueStore, StoreCallback, StoreError, Subscription};
use futures::future::{self, BoxFuture};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

type Watchers = HashMap<String, Vec<(u64, StoreCallback)>>;

/// In-memory [`KeyValueStore`].
///
/// # Example
///
/// ```
/// use apiflow_runtime::store::MemoryStore;
/// use apiflow_core::store::KeyValueStore;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let store = MemoryStore::new();
/// store.set("endpoint:getUser", json!({"status": "idle"})).await.ok();
/// assert_eq!(store.len(), 1);
/// assert!(store.contains_key("endpoint:getUser"));
/// # });
/// ```
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<HashMap<String, Value>>>,
    watchers: Arc<RwLock<Watchers>>,
    next_watcher: Arc<AtomicU64>,
}

impl MemoryStore {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every value (watchers are kept).
    pub fn clear(&self) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    fn notify(&self, key: &str, value: Option<&Value>) {
        let callbacks: Vec<StoreCallback> = self
            .watchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        for callback in callbacks {
            callback(key, value);
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").field("len", &self.len()).finish()
    }
}

impl KeyValueStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StoreError>> {
        let value = self
            .data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        Box::pin(future::ready(Ok(value)))
    }

    fn set<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<(), StoreError>> {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.clone());
        self.notify(key, Some(&value));
        Box::pin(future::ready(Ok(())))
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        let removed = self
            .data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if removed.is_some() {
            self.notify(key, None);
        }
        Box::pin(future::ready(Ok(())))
    }

    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, StoreError>> {
        let keys = self
            .data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        Box::pin(future::ready(Ok(keys)))
    }

    fn subscribe(&self, key: &str, callback: StoreCallback) -> Subscription {
        let id = self.next_watcher.fetch_add(1, Ordering::Relaxed);
        self.watchers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .push((id, callback));

        let watchers = Arc::clone(&self.watchers);
        let key = key.to_string();
        Subscription::new(move || {
            let mut watchers = watchers.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(entries) = watchers.get_mut(&key) {
                entries.retain(|(existing, _)| *existing != id);
                if entries.is_empty() {
                    watchers.remove(&key);
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use apiflow_testing::Recorder;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_delete() {
        let store = MemoryStore::new();
        store.set("a", json!(1)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!(1)));

        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        store.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn keys_lists_everything() {
        let store = MemoryStore::new();
        store.set("api:x", json!(1)).await.unwrap();
        store.set("endpoint:x", json!(2)).await.unwrap();
        let mut keys = store.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["api:x", "endpoint:x"]);
    }

    #[tokio::test]
    async fn watchers_see_writes_until_unsubscribed() {
        let store = MemoryStore::new();
        let recorder: Recorder<Option<Value>> = Recorder::new();
        let listener = recorder.listener();
        let subscription = store.subscribe(
            "k",
            Arc::new(move |_key: &str, value: Option<&Value>| listener(&value.cloned())),
        );

        store.set("k", json!("v")).await.unwrap();
        store.set("other", json!("ignored")).await.unwrap();
        store.delete("k").await.unwrap();
        subscription.unsubscribe();
        store.set("k", json!("late")).await.unwrap();

        assert_eq!(recorder.values(), vec![Some(json!("v")), None]);
    }
}
