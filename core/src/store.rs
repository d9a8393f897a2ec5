//! Key/value store abstraction used for cache entries and endpoint state.
//!
//! The engine consumes this trait; it does not implement persistent backends.
//! Two key namespaces are used:
//!
//! - `api:<endpoint>:<digest>` - cache entries, written only by the cache manager
//! - `endpoint:<name>` - endpoint state records, written only by the state manager
//!
//! Each logical key has exactly one writer, so implementations only need to
//! be safe under interleaved calls; no cross-key locking is required.
//!
//! # Dyn Compatibility
//!
//! Methods return boxed futures instead of using `async fn` so the store can
//! be shared as `Arc<dyn KeyValueStore>`.

use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Prefix of cache entry keys.
pub const CACHE_NAMESPACE: &str = "api:";

/// Prefix of endpoint state keys.
pub const STATE_NAMESPACE: &str = "endpoint:";

/// Errors reported by a [`KeyValueStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store is not reachable or not initialized
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Any other backend failure
    #[error("Store error: {0}")]
    Backend(String),
}

/// Callback invoked with the key and its new value (`None` after a delete).
pub type StoreCallback = Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

/// Handle returned by every subscribe operation in the engine.
///
/// Call [`Subscription::unsubscribe`] to remove the listener. Dropping the
/// handle without unsubscribing leaves the listener registered.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Create a subscription that runs `cancel` on unsubscribe.
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to undo.
    pub const fn noop() -> Self {
        Self { cancel: None }
    }

    /// Remove the listener.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Async key/value primitive.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StoreError>>;

    /// Write a value, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn set<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Delete a value. Deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;

    /// List every key currently stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, StoreError>>;

    /// Watch a single key for writes and deletes.
    fn subscribe(&self, key: &str, callback: StoreCallback) -> Subscription;
}
