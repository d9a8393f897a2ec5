//! Store doubles for exercising failure paths.

use apiflow_core::store::{KeyValueStore, StoreCallback, StoreError, Subscription};
use futures::future::{self, BoxFuture};
use serde_json::Value;
use std::collections::HashSet;

/// Operation of a [`KeyValueStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    /// `get`
    Get,
    /// `set`
    Set,
    /// `delete`
    Delete,
    /// `keys`
    Keys,
}

/// Store whose selected operations always fail.
///
/// Operations that are not selected behave like an empty store.
///
/// # Example
///
/// ```
/// use apiflow_testing::{FailingStore, StoreOperation};
/// use apiflow_core::store::KeyValueStore;
///
/// # tokio_test::block_on(async {
/// let store = FailingStore::only([StoreOperation::Set]);
/// assert!(store.set("k", serde_json::json!(1)).await.is_err());
/// assert_eq!(store.get("k").await, Ok(None));
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct FailingStore {
    failing: HashSet<StoreOperation>,
}

impl FailingStore {
    /// Every operation fails.
    #[must_use]
    pub fn new() -> Self {
        Self::only([
            StoreOperation::Get,
            StoreOperation::Set,
            StoreOperation::Delete,
            StoreOperation::Keys,
        ])
    }

    /// Only the given operations fail.
    #[must_use]
    pub fn only(operations: impl IntoIterator<Item = StoreOperation>) -> Self {
        Self {
            failing: operations.into_iter().collect(),
        }
    }

    fn check(&self, operation: StoreOperation) -> Result<(), StoreError> {
        if self.failing.contains(&operation) {
            Err(StoreError::Unavailable(format!("{operation:?} is failing")))
        } else {
            Ok(())
        }
    }
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for FailingStore {
    fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StoreError>> {
        Box::pin(future::ready(self.check(StoreOperation::Get).map(|()| None)))
    }

    fn set<'a>(&'a self, _key: &'a str, _value: Value) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(future::ready(self.check(StoreOperation::Set)))
    }

    fn delete<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(future::ready(self.check(StoreOperation::Delete)))
    }

    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, StoreError>> {
        Box::pin(future::ready(self.check(StoreOperation::Keys).map(|()| Vec::new())))
    }

    fn subscribe(&self, _key: &str, _callback: StoreCallback) -> Subscription {
        Subscription::noop()
    }
}
