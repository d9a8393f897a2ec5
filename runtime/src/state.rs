//! Endpoint state manager.
//!
//! One [`EndpointState`] slot per endpoint name, mirrored best-effort to the
//! store under `endpoint:<name>`. Subscribers are notified synchronously
//! after every change and receive the current state when they subscribe.

use apiflow_core::state::{EndpointState, EndpointStatus, StateUpdate};
use apiflow_core::store::{KeyValueStore, STATE_NAMESPACE, Subscription};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// State callback.
pub type StateListener = Arc<dyn Fn(&EndpointState) + Send + Sync>;

type Listeners = HashMap<String, Vec<(u64, StateListener)>>;

/// Store key of an endpoint's state record.
#[must_use]
pub fn state_key(endpoint_name: &str) -> String {
    format!("{STATE_NAMESPACE}{endpoint_name}")
}

/// Per-endpoint status/data/error tracking.
pub struct EndpointStateManager {
    store: Arc<dyn KeyValueStore>,
    states: RwLock<HashMap<String, EndpointState>>,
    listeners: Arc<RwLock<Listeners>>,
    next_listener: AtomicU64,
}

impl std::fmt::Debug for EndpointStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let states = self.states.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EndpointStateManager")
            .field("endpoints", &states.len())
            .finish_non_exhaustive()
    }
}

impl EndpointStateManager {
    /// Create a manager persisting through `store`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            states: RwLock::new(HashMap::new()),
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_listener: AtomicU64::new(0),
        }
    }

    /// Current state (idle when never touched).
    #[must_use]
    pub fn get(&self, endpoint_name: &str) -> EndpointState {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Merge `update` into the endpoint's state, persist it, notify subscribers.
    pub async fn update(&self, endpoint_name: &str, update: StateUpdate) -> EndpointState {
        let snapshot = {
            let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
            let state = states.entry(endpoint_name.to_string()).or_default();
            update.apply(state);
            state.clone()
        };

        tracing::trace!(endpoint = endpoint_name, status = ?snapshot.status, "Endpoint state updated");
        self.persist(endpoint_name, &snapshot).await;
        self.notify(endpoint_name, &snapshot);
        snapshot
    }

    /// Drop the in-memory and persisted record and notify with `idle`.
    pub async fn reset(&self, endpoint_name: &str) {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint_name);

        if let Err(error) = self.store.delete(&state_key(endpoint_name)).await {
            tracing::warn!(endpoint = endpoint_name, %error, "Failed to delete endpoint state");
        }
        self.notify(endpoint_name, &EndpointState::idle());
    }

    /// Hydrate the in-memory record from the store.
    ///
    /// A persisted `loading` state belongs to a call that no longer exists
    /// and is restored as `idle`, keeping its data.
    pub async fn restore(&self, endpoint_name: &str) -> Option<EndpointState> {
        let raw = match self.store.get(&state_key(endpoint_name)).await {
            Ok(raw) => raw?,
            Err(error) => {
                tracing::warn!(endpoint = endpoint_name, %error, "Failed to read endpoint state");
                return None;
            }
        };

        let mut state: EndpointState = match serde_json::from_value(raw) {
            Ok(state) => state,
            Err(error) => {
                tracing::warn!(endpoint = endpoint_name, %error, "Ignoring unreadable endpoint state");
                return None;
            }
        };
        if state.status == EndpointStatus::Loading {
            state.status = EndpointStatus::Idle;
        }

        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint_name.to_string(), state.clone());
        self.notify(endpoint_name, &state);
        Some(state)
    }

    /// Receive the current state now and every change after.
    pub fn subscribe<F>(&self, endpoint_name: &str, listener: F) -> Subscription
    where
        F: Fn(&EndpointState) + Send + Sync + 'static,
    {
        let listener: StateListener = Arc::new(listener);
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(endpoint_name.to_string())
            .or_default()
            .push((id, Arc::clone(&listener)));

        call_isolated(endpoint_name, &listener, &self.get(endpoint_name));

        let listeners = Arc::clone(&self.listeners);
        let name = endpoint_name.to_string();
        Subscription::new(move || {
            let mut listeners = listeners.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(entries) = listeners.get_mut(&name) {
                entries.retain(|(existing, _)| *existing != id);
                if entries.is_empty() {
                    listeners.remove(&name);
                }
            }
        })
    }

    /// Remove every subscriber.
    pub fn clear_listeners(&self) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    async fn persist(&self, endpoint_name: &str, state: &EndpointState) {
        let value = match serde_json::to_value(state) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(endpoint = endpoint_name, %error, "Failed to encode endpoint state");
                return;
            }
        };
        if let Err(error) = self.store.set(&state_key(endpoint_name), value).await {
            tracing::warn!(endpoint = endpoint_name, %error, "Failed to persist endpoint state");
        }
    }

    fn notify(&self, endpoint_name: &str, state: &EndpointState) {
        let listeners: Vec<StateListener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint_name)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in &listeners {
            call_isolated(endpoint_name, listener, state);
        }
    }
}

fn call_isolated(endpoint_name: &str, listener: &StateListener, state: &EndpointState) {
    if catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
        tracing::error!(endpoint = endpoint_name, "State listener panicked");
    }
}
