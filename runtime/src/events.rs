//! Lifecycle event bus.
//!
//! Listeners are indexed three ways (by [`EventKind`], by endpoint name and by
//! tag) plus a wildcard list that sees every event. Dispatch is synchronous
//! and isolated: a panicking listener is logged and the remaining listeners
//! still run.

use apiflow_core::event::{Event, EventContext, EventKind};
use apiflow_core::store::Subscription;
use serde_json::Value;
use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Event callback.
pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

type Slot = Vec<(u64, EventListener)>;

#[derive(Default)]
struct Indices {
    by_kind: HashMap<EventKind, Slot>,
    by_endpoint: HashMap<String, Slot>,
    by_tag: HashMap<String, Slot>,
    all: Slot,
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum IndexKey {
    Kind(EventKind),
    Endpoint(String),
    Tag(String),
    All,
}

/// Fan-out of lifecycle events.
#[derive(Clone, Default)]
pub struct EventBus {
    indices: Arc<RwLock<Indices>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

fn remove_from<K: Eq + Hash>(map: &mut HashMap<K, Slot>, key: &K, id: u64) {
    if let Some(slot) = map.get_mut(key) {
        slot.retain(|(existing, _)| *existing != id);
        if slot.is_empty() {
            map.remove(key);
        }
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, key: IndexKey, listener: EventListener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut indices = self.indices.write().unwrap_or_else(PoisonError::into_inner);
            let slot = match &key {
                IndexKey::Kind(kind) => indices.by_kind.entry(*kind).or_default(),
                IndexKey::Endpoint(name) => indices.by_endpoint.entry(name.clone()).or_default(),
                IndexKey::Tag(tag) => indices.by_tag.entry(tag.clone()).or_default(),
                IndexKey::All => &mut indices.all,
            };
            slot.push((id, listener));
        }

        let indices = Arc::clone(&self.indices);
        Subscription::new(move || {
            let mut indices = indices.write().unwrap_or_else(PoisonError::into_inner);
            match &key {
                IndexKey::Kind(kind) => remove_from(&mut indices.by_kind, kind, id),
                IndexKey::Endpoint(name) => remove_from(&mut indices.by_endpoint, name, id),
                IndexKey::Tag(tag) => remove_from(&mut indices.by_tag, tag, id),
                IndexKey::All => indices.all.retain(|(existing, _)| *existing != id),
            }
        })
    }

    /// Listen to one event kind.
    pub fn subscribe_event<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(IndexKey::Kind(kind), Arc::new(listener))
    }

    /// Listen to every event of one endpoint.
    pub fn subscribe_endpoint<F>(&self, endpoint_name: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(IndexKey::Endpoint(endpoint_name.into()), Arc::new(listener))
    }

    /// Listen to every event whose context carries `tag`.
    pub fn subscribe_tag<F>(&self, tag: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(IndexKey::Tag(tag.into()), Arc::new(listener))
    }

    /// Listen to everything.
    pub fn subscribe_all<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(IndexKey::All, Arc::new(listener))
    }

    /// Build, stamp and dispatch an event. Returns the dispatched event.
    pub fn emit(
        &self,
        kind: EventKind,
        endpoint_name: Option<&str>,
        context: Option<EventContext>,
        payload: Value,
    ) -> Event {
        let mut event = Event::new(kind).with_payload(payload);
        if let Some(name) = endpoint_name {
            event = event.with_endpoint(name);
        }
        if let Some(context) = context {
            event = event.with_context(context);
        }
        self.dispatch(&event);
        event
    }

    /// Deliver an already-built event.
    ///
    /// A listener matching through several indices (an endpoint and a tag,
    /// two tags, ...) is called once.
    pub fn dispatch(&self, event: &Event) {
        let listeners: Vec<EventListener> = {
            let indices = self.indices.read().unwrap_or_else(PoisonError::into_inner);
            let endpoint_slot = event
                .endpoint_name
                .as_ref()
                .and_then(|name| indices.by_endpoint.get(name));
            let kind_slot = indices.by_kind.get(&event.kind);
            let tag_slots = event.tags().iter().filter_map(|tag| indices.by_tag.get(tag));

            let mut selected: Vec<EventListener> = Vec::new();
            let matching = endpoint_slot
                .into_iter()
                .chain(kind_slot)
                .chain(tag_slots)
                .chain(std::iter::once(&indices.all))
                .flatten();
            for (_, listener) in matching {
                if !selected.iter().any(|existing| Arc::ptr_eq(existing, listener)) {
                    selected.push(Arc::clone(listener));
                }
            }
            selected
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::error!(
                    kind = %event.kind,
                    endpoint = event.endpoint_name.as_deref(),
                    "Event listener panicked"
                );
            }
        }
    }

    /// Remove every listener.
    pub fn clear(&self) {
        let mut indices = self.indices.write().unwrap_or_else(PoisonError::into_inner);
        *indices = Indices::default();
    }

    /// Number of registered listeners across all indices.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        let indices = self.indices.read().unwrap_or_else(PoisonError::into_inner);
        indices.by_kind.values().map(Vec::len).sum::<usize>()
            + indices.by_endpoint.values().map(Vec::len).sum::<usize>()
            + indices.by_tag.values().map(Vec::len).sum::<usize>()
            + indices.all.len()
    }
}
