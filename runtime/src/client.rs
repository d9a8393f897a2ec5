//! Client facade.
//!
//! The [`Client`] owns every shared component (store, cache manager,
//! middleware chain, state slots, event bus, executor) and a registry of
//! endpoints addressable by name.
//!
//! # Example
//!
//! ```
//! use apiflow_runtime::{Client, ClientConfig, EndpointConfig};
//! use apiflow_core::{ExecutionOptions, RequestDescription, ResultEnvelope};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let transport = |request: RequestDescription, _options: ExecutionOptions| async move {
//!     ResultEnvelope::success(200, json!({ "path": request.path }))
//! };
//! let client = Client::new(ClientConfig::default(), transport);
//! let endpoint = client.create_endpoint::<u64, serde_json::Value>(
//!     "getUser",
//!     EndpointConfig::new(|id: &u64| RequestDescription::get(format!("/users/{id}"))),
//! );
//!
//! let data = endpoint.fetch(&1, ExecutionOptions::new()).await;
//! assert_eq!(data.ok(), Some(json!({ "path": "/users/1" })));
//! # });
//! ```

use crate::cache::CacheManager;
use crate::config::{ClientConfig, StorageType};
use crate::endpoint::{DynEndpoint, Endpoint, EndpointConfig};
use crate::events::EventBus;
use crate::executor::{ExecutorParts, RequestExecutor};
use crate::middleware::MiddlewareManager;
use crate::state::EndpointStateManager;
use crate::store::MemoryStore;
use apiflow_core::environment::{Clock, SystemClock};
use apiflow_core::event::{Event, EventKind};
use apiflow_core::middleware::{GlobalOptions, GlobalOptionsProvider, Middleware};
use apiflow_core::state::EndpointState;
use apiflow_core::store::{KeyValueStore, Subscription};
use apiflow_core::transport::Transport;
use apiflow_core::{CancellationToken, ExecutionOptions, RequestError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl ClientBuilder {
    /// Builder: supply the store used for [`StorageType::Persistent`]
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builder: replace the clock used for cache expiry
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build without probing the store.
    #[must_use]
    pub fn build(self) -> Client {
        let storage = self.select_storage(None);
        Client::assemble(self, storage)
    }

    /// Probe the supplied store, then build.
    ///
    /// A store that fails the probe is treated like a missing one: caching is
    /// disabled and state lives in memory.
    pub async fn build_checked(self) -> Client {
        let probe = match &self.store {
            Some(store) => Some(store.keys().await.map(|_| ())),
            None => None,
        };
        let storage = self.select_storage(probe);
        Client::assemble(self, storage)
    }

    fn select_storage(&self, probe: Option<Result<(), apiflow_core::store::StoreError>>) -> Storage {
        match (&self.store, probe) {
            (Some(_), Some(Err(error))) => {
                tracing::warn!(%error, "Store probe failed, running with caching disabled");
                Storage::fallback()
            }
            (Some(store), _) => Storage {
                store: Arc::clone(store),
                caching_enabled: true,
            },
            (None, _) if self.config.storage_type == StorageType::Persistent => {
                tracing::warn!("Persistent storage requested without a store, running with caching disabled");
                Storage::fallback()
            }
            (None, _) => Storage {
                store: Arc::new(MemoryStore::new()),
                caching_enabled: true,
            },
        }
    }
}

struct Storage {
    store: Arc<dyn KeyValueStore>,
    caching_enabled: bool,
}

impl Storage {
    fn fallback() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            caching_enabled: false,
        }
    }
}

struct ClientInner {
    config: Arc<ClientConfig>,
    executor: Arc<RequestExecutor>,
    middleware: Arc<MiddlewareManager>,
    endpoints: RwLock<BTreeMap<String, Arc<dyn DynEndpoint>>>,
    global: Arc<RwLock<GlobalOptions>>,
    cleanup: Mutex<Option<CancellationToken>>,
}

/// Entry point: endpoint registry plus shared runtime components.
///
/// Cloning is cheap; clones share everything.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("endpoints", &self.endpoints())
            .field("caching_enabled", &self.inner.executor.caching_enabled())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Client over the default store for `config.storage_type`.
    #[must_use]
    pub fn new<T>(config: ClientConfig, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        Self::builder(config, transport).build()
    }

    /// Start a builder.
    #[must_use]
    pub fn builder<T>(config: ClientConfig, transport: T) -> ClientBuilder
    where
        T: Transport + 'static,
    {
        ClientBuilder {
            config,
            transport: Arc::new(transport),
            store: None,
            clock: Arc::new(SystemClock),
        }
    }

    fn assemble(builder: ClientBuilder, storage: Storage) -> Self {
        if let Err(error) = builder.config.validate() {
            tracing::warn!(%error, "Invalid client configuration");
        }
        let config = Arc::new(builder.config);
        let global = Arc::new(RwLock::new(GlobalOptions {
            cacheable_header_keys: config.cacheable_header_keys.clone(),
            invalidate_on_error: config.invalidate_on_error(),
        }));
        let provider: GlobalOptionsProvider = {
            let global = Arc::clone(&global);
            Arc::new(move || global.read().unwrap_or_else(PoisonError::into_inner).clone())
        };

        let cache = Arc::new(CacheManager::new(
            Arc::clone(&storage.store),
            Arc::clone(&config),
            builder.clock,
        ));
        let middleware = Arc::new(MiddlewareManager::new(Arc::clone(&provider)));
        let executor = Arc::new(RequestExecutor::new(ExecutorParts {
            transport: builder.transport,
            cache: Arc::clone(&cache),
            middleware: Arc::clone(&middleware),
            state: Arc::new(EndpointStateManager::new(storage.store)),
            events: EventBus::new(),
            global: provider,
            caching_enabled: storage.caching_enabled,
        }));

        let cleanup = if storage.caching_enabled {
            config.cleanup_interval().and_then(|interval| {
                if tokio::runtime::Handle::try_current().is_ok() {
                    Some(cache.spawn_cleanup(interval))
                } else {
                    tracing::warn!("No tokio runtime, expired-entry sweeper not started");
                    None
                }
            })
        } else {
            None
        };

        tracing::debug!(
            storage = ?config.storage_type,
            caching_enabled = storage.caching_enabled,
            "Client initialized"
        );

        Self {
            inner: Arc::new(ClientInner {
                config,
                executor,
                middleware,
                endpoints: RwLock::new(BTreeMap::new()),
                global,
                cleanup: Mutex::new(cleanup),
            }),
        }
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Cache manager, for notifications and manual maintenance.
    #[must_use]
    pub fn cache(&self) -> &Arc<CacheManager> {
        self.inner.executor.cache()
    }

    /// Whether cache reads and writes are active.
    #[must_use]
    pub fn caching_enabled(&self) -> bool {
        self.inner.executor.caching_enabled()
    }

    /// Register an endpoint, replacing any endpoint of the same name.
    pub fn create_endpoint<P, R>(&self, name: impl Into<String>, config: EndpointConfig<P>) -> Endpoint<P, R>
    where
        P: DeserializeOwned + Send + Sync + 'static,
        R: DeserializeOwned + 'static,
    {
        let name = name.into();
        let endpoint: Endpoint<P, R> = Endpoint::new(name.clone(), config, Arc::clone(&self.inner.executor));
        let previous = self
            .inner
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), Arc::new(endpoint.clone()));
        if previous.is_some() {
            tracing::warn!(endpoint = %name, "Replacing existing endpoint");
        }
        endpoint
    }

    /// Registered endpoint names, sorted.
    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        self.inner
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Look up an endpoint by name.
    #[must_use]
    pub fn endpoint(&self, name: &str) -> Option<Arc<dyn DynEndpoint>> {
        self.inner
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Execute an endpoint by name with JSON parameters.
    ///
    /// # Errors
    ///
    /// [`RequestError::UnknownEndpoint`] for an unregistered name, otherwise
    /// as [`DynEndpoint::request_json`].
    pub async fn request(&self, name: &str, params: Value, options: ExecutionOptions) -> Result<Value, RequestError> {
        let endpoint = self
            .endpoint(name)
            .ok_or_else(|| RequestError::UnknownEndpoint(name.to_string()))?;
        endpoint.request_json(params, options).await
    }

    /// Add a middleware.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner.middleware.use_middleware(middleware);
    }

    /// Remove middleware by name.
    pub fn remove_middleware(&self, name: &str) -> bool {
        self.inner.middleware.remove(name)
    }

    /// Remove every middleware.
    pub fn clear_middleware(&self) {
        self.inner.middleware.clear();
    }

    /// Listen to lifecycle events of one endpoint.
    pub fn subscribe_endpoint<F>(&self, name: &str, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.executor.events().subscribe_endpoint(name, listener)
    }

    /// Listen to one event kind.
    pub fn subscribe_event<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.executor.events().subscribe_event(kind, listener)
    }

    /// Listen to events carrying `tag`.
    pub fn subscribe_tag<F>(&self, tag: &str, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.executor.events().subscribe_tag(tag, listener)
    }

    /// Listen to every event.
    pub fn subscribe_all<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.executor.events().subscribe_all(listener)
    }

    /// Receive an endpoint's current state now and every change after.
    pub fn subscribe_state<F>(&self, name: &str, listener: F) -> Subscription
    where
        F: Fn(&EndpointState) + Send + Sync + 'static,
    {
        self.inner.executor.state().subscribe(name, listener)
    }

    /// Current state of an endpoint (raw JSON data).
    #[must_use]
    pub fn state(&self, name: &str) -> EndpointState {
        self.inner.executor.state().get(name)
    }

    /// Invalidate cache entries by tag. Returns the number removed.
    pub async fn invalidate_tags(&self, tags: &[String]) -> usize {
        self.inner.executor.invalidate_tags(tags).await
    }

    /// Replace the global cache-key header names.
    ///
    /// Calls already in flight see the new names at their next hook.
    pub fn set_cacheable_header_keys<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner
            .global
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .cacheable_header_keys = keys.into_iter().map(Into::into).collect();
    }

    /// Current global options.
    #[must_use]
    pub fn global_options(&self) -> GlobalOptions {
        self.inner
            .global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Hydrate every registered endpoint's state from the store.
    /// Returns the number of endpoints restored.
    pub async fn restore_states(&self) -> usize {
        let mut restored = 0;
        for name in self.endpoints() {
            if self.inner.executor.state().restore(&name).await.is_some() {
                restored += 1;
            }
        }
        restored
    }

    /// Cancel the in-flight call of `name`.
    pub fn abort(&self, name: &str) -> bool {
        self.inner.executor.abort(name)
    }

    /// Stop sweeping, abort in-flight calls, drop listeners and middleware.
    pub fn destroy(&self) {
        if let Some(cleanup) = self
            .inner
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cleanup.cancel();
        }
        let aborted = self.inner.executor.abort_all();
        self.inner.executor.events().clear();
        self.inner.executor.state().clear_listeners();
        self.inner.middleware.clear();
        tracing::debug!(aborted, "Client destroyed");
    }
}
