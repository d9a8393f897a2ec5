//! # apiflow Runtime
//!
//! Runtime implementation of the apiflow request orchestration engine.
//!
//! This crate wires the seams defined in `apiflow-core` (store, transport,
//! middleware) into a working client.
//!
//! ## Core Components
//!
//! - **Client**: registry of endpoints and owner of every shared component
//! - **Request Executor**: runs one call through cache, middleware, transport and state
//! - **Cache Manager**: TTL/tag-aware response cache over a key-value store
//! - **Middleware Manager**: priority-ordered request/response/error/event hooks
//! - **Endpoint State Manager**: observable `idle → loading → success | error` slots
//! - **Event Bus**: lifecycle events routed by kind, endpoint and tag
//!
//! ## Example
//!
//! ```
//! use apiflow_runtime::{CachePolicy, Client, ClientConfig, EndpointConfig};
//! use apiflow_core::{ExecutionOptions, RequestDescription, ResultEnvelope};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let client = Client::new(ClientConfig::default(), |_request: RequestDescription, _options: ExecutionOptions| async {
//!     ResultEnvelope::success(200, json!({ "name": "Ada" }))
//! });
//!
//! let get_user = client.create_endpoint::<u64, serde_json::Value>(
//!     "getUser",
//!     EndpointConfig::new(|id: &u64| RequestDescription::get(format!("/users/{id}")))
//!         .with_cache(CachePolicy::ttl(Duration::from_secs(60)))
//!         .with_tags(["users"]),
//! );
//!
//! let user = get_user.fetch(&1, ExecutionOptions::new()).await;
//! assert_eq!(user.ok(), Some(json!({ "name": "Ada" })));
//! # });
//! ```

/// Cancellation register keyed by endpoint name
pub mod abort;

/// Response cache
pub mod cache;

/// Client facade and builder
pub mod client;

/// Client configuration
pub mod config;

/// Typed endpoint facade
pub mod endpoint;

/// Lifecycle event routing
pub mod events;

/// Per-call pipeline
pub mod executor;

/// Prometheus metrics for observability
pub mod metrics;

/// Middleware chain and built-in middleware
pub mod middleware;

/// Retry middleware with exponential backoff
pub mod retry;

/// Endpoint state slots
pub mod state;

/// In-memory key-value store
pub mod store;

pub use cache::{CacheEntry, CacheKey, CacheManager, CacheMetadata, CacheNotification, CachePolicy, CacheScope};
pub use client::{Client, ClientBuilder};
pub use config::{CacheOptions, CacheRule, CacheSetting, CleanupOptions, ClientConfig, ConfigError, StorageType};
pub use endpoint::{DynEndpoint, Endpoint, EndpointConfig, EndpointMeta};
pub use events::EventBus;
pub use middleware::{FnMiddleware, MiddlewareManager, TracingMiddleware};
pub use retry::{RetryMiddleware, RetryPolicy};
pub use store::MemoryStore;
