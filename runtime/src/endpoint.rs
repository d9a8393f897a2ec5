//! Typed endpoint facade.
//!
//! An [`EndpointConfig<P>`] turns parameters of type `P` into a
//! [`RequestDescription`] and carries the endpoint's cache policy and tags.
//! [`Endpoint<P, R>`] binds a config to a client and decodes response data
//! into `R`.

use crate::cache::{CachePolicy, CacheScope};
use crate::executor::RequestExecutor;
use apiflow_core::state::EndpointState;
use apiflow_core::store::Subscription;
use apiflow_core::{ExecutionOptions, RequestDescription, RequestError};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

type RequestBuilder<P> = Arc<dyn Fn(&P) -> Result<RequestDescription, String> + Send + Sync>;

/// Rewrites the outgoing header map before per-call headers are applied.
pub type HeaderPreparer = Arc<dyn Fn(BTreeMap<String, String>) -> BTreeMap<String, String> + Send + Sync>;

/// Declarative description of one endpoint.
///
/// # Example
///
/// ```
/// use apiflow_runtime::endpoint::EndpointConfig;
/// use apiflow_runtime::cache::CachePolicy;
/// use apiflow_core::RequestDescription;
/// use std::time::Duration;
///
/// let config = EndpointConfig::new(|id: &u64| RequestDescription::get(format!("/users/{id}")))
///     .with_cache(CachePolicy::ttl(Duration::from_secs(60)))
///     .with_tags(["users"]);
///
/// assert_eq!(config.build_request(&7).map(|r| r.path), Ok("/users/7".to_string()));
/// ```
pub struct EndpointConfig<P> {
    request: RequestBuilder<P>,
    /// Cache switch
    pub cache: CachePolicy,
    /// Tags stamped on cache entries and events
    pub tags: Vec<String>,
    /// Tags invalidated after a successful call
    pub invalidates_tags: Vec<String>,
    prepare_headers: Option<HeaderPreparer>,
    /// Header names eligible for the cache key of this endpoint
    pub cacheable_header_keys: Vec<String>,
}

impl<P> Clone for EndpointConfig<P> {
    fn clone(&self) -> Self {
        Self {
            request: Arc::clone(&self.request),
            cache: self.cache.clone(),
            tags: self.tags.clone(),
            invalidates_tags: self.invalidates_tags.clone(),
            prepare_headers: self.prepare_headers.clone(),
            cacheable_header_keys: self.cacheable_header_keys.clone(),
        }
    }
}

impl<P> fmt::Debug for EndpointConfig<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("cache", &self.cache)
            .field("tags", &self.tags)
            .field("invalidates_tags", &self.invalidates_tags)
            .field("prepare_headers", &self.prepare_headers.is_some())
            .field("cacheable_header_keys", &self.cacheable_header_keys)
            .finish_non_exhaustive()
    }
}

impl<P> EndpointConfig<P> {
    /// Endpoint with an infallible request builder.
    #[must_use]
    pub fn new<F>(request: F) -> Self
    where
        F: Fn(&P) -> RequestDescription + Send + Sync + 'static,
    {
        Self::try_new(move |params| Ok(request(params)))
    }

    /// Endpoint whose request builder may reject its parameters.
    #[must_use]
    pub fn try_new<F>(request: F) -> Self
    where
        F: Fn(&P) -> Result<RequestDescription, String> + Send + Sync + 'static,
    {
        Self {
            request: Arc::new(request),
            cache: CachePolicy::Inherit,
            tags: Vec::new(),
            invalidates_tags: Vec::new(),
            prepare_headers: None,
            cacheable_header_keys: Vec::new(),
        }
    }

    /// Builder: set the cache policy
    #[must_use]
    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    /// Builder: set tags
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set tags invalidated on success
    #[must_use]
    pub fn with_invalidates_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidates_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set the header preparer
    #[must_use]
    pub fn with_prepare_headers<F>(mut self, prepare: F) -> Self
    where
        F: Fn(BTreeMap<String, String>) -> BTreeMap<String, String> + Send + Sync + 'static,
    {
        self.prepare_headers = Some(Arc::new(prepare));
        self
    }

    /// Builder: add a cache-key-eligible header
    #[must_use]
    pub fn with_cacheable_header(mut self, name: impl Into<String>) -> Self {
        self.cacheable_header_keys.push(name.into());
        self
    }

    /// Build the request description for `params`.
    ///
    /// # Errors
    ///
    /// Returns the builder's rejection reason.
    pub fn build_request(&self, params: &P) -> Result<RequestDescription, String> {
        (self.request)(params)
    }

    /// Apply the header preparer, if any.
    #[must_use]
    pub fn prepare_headers(&self, headers: BTreeMap<String, String>) -> BTreeMap<String, String> {
        match &self.prepare_headers {
            Some(prepare) => prepare(headers),
            None => headers,
        }
    }

    /// Cache-relevant view of this config.
    #[must_use]
    pub fn cache_scope(&self) -> CacheScope<'_> {
        CacheScope {
            policy: &self.cache,
            tags: &self.tags,
            invalidates_tags: &self.invalidates_tags,
        }
    }
}

/// Static description of a registered endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointMeta {
    /// Registered name
    pub name: String,
    /// Tags
    pub tags: Vec<String>,
    /// Tags invalidated on success
    pub invalidates_tags: Vec<String>,
    /// Cache switch
    pub cache: CachePolicy,
}

struct EndpointInner<P> {
    name: String,
    config: EndpointConfig<P>,
    executor: Arc<RequestExecutor>,
}

/// Handle to a registered endpoint.
///
/// Cloning is cheap; clones share the endpoint's state slot.
pub struct Endpoint<P, R> {
    inner: Arc<EndpointInner<P>>,
    _response: PhantomData<fn() -> R>,
}

impl<P, R> Clone for Endpoint<P, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _response: PhantomData,
        }
    }
}

impl<P, R> fmt::Debug for Endpoint<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl<P, R> Endpoint<P, R>
where
    P: Send + Sync + 'static,
    R: DeserializeOwned + 'static,
{
    pub(crate) fn new(name: String, config: EndpointConfig<P>, executor: Arc<RequestExecutor>) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                name,
                config,
                executor,
            }),
            _response: PhantomData,
        }
    }

    /// Registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Execute the endpoint and decode the data.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Transport`] for unrecovered transport errors,
    /// [`RequestError::BuildRequest`] when the request builder rejects
    /// `params`, and [`RequestError::Decode`] when the data does not fit `R`.
    pub async fn fetch(&self, params: &P, options: ExecutionOptions) -> Result<R, RequestError> {
        let data = self.fetch_json(params, options).await?;
        serde_json::from_value(data).map_err(|e| RequestError::Decode {
            endpoint: self.inner.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Execute the endpoint and return raw JSON data.
    ///
    /// # Errors
    ///
    /// Same as [`fetch`](Self::fetch), minus decoding.
    pub async fn fetch_json(&self, params: &P, options: ExecutionOptions) -> Result<Value, RequestError> {
        self.inner
            .executor
            .execute(&self.inner.name, &self.inner.config, params, options)
            .await
    }

    /// Receive the current state now and every change after.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&EndpointState<R>) + Send + Sync + 'static,
    {
        self.inner
            .executor
            .state()
            .subscribe(&self.inner.name, move |state| listener(&state.decode::<R>()))
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> EndpointState<R> {
        self.inner.executor.state().get(&self.inner.name).decode()
    }

    /// Invalidate the endpoint's tags and reset its state.
    pub async fn invalidate(&self) -> usize {
        let removed = self.inner.executor.invalidate_tags(&self.inner.config.tags).await;
        self.reset().await;
        removed
    }

    /// Reset the state to idle.
    pub async fn reset(&self) {
        self.inner.executor.state().reset(&self.inner.name).await;
    }

    /// Cancel the in-flight call. Returns whether one was cancelled.
    pub fn abort(&self) -> bool {
        self.inner.executor.abort(&self.inner.name)
    }

    /// Static description.
    #[must_use]
    pub fn meta(&self) -> EndpointMeta {
        EndpointMeta {
            name: self.inner.name.clone(),
            tags: self.inner.config.tags.clone(),
            invalidates_tags: self.inner.config.invalidates_tags.clone(),
            cache: self.inner.config.cache.clone(),
        }
    }
}

/// Type-erased endpoint held by the client registry.
pub trait DynEndpoint: Send + Sync {
    /// Registered name.
    fn name(&self) -> &str;

    /// Static description.
    fn meta(&self) -> EndpointMeta;

    /// Execute with JSON parameters, returning JSON data.
    ///
    /// # Errors
    ///
    /// [`RequestError::InvalidParams`] when `params` does not fit the
    /// endpoint's parameter type, otherwise as [`Endpoint::fetch_json`].
    fn request_json(&self, params: Value, options: ExecutionOptions) -> BoxFuture<'_, Result<Value, RequestError>>;
}

impl<P, R> DynEndpoint for Endpoint<P, R>
where
    P: DeserializeOwned + Send + Sync + 'static,
    R: DeserializeOwned + 'static,
{
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn meta(&self) -> EndpointMeta {
        Endpoint::meta(self)
    }

    fn request_json(&self, params: Value, options: ExecutionOptions) -> BoxFuture<'_, Result<Value, RequestError>> {
        Box::pin(async move {
            let params: P = serde_json::from_value(params).map_err(|e| RequestError::InvalidParams {
                endpoint: self.inner.name.clone(),
                reason: e.to_string(),
            })?;
            self.fetch_json(&params, options).await
        })
    }
}
