//! Request executor.
//!
//! Runs one endpoint call through the full pipeline:
//!
//! ```text
//! build request ─▶ REQUEST_START/loading ─▶ cache lookup ──hit──▶ response mw ─▶ success
//!                                              │ miss
//!                                              ▼
//!                     register token ─▶ request mw ─▶ transport (raced with token)
//!                                                          │
//!                          ┌───────────── ok ──────────────┴──────── error ─────────┐
//!                          ▼                                                        ▼
//!                     response mw ─▶ success ─▶ cache write                   error mw
//!                                                                         recovered │ continue
//!                                                                          success ◀┘ └▶ error
//! ```
//!
//! Every step emits lifecycle events to the [`EventBus`] and to middleware
//! `on_event` hooks, and updates the endpoint's state slot.

use crate::abort::AbortRegistry;
use crate::cache::{CacheKey, CacheManager, CacheScope};
use crate::endpoint::EndpointConfig;
use crate::events::EventBus;
use crate::metrics::RequestMetrics;
use crate::middleware::MiddlewareManager;
use crate::state::EndpointStateManager;
use apiflow_core::event::{EventContext, EventKind};
use apiflow_core::middleware::{CallContext, ErrorOutcome, GlobalOptions, GlobalOptionsProvider};
use apiflow_core::state::StateUpdate;
use apiflow_core::transport::Transport;
use apiflow_core::{
    ApiError, CancellationToken, ExecutionOptions, RequestDescription, RequestError, ResultEnvelope,
    RetryFn,
};
use futures::FutureExt;
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Shared components an executor drives.
pub struct ExecutorParts {
    /// I/O
    pub transport: Arc<dyn Transport>,
    /// Cache manager
    pub cache: Arc<CacheManager>,
    /// Middleware chain
    pub middleware: Arc<MiddlewareManager>,
    /// State slots
    pub state: Arc<EndpointStateManager>,
    /// Lifecycle events
    pub events: EventBus,
    /// Client-wide options
    pub global: GlobalOptionsProvider,
    /// `false` disables every cache read and write
    pub caching_enabled: bool,
}

/// Per-call orchestration.
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    cache: Arc<CacheManager>,
    middleware: Arc<MiddlewareManager>,
    state: Arc<EndpointStateManager>,
    events: EventBus,
    global: GlobalOptionsProvider,
    aborts: AbortRegistry,
    caching_enabled: bool,
    next_call_id: AtomicU64,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("caching_enabled", &self.caching_enabled)
            .field("aborts", &self.aborts)
            .finish_non_exhaustive()
    }
}

/// Call identity and timing shared by the pipeline steps.
struct Call<'a> {
    name: &'a str,
    id: u64,
    tags: &'a [String],
    started: Instant,
}

impl Call<'_> {
    fn context(&self) -> EventContext {
        EventContext {
            call_id: Some(self.id),
            ..EventContext::with_tags(self.tags.to_vec())
        }
    }

    fn finished_context(&self) -> EventContext {
        EventContext {
            duration_ms: Some(u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)),
            ..self.context()
        }
    }
}

impl RequestExecutor {
    /// Assemble an executor.
    #[must_use]
    pub fn new(parts: ExecutorParts) -> Self {
        Self {
            transport: parts.transport,
            cache: parts.cache,
            middleware: parts.middleware,
            state: parts.state,
            events: parts.events,
            global: parts.global,
            aborts: AbortRegistry::new(),
            caching_enabled: parts.caching_enabled,
            next_call_id: AtomicU64::new(1),
        }
    }

    /// State slots.
    #[must_use]
    pub fn state(&self) -> &EndpointStateManager {
        &self.state
    }

    /// Cache manager.
    #[must_use]
    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Middleware chain.
    #[must_use]
    pub fn middleware(&self) -> &MiddlewareManager {
        &self.middleware
    }

    /// Event bus.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Whether cache reads and writes are active.
    #[must_use]
    pub const fn caching_enabled(&self) -> bool {
        self.caching_enabled
    }

    fn emit(&self, kind: EventKind, endpoint_name: Option<&str>, context: Option<EventContext>, payload: Value) {
        let event = self.events.emit(kind, endpoint_name, context, payload);
        self.middleware.notify_event(&event);
    }

    /// Execute one call of `endpoint_name`.
    ///
    /// # Errors
    ///
    /// [`RequestError::BuildRequest`] when the request builder rejects
    /// `params`; [`RequestError::Transport`] when the transport fails and no
    /// error middleware recovers.
    #[tracing::instrument(skip_all, fields(endpoint = endpoint_name, call_id = tracing::field::Empty))]
    pub async fn execute<P>(
        &self,
        endpoint_name: &str,
        config: &EndpointConfig<P>,
        params: &P,
        options: ExecutionOptions,
    ) -> Result<Value, RequestError>
    where
        P: Sync,
    {
        let call = Call {
            name: endpoint_name,
            id: self.next_call_id.fetch_add(1, Ordering::Relaxed),
            tags: &config.tags,
            started: Instant::now(),
        };
        tracing::Span::current().record("call_id", call.id);
        RequestMetrics::record_start(endpoint_name);

        let mut request = match config.build_request(params) {
            Ok(request) => request,
            Err(reason) => {
                let error = RequestError::BuildRequest {
                    endpoint: endpoint_name.to_string(),
                    reason,
                };
                return Err(self.fail_uncaught(&call, error).await);
            }
        };
        let mut options = options;
        request.headers = config.prepare_headers(std::mem::take(&mut request.headers));
        for (name, value) in &options.headers {
            request.headers.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
            request.headers.insert(name.clone(), value.clone());
        }

        self.emit(
            EventKind::RequestStart,
            Some(endpoint_name),
            Some(call.context()),
            serde_json::to_value(&request).unwrap_or(Value::Null),
        );
        self.state.update(endpoint_name, StateUpdate::loading()).await;

        let global = (self.global)();
        let scope = config.cache_scope();
        let use_cache =
            self.caching_enabled && self.cache.should_cache(endpoint_name, Some(&scope), Some(&options));
        options.cacheable_header_keys = merge_header_keys(&options, config, &global);

        let cache_key = if use_cache {
            let key = self.cache.create_cache_key(endpoint_name, &request, Some(&options), None);
            if let Some(data) = self.serve_cached(&call, &key, &options).await {
                return Ok(data);
            }
            Some(key)
        } else {
            None
        };

        let (token, registered) = match options.cancellation.clone() {
            Some(token) => (token, false),
            None => {
                let token = self.aborts.register(endpoint_name, call.id, &config.tags);
                options.cancellation = Some(token.clone());
                (token, true)
            }
        };

        let mut call_context = CallContext {
            endpoint_name: endpoint_name.to_string(),
            call_id: call.id,
            tags: config.tags.clone(),
            cacheable_header_keys: options.cacheable_header_keys.clone(),
            retry: options.retry.clone(),
            cancellation: Some(token.clone()),
        };
        let (request, mut options) = self.middleware.apply_request(&call_context, request, options).await;
        if options.cancellation.is_none() {
            options.cancellation = Some(token.clone());
        }
        call_context.retry = Some(
            call_context
                .retry
                .take()
                .unwrap_or_else(|| retry_fn(Arc::clone(&self.transport), request.clone(), options.clone(), token.clone())),
        );

        let outcome = AssertUnwindSafe(race(self.transport.as_ref(), request, options, &token))
            .catch_unwind()
            .await;
        // The registration outlives the transport call while error middleware may retry
        let release = || {
            if registered {
                self.aborts.release(endpoint_name, call.id);
            }
        };

        let Ok(envelope) = outcome else {
            release();
            let error = RequestError::Transport(ApiError::new(0, "Transport panicked").with_code("UNCAUGHT"));
            return Err(self.fail_uncaught(&call, error).await);
        };

        let scope_without_invalidation = CacheScope {
            invalidates_tags: &[],
            ..scope
        };

        if !envelope.ok {
            let error = envelope
                .error
                .clone()
                .unwrap_or_else(|| ApiError::new(envelope.status, envelope.status_text.clone()));
            tracing::debug!(status = error.status, message = %error.message, "Transport returned an error");

            let outcome = self.middleware.apply_error(&call_context, error).await;
            release();
            return match outcome {
                ErrorOutcome::Recovered(recovered) => {
                    let data = recovered.data.clone().unwrap_or(Value::Null);
                    self.emit(
                        EventKind::RequestSuccess,
                        Some(endpoint_name),
                        Some(EventContext {
                            recovered_from_error: true,
                            status: Some(recovered.status),
                            ..call.finished_context()
                        }),
                        data.clone(),
                    );
                    self.state
                        .update(endpoint_name, StateUpdate::success(data.clone()).recovered())
                        .await;
                    self.after_success(&call, config, &scope_without_invalidation, cache_key.as_ref(), &recovered)
                        .await;
                    RequestMetrics::record_success(endpoint_name, call.started.elapsed(), false);
                    Ok(data)
                }
                ErrorOutcome::Continue(error) => {
                    self.emit(
                        EventKind::RequestError,
                        Some(endpoint_name),
                        Some(EventContext {
                            status: Some(error.status),
                            ..call.finished_context()
                        }),
                        serde_json::to_value(&error).unwrap_or(Value::Null),
                    );
                    self.state.update(endpoint_name, StateUpdate::error(error.clone())).await;
                    if !error.is_aborted() {
                        self.invalidate_on_error(&call, &global).await;
                    }
                    RequestMetrics::record_failure(endpoint_name, call.started.elapsed());
                    Err(RequestError::Transport(error))
                }
            };
        }

        release();
        let raw = envelope.clone();
        let envelope = self.middleware.apply_response(&call_context, envelope).await;
        let data = envelope.data.clone().unwrap_or(Value::Null);
        self.emit(
            EventKind::RequestSuccess,
            Some(endpoint_name),
            Some(EventContext {
                status: Some(envelope.status),
                ..call.finished_context()
            }),
            data.clone(),
        );
        self.state.update(endpoint_name, StateUpdate::success(data.clone())).await;
        self.after_success(&call, config, &scope_without_invalidation, cache_key.as_ref(), &raw)
            .await;
        RequestMetrics::record_success(endpoint_name, call.started.elapsed(), false);
        Ok(data)
    }

    /// Answer from the cache, or emit `CACHE_MISS` and return `None`.
    async fn serve_cached(&self, call: &Call<'_>, key: &CacheKey, options: &ExecutionOptions) -> Option<Value> {
        let Some(entry) = self.cache.get_at(call.name, key).await else {
            self.emit(
                EventKind::CacheMiss,
                Some(call.name),
                Some(call.context()),
                json!({ "key": key.key }),
            );
            return None;
        };

        self.emit(
            EventKind::CacheHit,
            Some(call.name),
            Some(EventContext {
                from_cache: true,
                ..call.context()
            }),
            json!({ "key": key.key }),
        );

        let call_context = CallContext {
            endpoint_name: call.name.to_string(),
            call_id: call.id,
            tags: call.tags.to_vec(),
            cacheable_header_keys: options.cacheable_header_keys.clone(),
            retry: None,
            cancellation: None,
        };
        let envelope = self.middleware.apply_response(&call_context, entry.data).await;
        let data = envelope.data.unwrap_or(Value::Null);
        self.state
            .update(call.name, StateUpdate::success(data.clone()).from_cache())
            .await;
        RequestMetrics::record_success(call.name, call.started.elapsed(), true);
        Some(data)
    }

    /// Invalidate declared tags, then write the cache entry.
    async fn after_success<P>(
        &self,
        call: &Call<'_>,
        config: &EndpointConfig<P>,
        scope: &CacheScope<'_>,
        cache_key: Option<&CacheKey>,
        envelope: &ResultEnvelope,
    ) {
        if !config.invalidates_tags.is_empty() && self.caching_enabled {
            self.invalidate_tags(&config.invalidates_tags).await;
        }
        if let Some(key) = cache_key {
            self.cache.set_at(call.name, Some(scope), key, envelope).await;
        }
    }

    async fn invalidate_on_error(&self, call: &Call<'_>, global: &GlobalOptions) {
        if global.invalidate_on_error && !call.tags.is_empty() && self.caching_enabled {
            tracing::debug!(tags = ?call.tags, "Invalidating endpoint tags after error");
            self.invalidate_tags(call.tags).await;
        }
    }

    /// Failure outside the transport: event, state, invalidation, then the error.
    async fn fail_uncaught(&self, call: &Call<'_>, error: RequestError) -> RequestError {
        tracing::warn!(%error, "Call failed before reaching the transport");
        let api_error = error
            .api_error()
            .cloned()
            .unwrap_or_else(|| ApiError::new(0, error.to_string()).with_code("UNCAUGHT"));

        self.emit(
            EventKind::RequestError,
            Some(call.name),
            Some(EventContext {
                uncaught_error: true,
                ..call.finished_context()
            }),
            serde_json::to_value(&api_error).unwrap_or(Value::Null),
        );
        self.state.update(call.name, StateUpdate::error(api_error)).await;
        self.invalidate_on_error(call, &(self.global)()).await;
        RequestMetrics::record_failure(call.name, call.started.elapsed());
        error
    }

    /// Invalidate cache entries by tag and emit `CACHE_INVALIDATE`.
    pub async fn invalidate_tags(&self, tags: &[String]) -> usize {
        if tags.is_empty() {
            return 0;
        }
        let removed = self.cache.invalidate_by_tags(tags).await;
        self.emit(
            EventKind::CacheInvalidate,
            None,
            Some(EventContext::with_tags(tags.to_vec())),
            json!({ "removed": removed }),
        );
        removed
    }

    /// Cancel the in-flight call of `endpoint_name`.
    ///
    /// Emits `REQUEST_CANCEL` only when a call was cancelled.
    pub fn abort(&self, endpoint_name: &str) -> bool {
        let Some(tags) = self.aborts.cancel(endpoint_name) else {
            return false;
        };
        tracing::debug!(endpoint = endpoint_name, "Call aborted");
        self.emit_cancel(endpoint_name, tags);
        true
    }

    /// Cancel every in-flight call. Returns the number cancelled.
    pub fn abort_all(&self) -> usize {
        let cancelled = self.aborts.cancel_all();
        let count = cancelled.len();
        for (name, tags) in cancelled {
            self.emit_cancel(&name, tags);
        }
        count
    }

    fn emit_cancel(&self, endpoint_name: &str, tags: Vec<String>) {
        RequestMetrics::record_cancel(endpoint_name);
        self.emit(
            EventKind::RequestCancel,
            Some(endpoint_name),
            Some(EventContext::with_tags(tags)),
            Value::Null,
        );
    }
}

/// Call-level names first, then endpoint, then global; case-insensitive dedup.
fn merge_header_keys<P>(options: &ExecutionOptions, config: &EndpointConfig<P>, global: &GlobalOptions) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    let sources = options
        .cacheable_header_keys
        .iter()
        .chain(&config.cacheable_header_keys)
        .chain(&global.cacheable_header_keys);
    for key in sources {
        if !merged.iter().any(|existing| existing.eq_ignore_ascii_case(key)) {
            merged.push(key.clone());
        }
    }
    merged
}

/// Run the transport unless `token` fires first.
async fn race(
    transport: &dyn Transport,
    request: RequestDescription,
    options: ExecutionOptions,
    token: &CancellationToken,
) -> ResultEnvelope {
    if token.is_cancelled() {
        return ResultEnvelope::failure(ApiError::aborted());
    }
    tokio::select! {
        biased;
        () = token.cancelled() => ResultEnvelope::failure(ApiError::aborted()),
        envelope = transport.execute(request, options) => envelope,
    }
}

/// Re-run the transport with this call's final request and token.
fn retry_fn(
    transport: Arc<dyn Transport>,
    request: RequestDescription,
    options: ExecutionOptions,
    token: CancellationToken,
) -> RetryFn {
    Arc::new(move || {
        let transport = Arc::clone(&transport);
        let request = request.clone();
        let options = options.clone();
        let token = token.clone();
        async move { race(transport.as_ref(), request, options, &token).await }.boxed()
    })
}
