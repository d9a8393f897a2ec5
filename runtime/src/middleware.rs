//! Middleware chain.
//!
//! [`MiddlewareManager`] keeps registered middleware sorted by descending
//! priority (insertion order among equals) and folds each hook over the
//! chain. A hook that fails, by returning `Err` or by panicking, is logged
//! and skipped: the next middleware sees the value the failing hook received.
//!
//! The [`MiddlewareContext`] is rebuilt for every hook invocation from the
//! call fields and the current [`GlobalOptions`], so changes to client-wide
//! options are visible to calls already in flight.
//!
//! Two ready-made middleware live here: [`FnMiddleware`] for closure-backed
//! hooks and [`TracingMiddleware`] for structured request logging. Retry
//! lives in [`crate::retry`].

use apiflow_core::event::Event;
use apiflow_core::middleware::{
    CallContext, ErrorOutcome, GlobalOptions, GlobalOptionsProvider, Middleware,
    MiddlewareContext, MiddlewareError, MiddlewareOptions,
};
use apiflow_core::{ApiError, ExecutionOptions, RequestDescription, ResultEnvelope};
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::Level;

/// Ordered middleware chain.
pub struct MiddlewareManager {
    chain: RwLock<Vec<Arc<dyn Middleware>>>,
    global: GlobalOptionsProvider,
}

impl std::fmt::Debug for MiddlewareManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareManager")
            .field("chain", &self.names())
            .finish_non_exhaustive()
    }
}

impl Default for MiddlewareManager {
    fn default() -> Self {
        Self::new(Arc::new(GlobalOptions::default))
    }
}

impl MiddlewareManager {
    /// Create an empty chain reading global options from `global`.
    #[must_use]
    pub fn new(global: GlobalOptionsProvider) -> Self {
        Self {
            chain: RwLock::new(Vec::new()),
            global,
        }
    }

    /// Add a middleware and re-sort the chain.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        let mut chain = self.chain.write().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(
            name = %middleware.options().name,
            priority = middleware.options().priority,
            "Registering middleware"
        );
        chain.push(middleware);
        // Stable sort keeps insertion order for equal priorities
        chain.sort_by(|a, b| b.options().priority.cmp(&a.options().priority));
    }

    /// Remove every middleware named `name`. Returns whether any was removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut chain = self.chain.write().unwrap_or_else(PoisonError::into_inner);
        let before = chain.len();
        chain.retain(|middleware| middleware.options().name != name);
        chain.len() != before
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.chain
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Names in execution order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.chain
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|middleware| middleware.options().name.clone())
            .collect()
    }

    /// Number of registered middleware.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn applicable(&self, endpoint_name: &str) -> Vec<Arc<dyn Middleware>> {
        self.chain
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|middleware| middleware.options().applies_to_endpoint(endpoint_name))
            .cloned()
            .collect()
    }

    fn context(&self, call: &CallContext) -> MiddlewareContext {
        MiddlewareContext::build(call, (self.global)())
    }

    /// Run request hooks.
    pub async fn apply_request(
        &self,
        call: &CallContext,
        request: RequestDescription,
        options: ExecutionOptions,
    ) -> (RequestDescription, ExecutionOptions) {
        let mut current = (request, options);
        for middleware in self.applicable(&call.endpoint_name) {
            let ctx = self.context(call);
            let (request, options) = current.clone();
            let outcome = AssertUnwindSafe(async { middleware.on_request(request, options, &ctx).await })
                .catch_unwind()
                .await;
            match flatten(outcome) {
                Ok(next) => current = next,
                Err(error) => log_skip(&middleware, call, "on_request", &error),
            }
        }
        current
    }

    /// Run response hooks.
    pub async fn apply_response(&self, call: &CallContext, envelope: ResultEnvelope) -> ResultEnvelope {
        let mut current = envelope;
        for middleware in self.applicable(&call.endpoint_name) {
            let ctx = self.context(call);
            let outcome = AssertUnwindSafe(async { middleware.on_response(current.clone(), &ctx).await })
                .catch_unwind()
                .await;
            match flatten(outcome) {
                Ok(next) => current = next,
                Err(error) => log_skip(&middleware, call, "on_response", &error),
            }
        }
        current
    }

    /// Run error hooks until one recovers.
    pub async fn apply_error(&self, call: &CallContext, error: ApiError) -> ErrorOutcome {
        let mut current = error;
        for middleware in self.applicable(&call.endpoint_name) {
            let ctx = self.context(call);
            let outcome = AssertUnwindSafe(async { middleware.on_error(current.clone(), &ctx).await })
                .catch_unwind()
                .await;
            match flatten(outcome) {
                Ok(ErrorOutcome::Continue(next)) => current = next,
                Ok(ErrorOutcome::Recovered(envelope)) => {
                    tracing::debug!(
                        middleware = %middleware.options().name,
                        endpoint = %call.endpoint_name,
                        "Error recovered by middleware"
                    );
                    return ErrorOutcome::Recovered(envelope);
                }
                Err(error) => log_skip(&middleware, call, "on_error", &error),
            }
        }
        ErrorOutcome::Continue(current)
    }

    /// Fan an event out to `on_event` hooks. Never fails.
    pub fn notify_event(&self, event: &Event) {
        let chain: Vec<Arc<dyn Middleware>> = self
            .chain
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|middleware| {
                let options = middleware.options();
                options.applies_to_event(event.kind)
                    && event
                        .endpoint_name
                        .as_deref()
                        .is_none_or(|name| options.applies_to_endpoint(name))
            })
            .cloned()
            .collect();

        for middleware in chain {
            let failure = match catch_unwind(AssertUnwindSafe(|| middleware.on_event(event))) {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error.to_string()),
                Err(_) => Some("panicked".to_string()),
            };
            if let Some(error) = failure {
                tracing::warn!(
                    middleware = %middleware.options().name,
                    kind = %event.kind,
                    %error,
                    "Middleware event hook failed"
                );
            }
        }
    }
}

fn flatten<T>(
    outcome: Result<Result<T, MiddlewareError>, Box<dyn std::any::Any + Send>>,
) -> Result<T, MiddlewareError> {
    outcome.unwrap_or_else(|_| Err(MiddlewareError::Failed("hook panicked".to_string())))
}

fn log_skip(middleware: &Arc<dyn Middleware>, call: &CallContext, hook: &str, error: &MiddlewareError) {
    tracing::warn!(
        middleware = %middleware.options().name,
        endpoint = %call.endpoint_name,
        call_id = call.call_id,
        hook,
        %error,
        "Middleware hook failed, skipping"
    );
    metrics::counter!("apiflow_middleware_failures_total", "hook" => hook.to_string()).increment(1);
}

type RequestHook = Arc<
    dyn Fn(
            RequestDescription,
            ExecutionOptions,
            &MiddlewareContext,
        ) -> Result<(RequestDescription, ExecutionOptions), MiddlewareError>
        + Send
        + Sync,
>;
type ResponseHook =
    Arc<dyn Fn(ResultEnvelope, &MiddlewareContext) -> Result<ResultEnvelope, MiddlewareError> + Send + Sync>;
type ErrorHook = Arc<
    dyn Fn(ApiError, MiddlewareContext) -> BoxFuture<'static, Result<ErrorOutcome, MiddlewareError>>
        + Send
        + Sync,
>;
type EventHook = Arc<dyn Fn(&Event) -> Result<(), MiddlewareError> + Send + Sync>;

/// Closure-backed middleware.
///
/// Request, response and event hooks are synchronous closures; the error
/// hook returns a future so it can call [`MiddlewareContext::retry`].
///
/// ```
/// use apiflow_runtime::middleware::FnMiddleware;
/// use apiflow_core::middleware::MiddlewareOptions;
///
/// let auth = FnMiddleware::new(MiddlewareOptions::new("auth", 10))
///     .on_request(|request, options, _ctx| Ok((request.with_header("authorization", "Bearer t"), options)));
/// ```
#[derive(Clone)]
pub struct FnMiddleware {
    options: MiddlewareOptions,
    request: Option<RequestHook>,
    response: Option<ResponseHook>,
    error: Option<ErrorHook>,
    event: Option<EventHook>,
}

impl std::fmt::Debug for FnMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnMiddleware")
            .field("options", &self.options)
            .field("request", &self.request.is_some())
            .field("response", &self.response.is_some())
            .field("error", &self.error.is_some())
            .field("event", &self.event.is_some())
            .finish()
    }
}

impl FnMiddleware {
    /// Middleware with no hooks.
    #[must_use]
    pub const fn new(options: MiddlewareOptions) -> Self {
        Self {
            options,
            request: None,
            response: None,
            error: None,
            event: None,
        }
    }

    /// Builder: request hook
    #[must_use]
    pub fn on_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(
                RequestDescription,
                ExecutionOptions,
                &MiddlewareContext,
            ) -> Result<(RequestDescription, ExecutionOptions), MiddlewareError>
            + Send
            + Sync
            + 'static,
    {
        self.request = Some(Arc::new(hook));
        self
    }

    /// Builder: response hook
    #[must_use]
    pub fn on_response<F>(mut self, hook: F) -> Self
    where
        F: Fn(ResultEnvelope, &MiddlewareContext) -> Result<ResultEnvelope, MiddlewareError>
            + Send
            + Sync
            + 'static,
    {
        self.response = Some(Arc::new(hook));
        self
    }

    /// Builder: error hook
    #[must_use]
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(ApiError, MiddlewareContext) -> BoxFuture<'static, Result<ErrorOutcome, MiddlewareError>>
            + Send
            + Sync
            + 'static,
    {
        self.error = Some(Arc::new(hook));
        self
    }

    /// Builder: event hook
    #[must_use]
    pub fn on_event<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Event) -> Result<(), MiddlewareError> + Send + Sync + 'static,
    {
        self.event = Some(Arc::new(hook));
        self
    }
}

impl Middleware for FnMiddleware {
    fn options(&self) -> &MiddlewareOptions {
        &self.options
    }

    fn on_request<'a>(
        &'a self,
        request: RequestDescription,
        options: ExecutionOptions,
        ctx: &'a MiddlewareContext,
    ) -> BoxFuture<'a, Result<(RequestDescription, ExecutionOptions), MiddlewareError>> {
        let result = match &self.request {
            Some(hook) => hook(request, options, ctx),
            None => Ok((request, options)),
        };
        Box::pin(future::ready(result))
    }

    fn on_response<'a>(
        &'a self,
        envelope: ResultEnvelope,
        ctx: &'a MiddlewareContext,
    ) -> BoxFuture<'a, Result<ResultEnvelope, MiddlewareError>> {
        let result = match &self.response {
            Some(hook) => hook(envelope, ctx),
            None => Ok(envelope),
        };
        Box::pin(future::ready(result))
    }

    fn on_error<'a>(
        &'a self,
        error: ApiError,
        ctx: &'a MiddlewareContext,
    ) -> BoxFuture<'a, Result<ErrorOutcome, MiddlewareError>> {
        match &self.error {
            Some(hook) => hook(error, ctx.clone()),
            None => Box::pin(future::ready(Ok(ErrorOutcome::Continue(error)))),
        }
    }

    fn on_event(&self, event: &Event) -> Result<(), MiddlewareError> {
        self.event.as_ref().map_or(Ok(()), |hook| hook(event))
    }
}

/// Logs every hook through `tracing` at a fixed level.
#[derive(Debug, Clone)]
pub struct TracingMiddleware {
    options: MiddlewareOptions,
    level: Level,
}

impl Default for TracingMiddleware {
    fn default() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl TracingMiddleware {
    /// Register as `tracing` with the lowest priority so it sees final values.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self {
            options: MiddlewareOptions::new("tracing", i32::MIN),
            level,
        }
    }

    /// Builder: replace the registration options
    #[must_use]
    pub fn with_options(mut self, options: MiddlewareOptions) -> Self {
        self.options = options;
        self
    }
}

macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        let level = $level;
        if level == Level::TRACE {
            tracing::trace!($($arg)+);
        } else if level == Level::DEBUG {
            tracing::debug!($($arg)+);
        } else if level == Level::INFO {
            tracing::info!($($arg)+);
        } else if level == Level::WARN {
            tracing::warn!($($arg)+);
        } else {
            tracing::error!($($arg)+);
        }
    };
}

impl Middleware for TracingMiddleware {
    fn options(&self) -> &MiddlewareOptions {
        &self.options
    }

    fn on_request<'a>(
        &'a self,
        request: RequestDescription,
        options: ExecutionOptions,
        ctx: &'a MiddlewareContext,
    ) -> BoxFuture<'a, Result<(RequestDescription, ExecutionOptions), MiddlewareError>> {
        log_at!(
            self.level,
            endpoint = %ctx.endpoint_name,
            call_id = ctx.call_id,
            method = %request.method,
            path = %request.path,
            "Request"
        );
        Box::pin(future::ready(Ok((request, options))))
    }

    fn on_response<'a>(
        &'a self,
        envelope: ResultEnvelope,
        ctx: &'a MiddlewareContext,
    ) -> BoxFuture<'a, Result<ResultEnvelope, MiddlewareError>> {
        log_at!(
            self.level,
            endpoint = %ctx.endpoint_name,
            call_id = ctx.call_id,
            status = envelope.status,
            "Response"
        );
        Box::pin(future::ready(Ok(envelope)))
    }

    fn on_error<'a>(
        &'a self,
        error: ApiError,
        ctx: &'a MiddlewareContext,
    ) -> BoxFuture<'a, Result<ErrorOutcome, MiddlewareError>> {
        log_at!(
            self.level,
            endpoint = %ctx.endpoint_name,
            call_id = ctx.call_id,
            status = error.status,
            message = %error.message,
            "Request failed"
        );
        Box::pin(future::ready(Ok(ErrorOutcome::Continue(error))))
    }

    fn on_event(&self, event: &Event) -> Result<(), MiddlewareError> {
        log_at!(
            self.level,
            kind = %event.kind,
            endpoint = event.endpoint_name.as_deref(),
            "Event"
        );
        Ok(())
    }
}
