//! Middleware hooks and their execution context.
//!
//! A middleware is a named, prioritized set of optional hooks. Every hook has
//! a pass-through default, so implementations override only what they need.
//!
//! | hook          | receives                     | returns                                   |
//! |---------------|------------------------------|-------------------------------------------|
//! | `on_request`  | request + options            | replacement request + options             |
//! | `on_response` | successful envelope          | replacement envelope                      |
//! | `on_error`    | transport error              | [`ErrorOutcome`] (continue or recover)    |
//! | `on_event`    | lifecycle event              | nothing (fire-and-forget)                 |
//!
//! A hook that returns `Err` is logged by the runtime and skipped; the chain
//! continues with the value the hook received.

use crate::envelope::{ApiError, ResultEnvelope};
use crate::event::{Event, EventKind};
use crate::request::{ExecutionOptions, RequestDescription, RetryFn};
use crate::store::StoreError;
use futures::future::{self, BoxFuture};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Version of the [`MiddlewareContext`] layout.
pub const CONTEXT_VERSION: u32 = 1;

/// Failure of a single middleware hook.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MiddlewareError {
    /// The hook rejected its input
    #[error("Middleware failed: {0}")]
    Failed(String),

    /// The hook's own storage failed
    #[error("Middleware storage failed: {0}")]
    Store(#[from] StoreError),
}

/// Registration options of a middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiddlewareOptions {
    /// Unique name, used by `remove`
    pub name: String,
    /// Higher runs first
    pub priority: i32,
    /// Restrict to these endpoints (`None` = all)
    pub endpoints: Option<Vec<String>>,
    /// Restrict `on_event` to these kinds (`None` = all)
    pub event_types: Option<Vec<EventKind>>,
}

impl MiddlewareOptions {
    /// Options applying to every endpoint and event.
    #[must_use]
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            endpoints: None,
            event_types: None,
        }
    }

    /// Builder: restrict to endpoints
    #[must_use]
    pub fn for_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = Some(endpoints.into_iter().map(Into::into).collect());
        self
    }

    /// Builder: restrict `on_event` to kinds
    #[must_use]
    pub fn for_events(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.event_types = Some(kinds.into_iter().collect());
        self
    }

    /// Whether the middleware applies to `endpoint_name`.
    #[must_use]
    pub fn applies_to_endpoint(&self, endpoint_name: &str) -> bool {
        self.endpoints
            .as_ref()
            .is_none_or(|endpoints| endpoints.iter().any(|name| name == endpoint_name))
    }

    /// Whether `on_event` should see `kind`.
    #[must_use]
    pub fn applies_to_event(&self, kind: EventKind) -> bool {
        self.event_types
            .as_ref()
            .is_none_or(|kinds| kinds.contains(&kind))
    }
}

/// Client-wide options visible to middleware.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalOptions {
    /// Header names eligible for the cache key on every endpoint
    pub cacheable_header_keys: Vec<String>,
    /// Invalidate endpoint tags when a call fails
    pub invalidate_on_error: bool,
}

/// Supplies the current [`GlobalOptions`]; read at every hook invocation.
pub type GlobalOptionsProvider = Arc<dyn Fn() -> GlobalOptions + Send + Sync>;

/// Fields of the call in progress.
#[derive(Clone, Default)]
pub struct CallContext {
    /// Endpoint being executed
    pub endpoint_name: String,
    /// Identifier of this call
    pub call_id: u64,
    /// Endpoint tags
    pub tags: Vec<String>,
    /// Cache-key-eligible header names for this call
    pub cacheable_header_keys: Vec<String>,
    /// Re-runs the transport for this call
    pub retry: Option<RetryFn>,
    /// Fires when the call is aborted
    pub cancellation: Option<CancellationToken>,
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("endpoint_name", &self.endpoint_name)
            .field("call_id", &self.call_id)
            .field("tags", &self.tags)
            .field("cacheable_header_keys", &self.cacheable_header_keys)
            .field("retry", &self.retry.is_some())
            .field("cancellation", &self.cancellation)
            .finish()
    }
}

/// Context handed to every hook.
#[derive(Clone)]
pub struct MiddlewareContext {
    /// Layout version ([`CONTEXT_VERSION`])
    pub version: u32,
    /// Endpoint being executed
    pub endpoint_name: String,
    /// Identifier of this call
    pub call_id: u64,
    /// Endpoint tags
    pub tags: Vec<String>,
    /// Call-level cache-key headers merged with the global ones (deduplicated)
    pub cacheable_header_keys: Vec<String>,
    /// Snapshot of the global options
    pub global: GlobalOptions,
    /// Re-runs the transport for this call
    pub retry: Option<RetryFn>,
    /// Fires when the call is aborted
    pub cancellation: Option<CancellationToken>,
}

impl MiddlewareContext {
    /// Build the context from call fields and a global-options snapshot.
    #[must_use]
    pub fn build(call: &CallContext, global: GlobalOptions) -> Self {
        let mut cacheable_header_keys = call.cacheable_header_keys.clone();
        for key in &global.cacheable_header_keys {
            if !cacheable_header_keys
                .iter()
                .any(|existing| existing.eq_ignore_ascii_case(key))
            {
                cacheable_header_keys.push(key.clone());
            }
        }

        Self {
            version: CONTEXT_VERSION,
            endpoint_name: call.endpoint_name.clone(),
            call_id: call.call_id,
            tags: call.tags.clone(),
            cacheable_header_keys,
            global,
            retry: call.retry.clone(),
            cancellation: call.cancellation.clone(),
        }
    }

    /// Whether the call has been aborted.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

impl fmt::Debug for MiddlewareContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareContext")
            .field("version", &self.version)
            .field("endpoint_name", &self.endpoint_name)
            .field("call_id", &self.call_id)
            .field("tags", &self.tags)
            .field("cacheable_header_keys", &self.cacheable_header_keys)
            .field("global", &self.global)
            .field("retry", &self.retry.is_some())
            .field("cancellation", &self.cancellation)
            .finish()
    }
}

/// Result of an `on_error` hook.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorOutcome {
    /// Hand the (possibly transformed) error to the next middleware
    Continue(ApiError),
    /// Stop the chain and resolve the call with this envelope
    Recovered(ResultEnvelope),
}

/// Request/response/error/event interceptor.
///
/// # Example
///
/// ```
/// use apiflow_core::middleware::{Middleware, MiddlewareContext, MiddlewareError, MiddlewareOptions};
/// use apiflow_core::{ExecutionOptions, RequestDescription};
/// use futures::future::BoxFuture;
///
/// struct AuthHeader {
///     options: MiddlewareOptions,
/// }
///
/// impl Middleware for AuthHeader {
///     fn options(&self) -> &MiddlewareOptions {
///         &self.options
///     }
///
///     fn on_request<'a>(
///         &'a self,
///         request: RequestDescription,
///         options: ExecutionOptions,
///         _ctx: &'a MiddlewareContext,
///     ) -> BoxFuture<'a, Result<(RequestDescription, ExecutionOptions), MiddlewareError>> {
///         Box::pin(async move { Ok((request.with_header("authorization", "Bearer t"), options)) })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync {
    /// Registration options.
    fn options(&self) -> &MiddlewareOptions;

    /// Transform the outgoing request.
    ///
    /// # Errors
    ///
    /// An error makes the runtime skip this hook.
    fn on_request<'a>(
        &'a self,
        request: RequestDescription,
        options: ExecutionOptions,
        _ctx: &'a MiddlewareContext,
    ) -> BoxFuture<'a, Result<(RequestDescription, ExecutionOptions), MiddlewareError>> {
        Box::pin(future::ready(Ok((request, options))))
    }

    /// Transform a successful (or cached) envelope.
    ///
    /// # Errors
    ///
    /// An error makes the runtime skip this hook.
    fn on_response<'a>(
        &'a self,
        envelope: ResultEnvelope,
        _ctx: &'a MiddlewareContext,
    ) -> BoxFuture<'a, Result<ResultEnvelope, MiddlewareError>> {
        Box::pin(future::ready(Ok(envelope)))
    }

    /// Transform or recover a transport error.
    ///
    /// # Errors
    ///
    /// An error makes the runtime skip this hook.
    fn on_error<'a>(
        &'a self,
        error: ApiError,
        _ctx: &'a MiddlewareContext,
    ) -> BoxFuture<'a, Result<ErrorOutcome, MiddlewareError>> {
        Box::pin(future::ready(Ok(ErrorOutcome::Continue(error))))
    }

    /// Observe a lifecycle event.
    ///
    /// # Errors
    ///
    /// Errors are logged and otherwise ignored.
    fn on_event(&self, _event: &Event) -> Result<(), MiddlewareError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_lists_default_to_everything() {
        let options = MiddlewareOptions::new("log", 0);
        assert!(options.applies_to_endpoint("anything"));
        assert!(options.applies_to_event(EventKind::CacheMiss));
    }

    #[test]
    fn allow_lists_restrict() {
        let options = MiddlewareOptions::new("auth", 10)
            .for_endpoints(["getUser"])
            .for_events([EventKind::RequestError]);
        assert!(options.applies_to_endpoint("getUser"));
        assert!(!options.applies_to_endpoint("listUsers"));
        assert!(options.applies_to_event(EventKind::RequestError));
        assert!(!options.applies_to_event(EventKind::RequestStart));
    }

    #[test]
    fn context_merges_header_keys_without_duplicates() {
        let call = CallContext {
            endpoint_name: "getUser".into(),
            call_id: 7,
            cacheable_header_keys: vec!["X-Tenant".into()],
            ..CallContext::default()
        };
        let global = GlobalOptions {
            cacheable_header_keys: vec!["x-tenant".into(), "accept-language".into()],
            invalidate_on_error: false,
        };

        let ctx = MiddlewareContext::build(&call, global);
        assert_eq!(ctx.version, CONTEXT_VERSION);
        assert_eq!(ctx.call_id, 7);
        assert_eq!(ctx.cacheable_header_keys, vec!["X-Tenant", "accept-language"]);
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn context_reports_cancellation_of_the_call() {
        let token = CancellationToken::new();
        let call = CallContext {
            endpoint_name: "getUser".into(),
            cancellation: Some(token.clone()),
            ..CallContext::default()
        };
        let ctx = MiddlewareContext::build(&call, GlobalOptions::default());

        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
