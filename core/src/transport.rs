//! Transport abstraction - the function that actually performs a request.
//!
//! The engine never performs I/O itself. A transport receives the final
//! (post-middleware) [`RequestDescription`] and [`ExecutionOptions`] and
//! answers with a [`ResultEnvelope`]. Failures are reported through the
//! envelope's error arm, never by panicking.
//!
//! Transports are responsible for honoring `options.cancellation` and
//! `options.timeout`.
//!
//! # Example
//!
//! ```
//! use apiflow_core::transport::Transport;
//! use apiflow_core::{ExecutionOptions, RequestDescription, ResultEnvelope};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let transport = |request: RequestDescription, _options: ExecutionOptions| async move {
//!     ResultEnvelope::success(200, json!({ "path": request.path }))
//! };
//!
//! let envelope = transport
//!     .execute(RequestDescription::get("/ping"), ExecutionOptions::new())
//!     .await;
//! assert_eq!(envelope.data, Some(json!({ "path": "/ping" })));
//! # });
//! ```

use crate::envelope::ResultEnvelope;
use crate::request::{ExecutionOptions, RequestDescription};
use futures::future::BoxFuture;
use std::future::Future;

/// Performs a single request.
pub trait Transport: Send + Sync {
    /// Execute `request` and report the outcome as an envelope.
    fn execute(
        &self,
        request: RequestDescription,
        options: ExecutionOptions,
    ) -> BoxFuture<'static, ResultEnvelope>;
}

impl<F, Fut> Transport for F
where
    F: Fn(RequestDescription, ExecutionOptions) -> Fut + Send + Sync,
    Fut: Future<Output = ResultEnvelope> + Send + 'static,
{
    fn execute(
        &self,
        request: RequestDescription,
        options: ExecutionOptions,
    ) -> BoxFuture<'static, ResultEnvelope> {
        Box::pin(self(request, options))
    }
}
