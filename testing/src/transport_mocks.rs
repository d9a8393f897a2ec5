//! Scripted transport for executor and client tests.
//!
//! [`MockTransport`] answers from a queue of envelopes (falling back to a
//! default response), records every call, and optionally waits before
//! answering. While waiting it watches the call's cancellation token and
//! answers with an aborted error as soon as the token fires, like a real
//! transport would.

use apiflow_core::transport::Transport;
use apiflow_core::{ApiError, ExecutionOptions, RequestDescription, ResultEnvelope};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A call observed by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Request as received (after middleware)
    pub request: RequestDescription,
    /// Token the call carried
    pub cancellation: Option<CancellationToken>,
    /// Timeout the call carried
    pub timeout: Option<Duration>,
}

#[derive(Debug, Default)]
struct MockState {
    queue: VecDeque<ResultEnvelope>,
    fallback: Option<ResultEnvelope>,
    calls: Vec<RecordedCall>,
}

/// In-memory transport with scripted responses.
///
/// # Example
///
/// ```
/// use apiflow_testing::MockTransport;
/// use apiflow_core::transport::Transport;
/// use apiflow_core::{ExecutionOptions, RequestDescription, ResultEnvelope};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let transport = MockTransport::new().respond_with(ResultEnvelope::success(200, json!("pong")));
/// let envelope = transport.execute(RequestDescription::get("/ping"), ExecutionOptions::new()).await;
/// assert_eq!(envelope.data, Some(json!("pong")));
/// assert_eq!(transport.call_count(), 1);
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    delay: Option<Duration>,
}

impl MockTransport {
    /// Transport with no scripted responses (answers 404).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: answer every unscripted call with `envelope`
    #[must_use]
    pub fn respond_with(self, envelope: ResultEnvelope) -> Self {
        self.lock().fallback = Some(envelope);
        self
    }

    /// Builder: wait `delay` before answering
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a one-shot response, used before the fallback.
    pub fn push_response(&self, envelope: ResultEnvelope) {
        self.lock().queue.push_back(envelope);
    }

    /// Every call received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Number of calls received so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Request of the most recent call.
    #[must_use]
    pub fn last_request(&self) -> Option<RequestDescription> {
        self.lock().calls.last().map(|call| call.request.clone())
    }

    /// Token of the most recent call.
    #[must_use]
    pub fn last_token(&self) -> Option<CancellationToken> {
        self.lock()
            .calls
            .last()
            .and_then(|call| call.cancellation.clone())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_response(&self) -> ResultEnvelope {
        let mut state = self.lock();
        state
            .queue
            .pop_front()
            .or_else(|| state.fallback.clone())
            .unwrap_or_else(|| ResultEnvelope::failure(ApiError::new(404, "No mock response")))
    }
}

impl Transport for MockTransport {
    fn execute(
        &self,
        request: RequestDescription,
        options: ExecutionOptions,
    ) -> BoxFuture<'static, ResultEnvelope> {
        let token = options.cancellation.clone();
        self.lock().calls.push(RecordedCall {
            request,
            cancellation: token.clone(),
            timeout: options.timeout,
        });

        let this = self.clone();
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                let token = token.unwrap_or_default();
                tokio::select! {
                    () = token.cancelled() => return ResultEnvelope::failure(ApiError::aborted()),
                    () = tokio::time::sleep(delay) => {}
                }
            } else if token.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return ResultEnvelope::failure(ApiError::aborted());
            }
            this.next_response()
        })
    }
}
