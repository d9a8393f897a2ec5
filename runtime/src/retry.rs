//! Retry with exponential backoff.
//!
//! [`RetryMiddleware`] is an error hook: when a call fails with a retryable
//! status it re-runs the transport through the context's retry callback,
//! backing off between attempts, and recovers the call with the first
//! successful envelope.
//!
//! # Example
//!
//! ```rust
//! use apiflow_runtime::retry::{RetryMiddleware, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .build();
//!
//! let middleware = RetryMiddleware::new(policy);
//! ```
//!
//! The context carries the call's cancellation token: aborting the endpoint
//! cuts the current backoff short and no further attempt is made.

use crate::metrics::RetryMetrics;
use apiflow_core::middleware::{ErrorOutcome, Middleware, MiddlewareContext, MiddlewareError, MiddlewareOptions};
use apiflow_core::ApiError;
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::time::sleep;

/// Statuses retried by default: timeouts, throttling, transient server
/// errors and network failures (status 0).
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 7] = [0, 408, 429, 500, 502, 503, 504];

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `retryable_statuses`: [`DEFAULT_RETRYABLE_STATUSES`]
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Error statuses that trigger a retry
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
            retryable_statuses: None,
        }
    }

    /// Calculate delay for a given attempt number.
    ///
    /// Uses exponential backoff: delay = initial_delay * (multiplier ^ attempt)
    /// Capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )] // Backoff arithmetic in floating point, result clamped to max_delay
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms as u64)
    }

    /// Whether an error should be retried.
    ///
    /// Aborted calls are never retried.
    #[must_use]
    pub fn is_retryable(&self, error: &ApiError) -> bool {
        !error.is_aborted() && self.retryable_statuses.contains(&error.status)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<usize>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
    retryable_statuses: Option<Vec<u16>>,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Replace the retryable statuses.
    #[must_use]
    pub fn retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = Some(statuses.into_iter().collect());
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(3),
            initial_delay: self.initial_delay.unwrap_or(Duration::from_millis(100)),
            max_delay: self.max_delay.unwrap_or(Duration::from_secs(30)),
            multiplier: self.multiplier.unwrap_or(2.0),
            retryable_statuses: self
                .retryable_statuses
                .unwrap_or_else(|| DEFAULT_RETRYABLE_STATUSES.to_vec()),
        }
    }
}

/// Error middleware re-running failed calls with backoff.
#[derive(Debug, Clone)]
pub struct RetryMiddleware {
    options: MiddlewareOptions,
    policy: RetryPolicy,
}

impl RetryMiddleware {
    /// Register as `retry` with priority 0.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            options: MiddlewareOptions::new("retry", 0),
            policy,
        }
    }

    /// Builder: replace the registration options
    #[must_use]
    pub fn with_options(mut self, options: MiddlewareOptions) -> Self {
        self.options = options;
        self
    }

    /// The policy in use.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Middleware for RetryMiddleware {
    fn options(&self) -> &MiddlewareOptions {
        &self.options
    }

    fn on_error<'a>(
        &'a self,
        error: ApiError,
        ctx: &'a MiddlewareContext,
    ) -> BoxFuture<'a, Result<ErrorOutcome, MiddlewareError>> {
        Box::pin(async move {
            let Some(retry) = ctx.retry.clone() else {
                return Ok(ErrorOutcome::Continue(error));
            };

            let mut last_error = error;
            for attempt in 0..self.policy.max_retries {
                if !self.policy.is_retryable(&last_error) {
                    if attempt > 0 {
                        tracing::warn!(
                            endpoint = %ctx.endpoint_name,
                            status = last_error.status,
                            "Error is not retryable, giving up"
                        );
                    }
                    return Ok(ErrorOutcome::Continue(last_error));
                }

                let delay = self.policy.delay_for_attempt(attempt);
                tracing::warn!(
                    endpoint = %ctx.endpoint_name,
                    call_id = ctx.call_id,
                    attempt = attempt + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %last_error,
                    "Call failed, retrying..."
                );
                if !backoff(delay, ctx).await {
                    tracing::debug!(endpoint = %ctx.endpoint_name, "Call aborted during backoff");
                    return Ok(ErrorOutcome::Continue(ApiError::aborted()));
                }
                RetryMetrics::record_attempt();

                let envelope = retry().await;
                if envelope.ok {
                    tracing::info!(
                        endpoint = %ctx.endpoint_name,
                        attempt = attempt + 1,
                        "Call succeeded after retry"
                    );
                    RetryMetrics::record_success();
                    return Ok(ErrorOutcome::Recovered(envelope));
                }
                last_error = envelope
                    .error
                    .unwrap_or_else(|| ApiError::new(envelope.status, envelope.status_text));
            }

            if self.policy.is_retryable(&last_error) {
                tracing::error!(
                    endpoint = %ctx.endpoint_name,
                    error = %last_error,
                    "Call failed after max retries"
                );
                RetryMetrics::record_exhausted();
            }
            Ok(ErrorOutcome::Continue(last_error))
        })
    }
}

/// Wait out `delay`. Returns `false` when the call is aborted first.
async fn backoff(delay: Duration, ctx: &MiddlewareContext) -> bool {
    let Some(token) = ctx.cancellation.as_ref() else {
        sleep(delay).await;
        return true;
    };
    tokio::select! {
        biased;
        () = token.cancelled() => false,
        () = sleep(delay) => true,
    }
}
