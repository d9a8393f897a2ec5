//! Prometheus metrics for observability and monitoring.
//!
//! Metric collection covers every runtime component:
//! - Request execution (started, succeeded, failed, cancelled, latency)
//! - Cache lookups, writes and invalidations
//! - Middleware hook failures
//! - Retry attempts
//!
//! Metrics are emitted through the `metrics` facade and are no-ops until a
//! recorder is installed.
//!
//! # Example
//!
//! ```rust,no_run
//! use apiflow_runtime::metrics::MetricsRecorder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let recorder = MetricsRecorder::install()?;
//! // ... run requests ...
//! if let Some(text) = recorder.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installed Prometheus recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder")
            .field("installed", &self.handle.is_some())
            .finish()
    }
}

impl MetricsRecorder {
    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the
    /// returned recorder has no handle and [`render`](Self::render) yields
    /// `None`.
    pub fn install() -> Result<Self, MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                tracing::info!("Metrics recorder installed");
                Ok(Self {
                    handle: Some(handle),
                })
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(Self::default())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Request Metrics
    describe_counter!("apiflow_requests_total", "Total number of endpoint calls started");
    describe_counter!(
        "apiflow_requests_succeeded_total",
        "Total number of endpoint calls resolved with data"
    );
    describe_counter!(
        "apiflow_requests_failed_total",
        "Total number of endpoint calls that raised an error"
    );
    describe_counter!(
        "apiflow_requests_cancelled_total",
        "Total number of in-flight calls aborted"
    );
    describe_histogram!(
        "apiflow_request_duration_seconds",
        "Time from call start to resolution"
    );

    // Cache Metrics
    describe_counter!("apiflow_cache_hits_total", "Total number of cache hits");
    describe_counter!("apiflow_cache_misses_total", "Total number of cache misses");
    describe_counter!("apiflow_cache_writes_total", "Total number of cache entries written");
    describe_counter!(
        "apiflow_cache_invalidations_total",
        "Total number of cache entries removed by tag invalidation"
    );

    // Middleware Metrics
    describe_counter!(
        "apiflow_middleware_failures_total",
        "Total number of middleware hooks that failed and were skipped"
    );

    // Retry Metrics
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_successes_total", "Total number of successful retries");
    describe_counter!(
        "retry_exhausted_total",
        "Total number of retry attempts that exhausted max retries"
    );
}

/// Request metrics recorder.
pub struct RequestMetrics;

impl RequestMetrics {
    /// Record a call start.
    pub fn record_start(endpoint: &str) {
        counter!("apiflow_requests_total", "endpoint" => endpoint.to_string()).increment(1);
    }

    /// Record a call resolved with data.
    pub fn record_success(endpoint: &str, duration: Duration, from_cache: bool) {
        counter!(
            "apiflow_requests_succeeded_total",
            "endpoint" => endpoint.to_string(),
            "from_cache" => from_cache.to_string()
        )
        .increment(1);
        histogram!("apiflow_request_duration_seconds", "endpoint" => endpoint.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a call that raised an error.
    pub fn record_failure(endpoint: &str, duration: Duration) {
        counter!("apiflow_requests_failed_total", "endpoint" => endpoint.to_string()).increment(1);
        histogram!("apiflow_request_duration_seconds", "endpoint" => endpoint.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record an abort.
    pub fn record_cancel(endpoint: &str) {
        counter!("apiflow_requests_cancelled_total", "endpoint" => endpoint.to_string()).increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recorder_install() {
        // May have no handle if another test installed a recorder first
        let recorder = MetricsRecorder::install().unwrap();

        RequestMetrics::record_start("getUser");
        RequestMetrics::record_success("getUser", Duration::from_millis(12), false);
        RetryMetrics::record_attempt();

        if let Some(rendered) = recorder.render() {
            assert!(rendered.contains("apiflow_requests_total"));
            assert!(rendered.contains("retry_attempts_total"));
        }
    }

    #[test]
    fn test_recorders_without_installed_exporter() {
        RequestMetrics::record_failure("e", Duration::from_millis(1));
        RequestMetrics::record_cancel("e");
        RetryMetrics::record_exhausted();
        assert!(MetricsRecorder::default().render().is_none());
    }

    #[test]
    fn test_debug_reports_installation() {
        let recorder = MetricsRecorder::default();
        assert_eq!(format!("{recorder:?}"), "MetricsRecorder { installed: false }");
    }
}
