//! # apiflow Core
//!
//! Core types and traits for the apiflow request orchestration engine.
//!
//! This crate defines the vocabulary shared by every layer of the engine:
//!
//! - **Request**: [`RequestDescription`] produced by an endpoint from its parameters,
//!   plus per-call [`ExecutionOptions`]
//! - **Envelope**: [`ResultEnvelope`], the uniform success/failure shape returned by a transport
//! - **Store**: the [`KeyValueStore`](store::KeyValueStore) seam for cache and state persistence
//! - **Transport**: the [`Transport`](transport::Transport) seam for the actual I/O
//! - **Middleware**: the [`Middleware`](middleware::Middleware) hook set and its context
//! - **Events**: lifecycle [`Event`](event::Event) values broadcast by the runtime
//!
//! The runtime crate wires these together; this crate contains no I/O.
//!
//! ## Example
//!
//! ```
//! use apiflow_core::{Method, RequestDescription, ResultEnvelope};
//! use serde_json::json;
//!
//! let request = RequestDescription::get("/users/1").with_query("expand", json!("profile"));
//! assert_eq!(request.method, Method::Get);
//!
//! let envelope = ResultEnvelope::success(200, json!({"id": 1}));
//! assert!(envelope.ok);
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use tokio_util::sync::CancellationToken;

pub mod envelope;
pub mod error;
pub mod event;
pub mod middleware;
pub mod request;
pub mod state;
pub mod store;
pub mod transport;

pub use envelope::{ApiError, FileMetadata, ResponseMetadata, ResultEnvelope};
pub use error::RequestError;
pub use request::{ExecutionOptions, Method, RequestDescription, ResponseFormat, RetryFn};

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// The cache manager reads expiry against this clock, so tests can
    /// move time forward without sleeping.
    ///
    /// # Examples
    ///
    /// ```
    /// use apiflow_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// assert!(clock.now_millis() > 0);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;

        /// Current time as milliseconds since the Unix epoch
        fn now_millis(&self) -> i64 {
            self.now().timestamp_millis()
        }
    }

    /// Wall clock backed by [`Utc::now`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
