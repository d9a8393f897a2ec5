//! # apiflow Testing
//!
//! Testing utilities and helpers for the apiflow request orchestration engine.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - A scripted [`MockTransport`] that records calls and honors cancellation
//! - A [`FailingStore`] for exercising best-effort cache and state paths
//! - A [`Recorder`] for capturing events and state notifications
//!
//! ## Example
//!
//! ```ignore
//! use apiflow_testing::{MockTransport, ManualClock};
//!
//! #[tokio::test]
//! async fn caches_user() {
//!     let transport = MockTransport::new().respond_with(ResultEnvelope::success(200, json!({"id": 1})));
//!     let clock = ManualClock::new();
//!     let client = Client::builder(config, transport.clone()).with_clock(Arc::new(clock.clone())).build();
//!     // ...
//!     assert_eq!(transport.call_count(), 1);
//! }
//! ```

use apiflow_core::environment::Clock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub mod store_mocks;
pub mod transport_mocks;

pub use store_mocks::{FailingStore, StoreOperation};
pub use transport_mocks::{MockTransport, RecordedCall};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{
        Arc, ChronoDuration, Clock, DateTime, Duration, Mutex, PoisonError, Utc,
    };

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use apiflow_testing::mocks::FixedClock;
    /// use apiflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one clone to the
    /// client and advance another.
    ///
    /// # Example
    ///
    /// ```
    /// use apiflow_testing::mocks::ManualClock;
    /// use apiflow_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::new();
    /// let before = clock.now_millis();
    /// clock.advance(Duration::from_millis(1500));
    /// assert_eq!(clock.now_millis() - before, 1500);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at the fixed test epoch (see [`test_clock`]).
        #[must_use]
        pub fn new() -> Self {
            Self::starting_at(test_clock().now())
        }

        /// Start at `time`.
        #[must_use]
        pub fn starting_at(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            let by = ChronoDuration::from_std(by).unwrap_or_else(|_| ChronoDuration::zero());
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }
}

/// Collects values delivered to listeners.
///
/// # Example
///
/// ```
/// use apiflow_testing::Recorder;
///
/// let recorder = Recorder::new();
/// let listener = recorder.listener();
/// listener(&3);
/// listener(&4);
/// assert_eq!(recorder.values(), vec![3, 4]);
/// ```
#[derive(Debug)]
pub struct Recorder<T> {
    values: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            values: Arc::clone(&self.values),
        }
    }
}

impl<T: Clone + Send + 'static> Recorder<T> {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A listener closure that appends every value it sees.
    #[must_use]
    pub fn listener(&self) -> impl Fn(&T) + Send + Sync + 'static {
        let values = Arc::clone(&self.values);
        move |value: &T| {
            values
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(value.clone());
        }
    }

    /// Snapshot of recorded values.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + 'static> Default for Recorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Install a `tracing` subscriber for test output (idempotent).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock};
