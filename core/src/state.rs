//! Per-endpoint status record.
//!
//! ```text
//!  idle ──► loading ──► success
//!   ▲          │
//!   │          └──────► error ──► success (only via error-middleware recovery)
//!   └──── reset ───────────┘
//! ```

use crate::envelope::ApiError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of the most recent call to an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    /// No call yet, or reset
    #[default]
    Idle,
    /// A call is in flight
    Loading,
    /// The last call produced data
    Success,
    /// The last call failed
    Error,
}

/// Bookkeeping attached to an [`EndpointState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMeta {
    /// Last time the record changed
    pub updated_at: DateTime<Utc>,
    /// The data came from the cache
    #[serde(default)]
    pub from_cache: bool,
    /// The data came from error-middleware recovery
    #[serde(default)]
    pub recovered: bool,
}

impl Default for StateMeta {
    fn default() -> Self {
        Self {
            updated_at: Utc::now(),
            from_cache: false,
            recovered: false,
        }
    }
}

/// State record of one endpoint.
///
/// `T` defaults to raw JSON; typed endpoints convert with [`EndpointState::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointState<T = Value> {
    /// Current status
    pub status: EndpointStatus,
    /// Data of the last successful call
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    /// Error of the last failed call
    #[serde(default)]
    pub error: Option<ApiError>,
    /// Bookkeeping
    #[serde(default)]
    pub meta: StateMeta,
}

impl<T> Default for EndpointState<T> {
    fn default() -> Self {
        Self {
            status: EndpointStatus::Idle,
            data: None,
            error: None,
            meta: StateMeta::default(),
        }
    }
}

impl<T> EndpointState<T> {
    /// Fresh idle state.
    #[must_use]
    pub fn idle() -> Self {
        Self::default()
    }

    /// Whether a call is in flight.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.status == EndpointStatus::Loading
    }
}

impl EndpointState<Value> {
    /// Convert the JSON data into `T`; data that does not fit becomes `None`.
    #[must_use]
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> EndpointState<T> {
        EndpointState {
            status: self.status,
            data: self
                .data
                .clone()
                .and_then(|data| serde_json::from_value(data).ok()),
            error: self.error.clone(),
            meta: self.meta.clone(),
        }
    }
}

/// Partial update merged into an [`EndpointState`].
///
/// `None` fields keep the current value; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    /// New status
    pub status: Option<EndpointStatus>,
    /// New data
    pub data: Option<Option<Value>>,
    /// New error
    pub error: Option<Option<ApiError>>,
    /// New `from_cache` flag
    pub from_cache: Option<bool>,
    /// New `recovered` flag
    pub recovered: Option<bool>,
}

impl StateUpdate {
    /// Transition to `loading`, clearing the previous error.
    #[must_use]
    pub fn loading() -> Self {
        Self {
            status: Some(EndpointStatus::Loading),
            error: Some(None),
            ..Self::default()
        }
    }

    /// Transition to `success` with data.
    #[must_use]
    pub fn success(data: Value) -> Self {
        Self {
            status: Some(EndpointStatus::Success),
            data: Some(Some(data)),
            error: Some(None),
            from_cache: Some(false),
            recovered: Some(false),
        }
    }

    /// Transition to `error`.
    #[must_use]
    pub fn error(error: ApiError) -> Self {
        Self {
            status: Some(EndpointStatus::Error),
            error: Some(Some(error)),
            from_cache: Some(false),
            recovered: Some(false),
            ..Self::default()
        }
    }

    /// Builder: mark as served from cache
    #[must_use]
    pub const fn from_cache(mut self) -> Self {
        self.from_cache = Some(true);
        self
    }

    /// Builder: mark as recovered by error middleware
    #[must_use]
    pub const fn recovered(mut self) -> Self {
        self.recovered = Some(true);
        self
    }

    /// Merge into `state`, stamping `updated_at`.
    pub fn apply(self, state: &mut EndpointState) {
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(data) = self.data {
            state.data = data;
        }
        if let Some(error) = self.error {
            state.error = error;
        }
        if let Some(from_cache) = self.from_cache {
            state.meta.from_cache = from_cache;
        }
        if let Some(recovered) = self.recovered {
            state.meta.recovered = recovered;
        }
        state.meta.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn loading_keeps_previous_data() {
        let mut state = EndpointState::idle();
        StateUpdate::success(json!({"id": 1})).apply(&mut state);
        StateUpdate::loading().apply(&mut state);

        assert_eq!(state.status, EndpointStatus::Loading);
        assert_eq!(state.data, Some(json!({"id": 1})));
    }

    #[test]
    fn error_clears_flags_and_keeps_data() {
        let mut state = EndpointState::idle();
        StateUpdate::success(json!(1)).from_cache().apply(&mut state);
        StateUpdate::error(ApiError::new(500, "boom")).apply(&mut state);

        assert_eq!(state.status, EndpointStatus::Error);
        assert!(!state.meta.from_cache);
        assert_eq!(state.error.as_ref().map(|e| e.status), Some(500));
    }

    #[test]
    fn decode_drops_mismatched_data() {
        let mut state = EndpointState::idle();
        StateUpdate::success(json!("not a number")).apply(&mut state);
        let typed: EndpointState<u32> = state.decode();
        assert_eq!(typed.status, EndpointStatus::Success);
        assert_eq!(typed.data, None);
    }
}
