//! Lifecycle events broadcast by the runtime.
//!
//! Events are immutable value objects. The event bus fans them out to
//! listeners and middleware `on_event` hooks and keeps nothing afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// A call started
    RequestStart,
    /// A call resolved with data (possibly recovered by error middleware)
    RequestSuccess,
    /// A call failed
    RequestError,
    /// An in-flight call was aborted
    RequestCancel,
    /// The cache answered a call
    CacheHit,
    /// The cache had no usable entry
    CacheMiss,
    /// Cache entries were invalidated by tag
    CacheInvalidate,
}

impl EventKind {
    /// Every event kind, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::RequestStart,
        Self::RequestSuccess,
        Self::RequestError,
        Self::RequestCancel,
        Self::CacheHit,
        Self::CacheMiss,
        Self::CacheInvalidate,
    ];

    /// Wire name, e.g. `REQUEST_START`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RequestStart => "REQUEST_START",
            Self::RequestSuccess => "REQUEST_SUCCESS",
            Self::RequestError => "REQUEST_ERROR",
            Self::RequestCancel => "REQUEST_CANCEL",
            Self::CacheHit => "CACHE_HIT",
            Self::CacheMiss => "CACHE_MISS",
            Self::CacheInvalidate => "CACHE_INVALIDATE",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call-specific context attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    /// Tags of the endpoint (drives tag subscriptions)
    #[serde(default)]
    pub tags: Vec<String>,
    /// Identifier of the call that produced the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<u64>,
    /// The result came from the cache
    #[serde(default)]
    pub from_cache: bool,
    /// Error middleware turned a failure into a success
    #[serde(default)]
    pub recovered_from_error: bool,
    /// The failure did not come from the transport
    #[serde(default)]
    pub uncaught_error: bool,
    /// Response status, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Elapsed time since the call started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl EventContext {
    /// Context carrying only tags.
    #[must_use]
    pub fn with_tags(tags: Vec<String>) -> Self {
        Self {
            tags,
            ..Self::default()
        }
    }
}

/// A lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event kind
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Endpoint the event belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_name: Option<String>,
    /// When the event was created
    pub timestamp: DateTime<Utc>,
    /// Call context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<EventContext>,
    /// Kind-specific payload (request, data, error, ...)
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    /// Create an event of `kind` stamped with the current time.
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            endpoint_name: None,
            timestamp: Utc::now(),
            context: None,
            payload: Value::Null,
        }
    }

    /// Builder: set the endpoint name
    #[must_use]
    pub fn with_endpoint(mut self, endpoint_name: impl Into<String>) -> Self {
        self.endpoint_name = Some(endpoint_name.into());
        self
    }

    /// Builder: set the context
    #[must_use]
    pub fn with_context(mut self, context: EventContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Builder: set the payload
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Tags from the event context (empty without context).
    #[must_use]
    pub fn tags(&self) -> &[String] {
        self.context.as_ref().map_or(&[], |context| context.tags.as_slice())
    }
}
