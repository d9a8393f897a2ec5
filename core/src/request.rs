//! Request descriptions and per-call execution options.
//!
//! A [`RequestDescription`] is the pure output of an endpoint's request
//! builder. It is moved through the middleware chain by value, so every
//! middleware works on its own copy and the builder's output is never
//! mutated behind the caller's back.

use crate::envelope::ResultEnvelope;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// HTTP-style request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
    /// `HEAD`
    Head,
    /// `OPTIONS`
    Options,
}

impl Method {
    /// Canonical upper-case name of the method.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the transport should decode the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Parse as JSON (default)
    Json,
    /// Raw text
    Text,
    /// Binary blob
    Blob,
    /// Binary buffer
    ArrayBuffer,
    /// Multipart form data
    FormData,
}

/// Description of a single request, produced by an endpoint from its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescription {
    /// Path relative to the transport's base URL
    pub path: String,
    /// Request method
    pub method: Method,
    /// Optional request body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Query parameters, kept ordered for stable serialization
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, Value>,
    /// Request headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Preferred response decoding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

impl RequestDescription {
    /// Create a request with the given method and path.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method,
            body: None,
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            response_format: None,
        }
    }

    /// Shorthand for a `GET` request.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// Shorthand for a `POST` request with a JSON body.
    #[must_use]
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    /// Builder: set the body
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Builder: add a query parameter
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: Value) -> Self {
        self.query.insert(key.into(), value);
        self
    }

    /// Builder: add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Builder: set the response format
    #[must_use]
    pub const fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    /// Look up a header by name, ignoring ASCII case.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Callback that re-runs the transport for the current call.
///
/// The executor installs one per call so error middleware can retry with the
/// exact request and options that failed.
pub type RetryFn = Arc<dyn Fn() -> BoxFuture<'static, ResultEnvelope> + Send + Sync>;

/// Per-call overrides for a single execution.
#[derive(Clone, Default)]
pub struct ExecutionOptions {
    /// Caller-owned cancellation token. When absent the executor creates one
    /// and registers it so `abort(endpoint)` can reach it.
    pub cancellation: Option<CancellationToken>,
    /// Transport timeout; enforced by the transport, not the executor
    pub timeout: Option<Duration>,
    /// Extra headers merged over the endpoint's request headers
    pub headers: BTreeMap<String, String>,
    /// Force caching on for this call
    pub enable_cache: bool,
    /// Force caching off for this call (wins over `enable_cache`)
    pub disable_cache: bool,
    /// Header names whose values participate in the cache key
    pub cacheable_header_keys: Vec<String>,
    /// Response format override
    pub response_format: Option<ResponseFormat>,
    /// Retry callback visible to error middleware
    pub retry: Option<RetryFn>,
}

impl ExecutionOptions {
    /// Options with every override unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: use a caller-owned cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Builder: set the transport timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builder: add an extra header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Builder: force caching on
    #[must_use]
    pub const fn enable_cache(mut self) -> Self {
        self.enable_cache = true;
        self
    }

    /// Builder: force caching off
    #[must_use]
    pub const fn disable_cache(mut self) -> Self {
        self.disable_cache = true;
        self
    }

    /// Builder: declare a header eligible for the cache key
    #[must_use]
    pub fn with_cacheable_header(mut self, name: impl Into<String>) -> Self {
        self.cacheable_header_keys.push(name.into());
        self
    }

    /// Builder: override the response format
    #[must_use]
    pub const fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    /// Whether the call has been cancelled through its token.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

impl fmt::Debug for ExecutionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionOptions")
            .field("cancellation", &self.cancellation.is_some())
            .field("timeout", &self.timeout)
            .field("headers", &self.headers)
            .field("enable_cache", &self.enable_cache)
            .field("disable_cache", &self.disable_cache)
            .field("cacheable_header_keys", &self.cacheable_header_keys)
            .field("response_format", &self.response_format)
            .field("retry", &self.retry.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_lookup_ignores_case() {
        let request = RequestDescription::get("/a").with_header("X-Tenant", "acme");
        assert_eq!(request.header("x-tenant"), Some("acme"));
        assert_eq!(request.header("x-other"), None);
    }

    #[test]
    fn method_serializes_upper_case() -> Result<(), serde_json::Error> {
        assert_eq!(serde_json::to_value(Method::Delete)?, json!("DELETE"));
        let parsed: Method = serde_json::from_value(json!("PATCH"))?;
        assert_eq!(parsed, Method::Patch);
        Ok(())
    }

    #[test]
    fn empty_fields_are_omitted_when_serialized() -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(RequestDescription::get("/users"))?;
        assert_eq!(value, json!({"path": "/users", "method": "GET"}));
        Ok(())
    }

    #[test]
    fn disable_wins_is_visible_on_options() {
        let options = ExecutionOptions::new().enable_cache().disable_cache();
        assert!(options.enable_cache && options.disable_cache);
        assert!(!options.is_cancelled());
    }
}
