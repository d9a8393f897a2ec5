//! Result envelope returned by a transport.
//!
//! A [`ResultEnvelope`] carries either `data` or `error`, selected by `ok`.
//! Use [`ResultEnvelope::success`] and [`ResultEnvelope::failure`] to build
//! one; both keep the two arms mutually exclusive.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Status used for calls aborted through their cancellation token.
pub const STATUS_ABORTED: u16 = 499;

/// Error arm of a [`ResultEnvelope`].
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{status} {message}")]
pub struct ApiError {
    /// Status code (0 for network-level failures)
    pub status: u16,
    /// Human-readable message
    pub message: String,
    /// Machine-readable code, if the server supplied one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Structured error payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ApiError {
    /// Create an error with a status and message.
    #[must_use]
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: None,
            details: None,
        }
    }

    /// Network-level failure (no response received).
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(0, message)
    }

    /// The call was cancelled before the transport answered.
    #[must_use]
    pub fn aborted() -> Self {
        Self::new(STATUS_ABORTED, "Request aborted").with_code("ABORTED")
    }

    /// Builder: set the machine-readable code
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Builder: attach structured details
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether this error came from cancellation.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.status == STATUS_ABORTED && self.code.as_deref() == Some("ABORTED")
    }
}

/// File information attached to binary responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Suggested file name
    pub name: Option<String>,
    /// MIME type
    pub mime_type: Option<String>,
    /// Size in bytes
    pub size: Option<u64>,
}

/// Transport-populated request metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Headers that were sent with the request
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub request_headers: BTreeMap<String, String>,
    /// Subset of headers eligible for the cache key
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cacheable_headers: BTreeMap<String, String>,
    /// File metadata for binary responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMetadata>,
}

/// Uniform response shape produced by a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope {
    /// Response payload when `ok`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error payload when not `ok`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    /// Selects which arm is meaningful
    pub ok: bool,
    /// Status code
    pub status: u16,
    /// Status text
    #[serde(default)]
    pub status_text: String,
    /// Response headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Optional transport metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
}

impl ResultEnvelope {
    /// Successful envelope carrying `data`.
    #[must_use]
    pub fn success(status: u16, data: Value) -> Self {
        Self {
            data: Some(data),
            error: None,
            ok: true,
            status,
            status_text: status_text(status).to_string(),
            headers: BTreeMap::new(),
            metadata: None,
        }
    }

    /// Failed envelope carrying `error`; the status mirrors the error's.
    #[must_use]
    pub fn failure(error: ApiError) -> Self {
        let status = error.status;
        Self {
            data: None,
            error: Some(error),
            ok: false,
            status,
            status_text: status_text(status).to_string(),
            headers: BTreeMap::new(),
            metadata: None,
        }
    }

    /// Builder: add a response header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Builder: attach metadata
    #[must_use]
    pub fn with_metadata(mut self, metadata: ResponseMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Convert into a `Result`, choosing the arm by `ok`.
    ///
    /// A successful envelope without data yields `Value::Null`; a failed
    /// envelope without an error yields a generic error built from the status.
    ///
    /// # Errors
    ///
    /// Returns the envelope's [`ApiError`] when `ok` is false.
    pub fn into_result(self) -> Result<Value, ApiError> {
        if self.ok {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| ApiError::new(self.status, self.status_text)))
        }
    }
}

/// Reason phrase for common status codes.
#[must_use]
pub const fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        STATUS_ABORTED => "Client Closed Request",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        0 => "Network Error",
        _ => "",
    }
}
