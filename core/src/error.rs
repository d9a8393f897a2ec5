//! Errors surfaced to callers of `fetch`/`request`.
//!
//! Ancillary failures (cache, store, middleware, listeners) are logged and
//! swallowed by the runtime; only the variants below ever reach a caller.

use crate::envelope::ApiError;
use thiserror::Error;

/// Failure of a single endpoint call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    /// The transport reported an error and no middleware recovered it
    #[error("Request failed: {0}")]
    Transport(ApiError),

    /// The endpoint name is not registered on the client
    #[error("Endpoint '{0}' is not registered")]
    UnknownEndpoint(String),

    /// Parameters could not be converted into the endpoint's parameter type
    #[error("Invalid parameters for endpoint '{endpoint}': {reason}")]
    InvalidParams {
        /// Endpoint name
        endpoint: String,
        /// Conversion failure
        reason: String,
    },

    /// The endpoint's request builder failed
    #[error("Failed to build request for endpoint '{endpoint}': {reason}")]
    BuildRequest {
        /// Endpoint name
        endpoint: String,
        /// Builder failure
        reason: String,
    },

    /// Response data did not match the endpoint's result type
    #[error("Failed to decode response for endpoint '{endpoint}': {reason}")]
    Decode {
        /// Endpoint name
        endpoint: String,
        /// Decoding failure
        reason: String,
    },
}

impl RequestError {
    /// The transport error, if this failure came from the transport.
    #[must_use]
    pub const fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Transport(error) => Some(error),
            _ => None,
        }
    }

    /// Whether the call ended because it was aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.api_error().is_some_and(ApiError::is_aborted)
    }
}

impl From<ApiError> for RequestError {
    fn from(error: ApiError) -> Self {
        Self::Transport(error)
    }
}
