//! RPC error codes, the RPC error type, and codec errors.

use serde_json::{Value, json};
use thiserror::Error;

// ── Error code constants ────────────────────────────────────────────

/// No handler answered an inbound request.
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
/// Wire text sent back for an unanswered request.
pub const METHOD_NOT_FOUND_MESSAGE: &str = "Method not found";
/// A local capability (e.g. peer media) is missing.
pub const FEATURE_NOT_AVAILABLE: &str = "FEATURE_NOT_AVAILABLE";
/// The connection closed before a response arrived.
pub const CONNECTION_CLOSED: &str = "CONNECTION_CLOSED";
/// No transport link is attached.
pub const NOT_CONNECTED: &str = "NOT_CONNECTED";
/// Invalid or missing parameters.
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// Unexpected internal error.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// The remote peer answered with an error value.
pub const REMOTE_ERROR: &str = "REMOTE_ERROR";

/// Error outcome of an RPC exchange, as seen by the caller or sent by a handler.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum RpcError {
    /// No handler claimed the request.
    #[error("Method not found")]
    MethodNotFound,

    /// Required parameter missing or of the wrong shape.
    #[error("{message}")]
    InvalidParams {
        /// Description of what is wrong.
        message: String,
    },

    /// Unexpected local failure.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },

    /// A local capability is missing.
    #[error("{message}")]
    FeatureNotAvailable {
        /// Description.
        message: String,
    },

    /// The connection closed while the request was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// No transport link is attached to the connection.
    #[error("not connected")]
    NotConnected,

    /// The remote peer answered with an arbitrary `error` value.
    #[error("remote error: {0}")]
    Remote(Value),
}

impl RpcError {
    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MethodNotFound => METHOD_NOT_FOUND,
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::Internal { .. } => INTERNAL_ERROR,
            Self::FeatureNotAvailable { .. } => FEATURE_NOT_AVAILABLE,
            Self::ConnectionClosed => CONNECTION_CLOSED,
            Self::NotConnected => NOT_CONNECTED,
            Self::Remote(_) => REMOTE_ERROR,
        }
    }

    /// Shorthand for [`RpcError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for [`RpcError::InvalidParams`].
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Value placed in the `error` field of an outgoing response.
    ///
    /// `MethodNotFound` goes out as the bare string `"Method not found"`;
    /// remote errors are echoed unchanged; everything else becomes
    /// `{code, message}`.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::MethodNotFound => Value::String(METHOD_NOT_FOUND_MESSAGE.to_owned()),
            Self::Remote(value) => value.clone(),
            other => json!({ "code": other.code(), "message": other.to_string() }),
        }
    }

    /// Interpret the `error` field of an inbound response.
    pub fn from_wire(value: Value) -> Self {
        match value.as_str() {
            Some(METHOD_NOT_FOUND_MESSAGE) => Self::MethodNotFound,
            _ => Self::Remote(value),
        }
    }
}

/// Failure to turn wire text into a [`crate::Message`].
#[derive(Debug, Error)]
pub enum CodecError {
    /// The text is not valid JSON, or a field has the wrong type.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame is valid JSON but neither an object nor an array.
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// The frame mixes request and response fields, or has neither.
    #[error("ambiguous frame: {0}")]
    Ambiguous(&'static str),

    /// The `id` field is neither a string nor an integer.
    #[error("invalid id: {0}")]
    InvalidId(Value),
}
