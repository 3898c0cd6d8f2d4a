//! Connection and HTTP side-channel errors.

use thiserror::Error;
use upptalk_core::{CodecError, RpcError};

/// Failure of a local connection operation.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// No transport link is attached.
    #[error("not connected")]
    NotConnected,

    /// A link is already attached; close it first.
    #[error("connection already open")]
    AlreadyOpen,

    /// The outbound queue is full.
    #[error("outbound queue full")]
    SendFailed,

    /// The name is one of the local lifecycle events.
    #[error("'{0}' is a reserved event name")]
    ReservedName(String),

    /// The transport could not be established or failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A connection URL could not be built.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// An outbound message could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<ConnectionError> for RpcError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::NotConnected => Self::NotConnected,
            ConnectionError::ReservedName(name) => {
                Self::invalid_params(format!("'{name}' is a reserved event name"))
            }
            other => Self::internal(other.to_string()),
        }
    }
}

/// Failure of an HTTP side-channel request.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Building, sending, or reading the request failed.
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("http status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// The response body is not JSON.
    #[error("invalid response body: {0}")]
    Json(#[from] serde_json::Error),

    /// The request URL could not be built.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl From<HttpError> for RpcError {
    fn from(err: HttpError) -> Self {
        Self::internal(err.to_string())
    }
}
