//! Call signaling errors.

use thiserror::Error;
use upptalk_core::RpcError;
use upptalk_rpc::ConnectionError;

use crate::call::CallState;
use crate::media::MediaError;

/// Text reported when peer media is unavailable.
pub const NOT_SUPPORTED_MESSAGE: &str = "WebRTC not supported";

/// Failure of a local call operation.
#[derive(Debug, Error)]
pub enum CallError {
    /// No media engine, or the engine reports no support.
    #[error("{NOT_SUPPORTED_MESSAGE}")]
    FeatureNotAvailable,

    /// Media acquisition or peer negotiation failed.
    #[error(transparent)]
    Media(#[from] MediaError),

    /// No call with this id.
    #[error("unknown call: {0}")]
    UnknownCall(String),

    /// The operation is not valid in the call's current state.
    #[error("cannot {action} a call in state {state}")]
    InvalidState {
        /// Attempted operation.
        action: &'static str,
        /// State at the time.
        state: CallState,
    },

    /// A signaling packet could not be sent.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The call manager was dropped.
    #[error("call manager is gone")]
    Detached,
}

impl From<CallError> for RpcError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::FeatureNotAvailable => RpcError::FeatureNotAvailable {
                message: NOT_SUPPORTED_MESSAGE.to_owned(),
            },
            CallError::Connection(e) => e.into(),
            CallError::InvalidState { .. } | CallError::UnknownCall(_) => {
                RpcError::invalid_params(err.to_string())
            }
            other => RpcError::internal(other.to_string()),
        }
    }
}
