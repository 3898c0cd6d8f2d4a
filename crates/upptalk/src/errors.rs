//! Client construction and connect errors.

use thiserror::Error;
use upptalk_call::CallError;
use upptalk_rpc::{ConnectionError, HttpError};
use upptalk_settings::SettingsError;

/// Failure building or connecting a [`Client`](crate::Client).
#[derive(Debug, Error)]
pub enum ClientError {
    /// Settings could not be loaded or are invalid.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// The connection could not be opened.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The HTTP side channel could not be built.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// Call signaling could not be set up.
    #[error(transparent)]
    Call(#[from] CallError),
}
