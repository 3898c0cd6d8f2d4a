//! Built-in actions.
//!
//! All of them are outbound-only: they run through
//! [`Connection::perform`](upptalk_rpc::Connection::perform) and never claim
//! inbound traffic, so server-pushed `chat` or `profile` messages still reach
//! runtime handlers.

mod authenticate;
mod call;
mod media;

use std::sync::{Arc, OnceLock};

use serde_json::{Map, Value};
use upptalk_call::WeakCallManager;
use upptalk_core::RpcError;
use upptalk_rpc::{ActionRegistry, HttpSideChannel};

pub(crate) use authenticate::Authenticate;
pub(crate) use call::PlaceCall;
pub(crate) use media::{Chat, Profile, Upload};

/// Log in; credentials are kept for the HTTP side channel.
pub const AUTHENTICATE: &str = "authenticate";
/// Upload the attachment to the media store.
pub const UPLOAD: &str = "upload";
/// Send a chat message, uploading the attachment first.
pub const CHAT: &str = "chat";
/// Update the profile, uploading an avatar first.
pub const PROFILE: &str = "profile";
/// Place an outgoing call.
pub const CALL: &str = "call";

/// Late-bound call manager; set once the connection exists.
pub(crate) type CallSlot = Arc<OnceLock<WeakCallManager>>;

/// Registry holding every built-in action.
pub(crate) fn default_actions(http: &HttpSideChannel, calls: &CallSlot) -> ActionRegistry {
    ActionRegistry::new()
        .with(AUTHENTICATE, Authenticate)
        .with(UPLOAD, Upload::new(http.clone()))
        .with(CHAT, Chat::new(http.clone()))
        .with(PROFILE, Profile::new(http.clone()))
        .with(CALL, PlaceCall::new(calls.clone()))
}

/// Payload as a JSON object; absent means empty.
fn payload_object(payload: Option<Value>, action: &str) -> Result<Map<String, Value>, RpcError> {
    match payload {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(RpcError::invalid_params(format!(
            "{action} payload must be an object"
        ))),
    }
}
