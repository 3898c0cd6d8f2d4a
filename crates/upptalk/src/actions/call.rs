use async_trait::async_trait;
use serde_json::{Value, json};
use upptalk_call::{MediaOptions, WeakCallManager};
use upptalk_core::RpcError;
use upptalk_rpc::{Action, ActionInput, Connection};

use super::CallSlot;

/// Starts an outgoing call. Payload: `{user, audio?, video?}`.
pub(crate) struct PlaceCall {
    calls: CallSlot,
}

impl PlaceCall {
    pub(crate) fn new(calls: CallSlot) -> Self {
        Self { calls }
    }
}

#[async_trait]
impl Action for PlaceCall {
    async fn run(&self, _conn: &Connection, input: ActionInput) -> Result<Value, RpcError> {
        let manager = self
            .calls
            .get()
            .and_then(WeakCallManager::upgrade)
            .ok_or_else(|| RpcError::internal("call manager unavailable"))?;
        let payload = input.payload.unwrap_or(Value::Null);
        let user = payload
            .get("user")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("call requires a 'user'"))?;
        let options = MediaOptions {
            audio: payload.get("audio").and_then(Value::as_bool).unwrap_or(false),
            video: payload.get("video").and_then(Value::as_bool).unwrap_or(false),
        };

        let call = manager.call(user, options).await?;
        Ok(json!({
            "id": call.id(),
            "user": call.user(),
            "state": call.state().as_str(),
        }))
    }

    fn serves_inbound(&self) -> bool {
        false
    }
}
