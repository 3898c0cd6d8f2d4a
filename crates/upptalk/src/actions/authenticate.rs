use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use upptalk_core::RpcError;
use upptalk_rpc::{Action, ActionInput, Connection, Credentials};

use super::AUTHENTICATE;

/// Sends `authenticate`, keeping the credentials it was given and any the
/// server hands back.
pub(crate) struct Authenticate;

#[async_trait]
impl Action for Authenticate {
    async fn run(&self, conn: &Connection, input: ActionInput) -> Result<Value, RpcError> {
        let payload = input
            .payload
            .ok_or_else(|| RpcError::invalid_params("authenticate requires a payload"))?;

        if let Some(credentials) = credentials_in(&payload) {
            conn.set_credentials(Some(credentials));
        }
        let result = conn.call(AUTHENTICATE, Some(payload)).await?;
        if let Some(credentials) = credentials_in(&result) {
            debug!(username = %credentials.username, "adopting server-issued credentials");
            conn.set_credentials(Some(credentials));
        }
        Ok(result)
    }

    fn serves_inbound(&self) -> bool {
        false
    }
}

fn credentials_in(value: &Value) -> Option<Credentials> {
    let username = value.get("username")?.as_str().filter(|s| !s.is_empty())?;
    let password = value.get("password")?.as_str().filter(|s| !s.is_empty())?;
    Some(Credentials {
        username: username.to_owned(),
        password: password.to_owned(),
    })
}
