//! Actions that push a binary attachment through the HTTP side channel
//! before (or instead of) the RPC request.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;
use upptalk_core::RpcError;
use upptalk_rpc::{Action, ActionInput, Connection, HttpRequest, HttpSideChannel};

use super::{CHAT, PROFILE, payload_object};

/// POST the attachment to the media path; the parsed body is the result.
pub(crate) struct Upload {
    http: HttpSideChannel,
}

impl Upload {
    pub(crate) fn new(http: HttpSideChannel) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Action for Upload {
    async fn run(&self, conn: &Connection, input: ActionInput) -> Result<Value, RpcError> {
        let body = input
            .attachment
            .ok_or_else(|| RpcError::invalid_params("upload requires an attachment"))?;
        let request =
            HttpRequest::post(self.http.settings().media_path.clone(), body).progress(input.progress);
        Ok(self.http.send(conn, request).await?)
    }

    fn serves_inbound(&self) -> bool {
        false
    }
}

/// `chat`, uploading the attachment first and sending the stored file's
/// descriptor in its place. The result is the upload response.
pub(crate) struct Chat {
    http: HttpSideChannel,
}

impl Chat {
    pub(crate) fn new(http: HttpSideChannel) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Action for Chat {
    async fn run(&self, conn: &Connection, input: ActionInput) -> Result<Value, RpcError> {
        let Some(body) = input.attachment else {
            return conn.call(CHAT, input.payload).await;
        };
        let mut payload = payload_object(input.payload, CHAT)?;

        let request =
            HttpRequest::post(self.http.settings().media_path.clone(), body).progress(input.progress);
        let uploaded = self.http.send(conn, request).await?;
        debug!(?uploaded, "chat attachment stored");

        let _ = payload.insert("file".into(), file_descriptor(&uploaded));
        let _ = conn.call(CHAT, Some(Value::Object(payload))).await?;
        Ok(uploaded)
    }

    fn serves_inbound(&self) -> bool {
        false
    }
}

/// The stored file, with the thumbnail folded in when one was generated.
fn file_descriptor(uploaded: &Value) -> Value {
    let mut file = uploaded.get("file").cloned().unwrap_or(Value::Null);
    if let (Some(thumbnail), Value::Object(map)) = (
        uploaded.get("thumbnail").filter(|t| !t.is_null()),
        &mut file,
    ) {
        let _ = map.insert("thumbnail".into(), thumbnail.clone());
    }
    file
}

/// `profile`, uploading the avatar first and sending its public URL. The
/// result is the payload that was sent.
pub(crate) struct Profile {
    http: HttpSideChannel,
}

impl Profile {
    pub(crate) fn new(http: HttpSideChannel) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Action for Profile {
    async fn run(&self, conn: &Connection, input: ActionInput) -> Result<Value, RpcError> {
        let Some(body) = input.attachment else {
            return conn.call(PROFILE, input.payload).await;
        };
        let mut payload: Map<String, Value> = payload_object(input.payload, PROFILE)?;

        let avatar_path = self.http.settings().avatar_path.clone();
        let request = HttpRequest::post(avatar_path.clone(), body).progress(input.progress);
        let name = self.http.send_text(conn, request).await?;
        let url = self.http.resource_url(&format!(
            "{}/{}",
            avatar_path.trim_end_matches('/'),
            name.trim()
        ))?;
        debug!(%url, "avatar stored");

        let _ = payload.insert("avatar".into(), Value::String(url));
        let payload = Value::Object(payload);
        let _ = conn.call(PROFILE, Some(payload.clone())).await?;
        Ok(payload)
    }

    fn serves_inbound(&self) -> bool {
        false
    }
}
