//! The client handle.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::info;
use upptalk_call::{Call, CallError, CallManager, MediaEngine, MediaOptions};
use upptalk_core::RpcError;
use upptalk_rpc::{
    ActionInput, Connection, ConnectionEvent, Endpoint, HttpSideChannel, Transport, WsTransport,
};
use upptalk_settings::ClientSettings;

use crate::actions::{self, AUTHENTICATE, CHAT, CallSlot, PROFILE, UPLOAD};
use crate::errors::ClientError;

/// One UppTalk session: the RPC connection, its call manager, and the HTTP
/// side channel, built from [`ClientSettings`].
#[derive(Clone, Debug)]
pub struct Client {
    conn: Connection,
    calls: CallManager,
    http: HttpSideChannel,
    endpoint: Endpoint,
}

impl Client {
    /// Build a client. Pass `None` for `media` where peer media is
    /// unavailable; calls are then refused with `FEATURE_NOT_AVAILABLE`.
    pub fn new(
        settings: &ClientSettings,
        media: Option<Arc<dyn MediaEngine>>,
    ) -> Result<Self, ClientError> {
        let endpoint = Endpoint::from_settings(&settings.server);
        let http = HttpSideChannel::new(endpoint.clone(), settings.http.clone())?;
        Self::with_http(settings, media, http)
    }

    /// Build a client around an existing side channel.
    pub fn with_http(
        settings: &ClientSettings,
        media: Option<Arc<dyn MediaEngine>>,
        http: HttpSideChannel,
    ) -> Result<Self, ClientError> {
        let slot = CallSlot::default();
        let registry = actions::default_actions(&http, &slot);
        let conn = Connection::new(registry, settings.keepalive.clone());
        let calls = CallManager::new(conn.clone(), media, &settings.call)?;
        let _ = slot.set(calls.downgrade());
        Ok(Self {
            conn,
            calls,
            http,
            endpoint: Endpoint::from_settings(&settings.server),
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Open the WebSocket to the configured server.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let url = self.endpoint.websocket_url()?;
        self.connect_with(&WsTransport::new(), url.as_str()).await
    }

    /// Open a link through `transport`.
    pub async fn connect_with<T: Transport + ?Sized>(
        &self,
        transport: &T,
        target: &str,
    ) -> Result<(), ClientError> {
        self.conn.open(transport, target).await?;
        info!(target, "client connected");
        Ok(())
    }

    /// Close the link. Outstanding requests fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.conn.close();
    }

    /// Whether a link is attached.
    pub fn is_connected(&self) -> bool {
        self.conn.is_open()
    }

    /// Local connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.conn.subscribe()
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// The RPC connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The call manager.
    pub fn calls(&self) -> &CallManager {
        &self.calls
    }

    /// The HTTP side channel.
    pub fn http(&self) -> &HttpSideChannel {
        &self.http
    }

    /// The server endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Send a request and wait for its result.
    pub async fn request(&self, method: &str, payload: Option<Value>) -> Result<Value, RpcError> {
        self.conn.call(method, payload).await
    }

    /// Run an action by name; a plain request when none is registered.
    pub async fn perform(&self, name: &str, input: ActionInput) -> Result<Value, RpcError> {
        self.conn.perform(name, input).await
    }

    /// Log in with a username and password.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Value, RpcError> {
        let payload = json!({"username": username, "password": password});
        self.perform(AUTHENTICATE, ActionInput::payload(payload)).await
    }

    /// Upload a file to the media store.
    pub async fn upload(&self, body: impl Into<Bytes>) -> Result<Value, RpcError> {
        self.perform(UPLOAD, ActionInput::default().with_attachment(body))
            .await
    }

    /// Send a chat message, with an optional file.
    pub async fn chat(&self, payload: Value, file: Option<Bytes>) -> Result<Value, RpcError> {
        let mut input = ActionInput::payload(payload);
        input.attachment = file;
        self.perform(CHAT, input).await
    }

    /// Update the profile, with an optional avatar image.
    pub async fn profile(&self, payload: Value, avatar: Option<Bytes>) -> Result<Value, RpcError> {
        let mut input = ActionInput::payload(payload);
        input.attachment = avatar;
        self.perform(PROFILE, input).await
    }

    /// Place a call to `user`.
    pub async fn call(&self, user: &str, options: MediaOptions) -> Result<Call, CallError> {
        self.calls.call(user, options).await
    }
}
