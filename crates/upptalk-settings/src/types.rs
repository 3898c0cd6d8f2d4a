//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so partial
//! JSON files work: missing fields get their default value.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings type for the UppTalk client.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Remote endpoint.
    pub server: ServerSettings,
    /// Liveness checking.
    pub keepalive: KeepaliveSettings,
    /// HTTP side channel.
    pub http: HttpSettings,
    /// Call signaling.
    pub call: CallSettings,
}

/// Remote endpoint settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Host name.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Use `wss`/`https` instead of `ws`/`http`.
    pub secure: bool,
    /// Path of the WebSocket endpoint.
    pub path: String,
    /// Extra query parameters sent with the WebSocket handshake and HTTP requests.
    pub query: BTreeMap<String, String>,
    /// API key, folded into the query as `apikey`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apikey: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "happy.ym.ms".to_string(),
            port: 443,
            secure: true,
            path: "/".to_string(),
            query: BTreeMap::new(),
            apikey: None,
        }
    }
}

impl ServerSettings {
    /// Query parameters including the API key, if any.
    pub fn effective_query(&self) -> BTreeMap<String, String> {
        let mut query = self.query.clone();
        if let Some(key) = &self.apikey {
            let _ = query.insert("apikey".to_string(), key.clone());
        }
        query
    }
}

/// Keepalive supervisor settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeepaliveSettings {
    /// Whether liveness checks run at all.
    pub enabled: bool,
    /// Silence after which a `ping` is sent, in milliseconds.
    pub ping_interval_ms: u64,
    /// Time allowed for the `ping` response, in milliseconds.
    pub pong_timeout_ms: u64,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ping_interval_ms: 10_000,
            pong_timeout_ms: 2_500,
        }
    }
}

impl KeepaliveSettings {
    /// Ping interval as a [`Duration`].
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Pong timeout as a [`Duration`].
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }
}

/// HTTP side channel settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpSettings {
    /// Upload path for chat media.
    pub media_path: String,
    /// Upload path for profile avatars.
    pub avatar_path: String,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            media_path: "/media".to_string(),
            avatar_path: "/avatar".to_string(),
            timeout_ms: 60_000,
        }
    }
}

/// Call signaling settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallSettings {
    /// TURN/STUN relay handed to the peer connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<IceServer>,
}

/// A single ICE server entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    /// Server URL (`turn:host:port?transport=udp`).
    pub url: String,
    /// Username, for TURN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Credential, for TURN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}
