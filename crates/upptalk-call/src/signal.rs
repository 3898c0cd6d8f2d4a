//! `webrtc` signaling packets.
//!
//! Every packet names the call (`id`) and the remote party (`user`). What it
//! carries is decided in order: a known `type`, else a non-null `sdp`, else a
//! non-null `candidate`.

use serde::Deserialize;
use serde_json::{Map, Value, json};

/// RPC method carrying every signaling packet.
pub const SIGNAL_METHOD: &str = "webrtc";

/// What a signaling packet asks for.
#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    /// Start a call with the caller's media flags.
    Offer {
        /// Caller sends audio.
        audio: bool,
        /// Caller sends video.
        video: bool,
    },
    /// The callee picked up. Flags are absent when left to the caller's.
    Accept {
        /// Callee sends audio.
        audio: Option<bool>,
        /// Callee sends video.
        video: Option<bool>,
    },
    /// The callee declined.
    Reject,
    /// Either side ended the call.
    Hangup,
    /// The remote side cannot take calls.
    Error,
    /// An opaque session description.
    Description(Value),
    /// An opaque ICE candidate.
    Candidate(Value),
}

/// One decoded `webrtc` payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    /// Call id.
    pub id: String,
    /// Remote party.
    pub user: String,
    /// Content.
    pub signal: Signal,
}

#[derive(Deserialize)]
struct WirePacket {
    id: Option<Value>,
    user: Option<Value>,
    #[serde(rename = "type")]
    kind: Option<Value>,
    audio: Option<Value>,
    video: Option<Value>,
    sdp: Option<Value>,
    candidate: Option<Value>,
}

impl Packet {
    /// Build a packet.
    pub fn new(id: impl Into<String>, user: impl Into<String>, signal: Signal) -> Self {
        Self {
            id: id.into(),
            user: user.into(),
            signal,
        }
    }

    /// Decode a payload. `None` when `id` or `user` is not a string, or
    /// nothing actionable is present.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let wire = WirePacket::deserialize(payload).ok()?;
        let id = wire.id?.as_str()?.to_owned();
        let user = wire.user?.as_str()?.to_owned();

        let kind = wire.kind.as_ref().and_then(Value::as_str);
        let signal = match kind {
            Some("offer") => Signal::Offer {
                audio: is_true(wire.audio.as_ref()),
                video: is_true(wire.video.as_ref()),
            },
            Some("accept") => Signal::Accept {
                audio: wire.audio.as_ref().and_then(Value::as_bool),
                video: wire.video.as_ref().and_then(Value::as_bool),
            },
            Some("reject") => Signal::Reject,
            Some("hangup") => Signal::Hangup,
            Some("error") => Signal::Error,
            _ => match (wire.sdp, wire.candidate) {
                (Some(sdp), _) => Signal::Description(sdp),
                (None, Some(candidate)) => Signal::Candidate(candidate),
                (None, None) => return None,
            },
        };
        Some(Self { id, user, signal })
    }

    /// Encode as a `webrtc` payload.
    pub fn to_payload(&self) -> Value {
        let mut map = Map::new();
        let _ = map.insert("id".into(), json!(self.id));
        let _ = map.insert("user".into(), json!(self.user));
        match &self.signal {
            Signal::Offer { audio, video } => {
                let _ = map.insert("type".into(), json!("offer"));
                let _ = map.insert("audio".into(), json!(audio));
                let _ = map.insert("video".into(), json!(video));
            }
            Signal::Accept { audio, video } => {
                let _ = map.insert("type".into(), json!("accept"));
                if let Some(audio) = audio {
                    let _ = map.insert("audio".into(), json!(audio));
                }
                if let Some(video) = video {
                    let _ = map.insert("video".into(), json!(video));
                }
            }
            Signal::Reject => {
                let _ = map.insert("type".into(), json!("reject"));
            }
            Signal::Hangup => {
                let _ = map.insert("type".into(), json!("hangup"));
            }
            Signal::Error => {
                let _ = map.insert("type".into(), json!("error"));
            }
            Signal::Description(sdp) => {
                let _ = map.insert("sdp".into(), sdp.clone());
            }
            Signal::Candidate(candidate) => {
                let _ = map.insert("candidate".into(), candidate.clone());
            }
        }
        Value::Object(map)
    }
}

fn is_true(value: Option<&Value>) -> bool {
    value.and_then(Value::as_bool).unwrap_or(false)
}
