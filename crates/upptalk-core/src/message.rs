//! Wire message model and JSON codec.
//!
//! Every frame is one of three shapes:
//!
//! - **Notification**: `{method, payload?}`
//! - **Request**: `{id, method, payload?}`
//! - **Response**: `{id, result?}` or `{id, error}`
//!
//! Frames are classified once, at decode time. A frame that mixes request and
//! response fields is rejected rather than guessed at. A JSON array is a
//! batch: each element is decoded on its own and bad elements are skipped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::CodecError;

/// Local event names that never travel the wire as RPC methods.
pub const RESERVED_EVENT_NAMES: [&str; 5] = ["open", "close", "error", "message", "send"];

/// Whether `method` collides with a local lifecycle event name.
pub fn is_reserved(method: &str) -> bool {
    RESERVED_EVENT_NAMES.contains(&method)
}

/// One-way message, no response expected.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    /// Method name.
    pub method: String,
    /// Optional payload.
    pub payload: Option<Value>,
}

/// Message expecting exactly one response carrying the same `id`.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    /// Correlation identifier.
    pub id: String,
    /// Method name.
    pub method: String,
    /// Optional payload.
    pub payload: Option<Value>,
}

/// Reply to a [`Request`]. At most one of `result`/`error` is set.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    /// Echoed request identifier.
    pub id: String,
    /// Success value.
    pub result: Option<Value>,
    /// Failure value.
    pub error: Option<Value>,
}

impl Response {
    /// Build a response; `error` takes precedence over `result`.
    pub fn new(id: impl Into<String>, error: Option<Value>, result: Option<Value>) -> Self {
        let id = id.into();
        match error {
            Some(error) => Self {
                id,
                result: None,
                error: Some(error),
            },
            None => Self {
                id,
                result,
                error: None,
            },
        }
    }

    /// Build a success response.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self::new(id, None, Some(result))
    }

    /// Build a failure response.
    pub fn failure(id: impl Into<String>, error: Value) -> Self {
        Self::new(id, Some(error), None)
    }

    /// Outcome as a `Result`; a response without either field resolves to `null`.
    pub fn into_outcome(self) -> Result<Value, Value> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A validated wire message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// One-way message.
    Notification(Notification),
    /// Message awaiting a response.
    Request(Request),
    /// Reply to an earlier request.
    Response(Response),
}

impl Message {
    /// Build a notification.
    pub fn notification(method: impl Into<String>, payload: Option<Value>) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            payload,
        })
    }

    /// Build a request.
    pub fn request(id: impl Into<String>, method: impl Into<String>, payload: Option<Value>) -> Self {
        Self::Request(Request {
            id: id.into(),
            method: method.into(),
            payload,
        })
    }

    /// Method name, if this is a request or notification.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Notification(n) => Some(&n.method),
            Self::Request(r) => Some(&r.method),
            Self::Response(_) => None,
        }
    }

    /// Correlation id, if this is a request or response.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Notification(_) => None,
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => Some(&r.id),
        }
    }
}

/// Flat on-the-wire representation shared by all three shapes.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RawMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

impl From<&Message> for RawMessage {
    fn from(message: &Message) -> Self {
        match message {
            Message::Notification(n) => Self {
                method: Some(n.method.clone()),
                payload: n.payload.clone(),
                ..Self::default()
            },
            Message::Request(r) => Self {
                method: Some(r.method.clone()),
                payload: r.payload.clone(),
                id: Some(Value::String(r.id.clone())),
                ..Self::default()
            },
            Message::Response(r) => Self {
                id: Some(Value::String(r.id.clone())),
                result: r.result.clone(),
                error: r.error.clone(),
                ..Self::default()
            },
        }
    }
}

impl TryFrom<RawMessage> for Message {
    type Error = CodecError;

    fn try_from(raw: RawMessage) -> Result<Self, CodecError> {
        let id = raw.id.map(normalize_id).transpose()?;

        match (raw.method, id) {
            (Some(_), _) if raw.result.is_some() || raw.error.is_some() => Err(
                CodecError::Ambiguous("method together with result/error"),
            ),
            (Some(method), Some(id)) => Ok(Self::Request(Request {
                id,
                method,
                payload: raw.payload,
            })),
            (Some(method), None) => Ok(Self::Notification(Notification {
                method,
                payload: raw.payload,
            })),
            (None, Some(_)) if raw.result.is_some() && raw.error.is_some() => {
                Err(CodecError::Ambiguous("both result and error"))
            }
            (None, Some(id)) => Ok(Self::Response(Response {
                id,
                result: raw.result,
                error: raw.error,
            })),
            (None, None) => Err(CodecError::Ambiguous("neither method nor id")),
        }
    }
}

impl Serialize for Message {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawMessage::from(self).serialize(serializer)
    }
}

fn normalize_id(id: Value) -> Result<String, CodecError> {
    match id {
        Value::String(s) => Ok(s),
        Value::Number(n) if n.is_u64() || n.is_i64() => Ok(n.to_string()),
        other => Err(CodecError::InvalidId(other)),
    }
}

/// Decode a single JSON value into a message.
pub fn decode_value(value: Value) -> Result<Message, CodecError> {
    if !value.is_object() {
        return Err(CodecError::NotAnObject);
    }
    let raw: RawMessage = serde_json::from_value(value)?;
    Message::try_from(raw)
}

/// Decode a wire frame into one message, or several for a batch.
///
/// Invalid elements of a batch are dropped individually.
pub fn decode_frame(text: &str) -> Result<Vec<Message>, CodecError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match decode_value(item) {
                Ok(message) => Some(message),
                Err(e) => {
                    debug!(error = %e, "dropping invalid batch element");
                    None
                }
            })
            .collect()),
        value => decode_value(value).map(|m| vec![m]),
    }
}

/// Encode a message as wire text.
pub fn encode(message: &Message) -> Result<String, CodecError> {
    Ok(serde_json::to_string(message)?)
}
