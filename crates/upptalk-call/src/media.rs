//! Peer media seams.
//!
//! Capturing devices and running ICE/DTLS are platform concerns. The call
//! state machine drives them through [`MediaEngine`] and [`PeerConnection`];
//! session descriptions and candidates stay opaque JSON values.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use upptalk_settings::{CallSettings, IceServer};

/// Which local tracks to capture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaOptions {
    /// Capture audio.
    #[serde(default)]
    pub audio: bool,
    /// Capture video.
    #[serde(default)]
    pub video: bool,
}

impl MediaOptions {
    /// Audio only.
    pub fn audio() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Audio and video.
    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// A captured or received media stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaStream {
    /// Engine-assigned stream id.
    pub id: String,
    /// Number of audio tracks.
    pub audio_tracks: usize,
    /// Number of video tracks.
    pub video_tracks: usize,
}

impl MediaStream {
    /// Whether the stream carries audio.
    pub fn has_audio(&self) -> bool {
        self.audio_tracks > 0
    }

    /// Whether the stream carries video.
    pub fn has_video(&self) -> bool {
        self.video_tracks > 0
    }
}

/// ICE connectivity state reported by a peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceConnectionState {
    /// Whether the peer link is gone for good.
    pub fn is_gone(self) -> bool {
        matches!(self, Self::Disconnected | Self::Closed)
    }
}

/// Event raised by a peer connection.
#[derive(Clone, Debug, PartialEq)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered; `None` marks the end of gathering.
    IceCandidate(Option<Value>),
    /// ICE connectivity changed.
    IceConnectionState(IceConnectionState),
    /// The remote side's media arrived.
    RemoteStream(MediaStream),
}

/// Peer connection configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerConfig {
    /// STUN/TURN servers.
    pub ice_servers: Vec<IceServer>,
}

impl PeerConfig {
    /// Build from call settings; the TURN server, when set, is the only
    /// ICE server.
    pub fn from_settings(settings: &CallSettings) -> Self {
        Self {
            ice_servers: settings.turn.iter().cloned().collect(),
        }
    }
}

/// Media failure.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MediaError {
    /// The platform has no peer media.
    #[error("peer media not supported")]
    NotSupported,
    /// The engine reported a failure.
    #[error("media failure: {0}")]
    Failed(String),
}

/// Platform media: device capture and peer connection factory.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Whether calls can be placed at all.
    fn is_supported(&self) -> bool {
        true
    }

    /// Capture local media.
    async fn acquire_local_media(&self, options: MediaOptions) -> Result<MediaStream, MediaError>;

    /// Create a peer connection that sends `local` and reports on `events`.
    async fn create_peer(
        &self,
        config: PeerConfig,
        local: &MediaStream,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError>;
}

/// One negotiated peer-to-peer media session.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Generate the caller's session description.
    async fn create_offer(&self) -> Result<Value, MediaError>;

    /// Generate the callee's session description.
    async fn create_answer(&self) -> Result<Value, MediaError>;

    /// Apply our own description.
    async fn set_local_description(&self, description: Value) -> Result<(), MediaError>;

    /// Apply the remote side's description.
    async fn set_remote_description(&self, description: Value) -> Result<(), MediaError>;

    /// Apply a remote ICE candidate.
    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), MediaError>;

    /// Tear down. Must be idempotent.
    fn close(&self);
}
