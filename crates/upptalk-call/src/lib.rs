//! # upptalk-call
//!
//! WebRTC call signaling carried as `webrtc` packets over an UppTalk
//! [`Connection`](upptalk_rpc::Connection).
//!
//! - [`CallManager`] owns the call table and runs the state machine
//! - [`Call`] is the per-call handle (`accept`, `reject`, `hangup`)
//! - [`MediaEngine`] / [`PeerConnection`] abstract device capture and the
//!   peer connection; without an engine, calls are refused with
//!   `FEATURE_NOT_AVAILABLE`

#![deny(unsafe_code)]

pub mod call;
pub mod errors;
pub mod manager;
pub mod media;
pub mod signal;

pub use call::{Call, CallState, MediaInfo, Role};
pub use errors::CallError;
pub use manager::{CallEvent, CallManager, WeakCallManager};
pub use media::{
    IceConnectionState, MediaEngine, MediaError, MediaOptions, MediaStream, PeerConfig,
    PeerConnection, PeerEvent,
};
pub use signal::{Packet, SIGNAL_METHOD, Signal};
