//! # upptalk
//!
//! UppTalk client. [`Client`] ties together:
//!
//! - the RPC [`Connection`](upptalk_rpc::Connection) with keepalive
//! - the built-in [`actions`] (`authenticate`, `upload`, `chat`, `profile`,
//!   `call`)
//! - the [`CallManager`](upptalk_call::CallManager) for WebRTC signaling
//! - the HTTP side channel for uploads

#![deny(unsafe_code)]

pub mod actions;
pub mod client;
pub mod errors;

pub use client::Client;
pub use errors::ClientError;

pub use upptalk_call as call;
pub use upptalk_core as core;
pub use upptalk_rpc as rpc;
pub use upptalk_settings as settings;
