//! # upptalk-core
//!
//! Shared vocabulary for the UppTalk client crates:
//!
//! - **Messages**: [`Message`] tagged enum (`Notification`, `Request`, `Response`)
//!   and the JSON codec that validates frames at decode time
//! - **Errors**: [`RpcError`] with machine-readable codes, [`CodecError`]
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod errors;
pub mod logging;
pub mod message;

pub use errors::{CodecError, RpcError};
pub use message::{Message, Notification, Request, Response, decode_frame, encode};
