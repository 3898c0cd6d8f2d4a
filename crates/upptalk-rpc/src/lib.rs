//! # upptalk-rpc
//!
//! Client side of the UppTalk RPC protocol over one persistent transport.
//!
//! - **Connection**: [`Connection`] assigns request ids, correlates
//!   responses, and routes inbound requests/notifications through an ordered
//!   handler chain
//! - **Keepalive**: ping/pong liveness checks that close a silent link
//! - **Actions**: [`ActionRegistry`] of named operations merged into a
//!   connection at construction
//! - **Transports**: [`WsTransport`] (WebSocket) and an in-memory transport
//! - **HTTP side channel**: [`HttpSideChannel`] for uploads

#![deny(unsafe_code)]

pub mod actions;
pub mod connection;
pub mod endpoint;
pub mod errors;
pub mod handler;
pub mod http;
pub mod keepalive;
pub mod pending;
pub mod transport;

pub use actions::{Action, ActionInput, ActionRegistry, ProgressFn};
pub use connection::{CloseReason, Connection, ConnectionEvent, Credentials};
pub use endpoint::Endpoint;
pub use errors::{ConnectionError, HttpError};
pub use handler::{Handled, Handler, Inbound, Responder};
pub use http::{HttpRequest, HttpSideChannel};
pub use transport::{
    MemoryPeer, MemoryTransport, Transport, TransportEvent, TransportLink, WsTransport, memory_link,
};
