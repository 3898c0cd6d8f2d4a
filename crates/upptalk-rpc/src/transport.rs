//! Duplex text transports.
//!
//! A [`Transport`] turns a target URL into a [`TransportLink`]: an outbound
//! queue of wire text plus a stream of [`TransportEvent`]s. The connection
//! never touches sockets directly.
//!
//! - [`WsTransport`]: WebSocket over `tokio-tungstenite`
//! - [`MemoryTransport`] / [`memory_link`]: in-process channels, used to
//!   drive a connection without a network

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use upptalk_core::{Message, decode_frame, encode};

use crate::errors::ConnectionError;

/// Default capacity of link queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Something that happened on the remote side of a link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived.
    Message(String),
    /// The transport reported an error. The link may still be usable.
    Error(String),
    /// The link is gone.
    Closed,
}

/// An established link: send text out, receive events in.
#[derive(Debug)]
pub struct TransportLink {
    /// Outbound wire text. Dropping every sender closes the link.
    pub outbound: mpsc::Sender<String>,
    /// Inbound events, ending with [`TransportEvent::Closed`].
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Establishes links to a target.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `target` (a URL for network transports).
    async fn connect(&self, target: &str) -> Result<TransportLink, ConnectionError>;
}

// ── WebSocket ───────────────────────────────────────────────────────────────

/// WebSocket transport.
#[derive(Clone, Debug)]
pub struct WsTransport {
    capacity: usize,
}

impl WsTransport {
    /// Create a transport with the default queue capacity.
    pub fn new() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Create a transport with a custom queue capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, target: &str) -> Result<TransportLink, ConnectionError> {
        let (ws, _) = connect_async(target)
            .await
            .map_err(|e| ConnectionError::Transport(format!("WebSocket connect: {e}")))?;
        debug!(target, "websocket connected");

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.capacity);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(self.capacity);

        // Writer: drains the outbound queue until every sender is dropped.
        drop(tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                    warn!(error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        }));

        // Reader: forwards text frames, ends with Closed.
        drop(tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                let event = match frame {
                    Ok(WsMessage::Text(text)) => TransportEvent::Message(text.to_string()),
                    Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => TransportEvent::Message(text),
                        Err(_) => {
                            debug!("dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = in_tx.send(TransportEvent::Error(e.to_string())).await;
                        break;
                    }
                };
                if in_tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = in_tx.send(TransportEvent::Closed).await;
        }));

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// ── In-memory ───────────────────────────────────────────────────────────────

/// Remote end of an in-memory link.
#[derive(Debug)]
pub struct MemoryPeer {
    /// Target the link was opened with.
    pub target: String,
    sent: mpsc::Receiver<String>,
    events: mpsc::Sender<TransportEvent>,
}

impl MemoryPeer {
    /// Deliver a text frame to the connection.
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.events
            .send(TransportEvent::Message(text.into()))
            .await
            .is_ok()
    }

    /// Deliver an encoded message to the connection.
    pub async fn send_message(&self, message: &Message) -> bool {
        match encode(message) {
            Ok(text) => self.send_text(text).await,
            Err(_) => false,
        }
    }

    /// Report a transport error to the connection.
    pub async fn send_error(&self, error: impl Into<String>) -> bool {
        self.events
            .send(TransportEvent::Error(error.into()))
            .await
            .is_ok()
    }

    /// Report the link as closed.
    pub async fn close(&self) -> bool {
        self.events.send(TransportEvent::Closed).await.is_ok()
    }

    /// Next frame the connection wrote, or `None` once it dropped the link.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    /// Next message the connection wrote. Undecodable frames are skipped.
    pub async fn recv_message(&mut self) -> Option<Message> {
        loop {
            let text = self.sent.recv().await?;
            if let Ok(mut messages) = decode_frame(&text) {
                if !messages.is_empty() {
                    return Some(messages.remove(0));
                }
            }
        }
    }

    /// A frame already written, without waiting.
    pub fn try_recv_text(&mut self) -> Option<String> {
        self.sent.try_recv().ok()
    }
}

/// Create a connected link/peer pair.
pub fn memory_link(target: impl Into<String>, capacity: usize) -> (TransportLink, MemoryPeer) {
    let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
    let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
    let link = TransportLink {
        outbound: out_tx,
        inbound: in_rx,
    };
    let peer = MemoryPeer {
        target: target.into(),
        sent: out_rx,
        events: in_tx,
    };
    (link, peer)
}

/// Transport handing the remote end of every new link to a receiver.
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryTransport {
    /// Create a transport and the receiver its peers are delivered on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { peers: tx }, rx)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, target: &str) -> Result<TransportLink, ConnectionError> {
        let (link, peer) = memory_link(target, DEFAULT_QUEUE_CAPACITY);
        self.peers
            .send(peer)
            .map_err(|_| ConnectionError::Transport("memory peer receiver dropped".into()))?;
        Ok(link)
    }
}
