//! RPC connection: request correlation and inbound dispatch.
//!
//! A [`Connection`] is a cheap, cloneable handle. Once a transport link is
//! attached, two tasks run per link:
//!
//! - **reader**: decodes frames, completes pending requests inline, and
//!   queues requests/notifications
//! - **dispatcher**: runs queued messages through the handler chain one at a
//!   time, in arrival order
//!
//! Responses never wait behind a handler, so a handler may itself await a
//! request on the same connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use upptalk_core::message::is_reserved;
use upptalk_core::{Message, Notification, Request, Response, RpcError, decode_frame, encode};
use upptalk_settings::KeepaliveSettings;

use crate::actions::{ActionHandler, ActionInput, ActionRegistry};
use crate::errors::ConnectionError;
use crate::handler::{Handled, Handler, HandlerChain, Inbound, MethodMatcher, Responder, Route};
use crate::keepalive::{KeepaliveOutcome, run_keepalive};
use crate::pending::{PendingRequests, ResponseCallback};
use crate::transport::{Transport, TransportEvent, TransportLink};

/// Capacity of the local event channel.
const EVENT_CAPACITY: usize = 256;

/// Why a connection closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// [`Connection::close`] was called.
    Requested,
    /// The transport reported the link gone.
    TransportClosed,
    /// A liveness check went unanswered.
    KeepaliveTimeout,
}

/// Local lifecycle events. These never travel the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    /// A link was attached.
    Open,
    /// The link was torn down.
    Close(CloseReason),
    /// The transport reported an error.
    Error(String),
    /// A message was decoded from an inbound frame.
    Message(Message),
    /// A message was written to the link.
    Send(Message),
}

/// Credentials reused by the HTTP side channel.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Account name.
    pub username: String,
    /// Secret.
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

struct Link {
    generation: u64,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

struct Inner {
    keepalive: KeepaliveSettings,
    actions: ActionRegistry,
    chain: HandlerChain,
    pending: PendingRequests,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
    next_id: AtomicU64,
    credentials: Mutex<Option<Credentials>>,
    activity: Notify,
    dropped_messages: AtomicU64,
}

/// Client side of an RPC session over a single transport link.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a connection. Every action in `actions` that serves inbound
    /// traffic is installed at the head of the handler chain, before any
    /// runtime registration.
    pub fn new(actions: ActionRegistry, keepalive: KeepaliveSettings) -> Self {
        let chain = HandlerChain::new();
        for name in actions.names() {
            if let Some(action) = actions.get(&name).filter(|a| a.serves_inbound()) {
                let handler = ActionHandler {
                    name: name.clone(),
                    action,
                };
                chain.push(Route::Method(name), Arc::new(handler));
            }
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                keepalive,
                actions,
                chain,
                pending: PendingRequests::new(),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                events,
                next_id: AtomicU64::new(0),
                credentials: Mutex::new(None),
                activity: Notify::new(),
                dropped_messages: AtomicU64::new(0),
            }),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Connect through `transport` and attach the resulting link.
    ///
    /// A connect failure is also reported as a local `Error` event.
    pub async fn open<T: Transport + ?Sized>(
        &self,
        transport: &T,
        target: &str,
    ) -> Result<(), ConnectionError> {
        if self.is_open() {
            return Err(ConnectionError::AlreadyOpen);
        }
        match transport.connect(target).await {
            Ok(link) => self.attach(link),
            Err(e) => {
                warn!(target, error = %e, "connect failed");
                self.emit(ConnectionEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Attach an established link and start its reader, dispatcher, and
    /// keepalive tasks. Emits `Open`.
    pub fn attach(&self, link: TransportLink) -> Result<(), ConnectionError> {
        let TransportLink {
            outbound,
            mut inbound,
        } = link;
        let cancel = CancellationToken::new();
        let generation = {
            let mut slot = self.inner.link.lock();
            if slot.is_some() {
                return Err(ConnectionError::AlreadyOpen);
            }
            let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
            *slot = Some(Link {
                generation,
                outbound,
                cancel: cancel.clone(),
            });
            generation
        };
        info!(generation, "connection open");
        self.emit(ConnectionEvent::Open);
        self.mark_activity();

        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel::<Message>();

        let conn = self.clone();
        let token = cancel.clone();
        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    event = inbound.recv() => match event {
                        Some(TransportEvent::Message(text)) => {
                            for message in conn.handle_frame(&text) {
                                let _ = dispatch_tx.send(message);
                            }
                        }
                        Some(TransportEvent::Error(error)) => {
                            warn!(%error, "transport error");
                            conn.emit(ConnectionEvent::Error(error));
                        }
                        Some(TransportEvent::Closed) | None => {
                            conn.shutdown(Some(generation), CloseReason::TransportClosed);
                            break;
                        }
                    },
                }
            }
        }));

        let conn = self.clone();
        let token = cancel.clone();
        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    message = dispatch_rx.recv() => match message {
                        Some(message) => conn.dispatch(message).await,
                        None => break,
                    },
                }
            }
        }));

        if self.inner.keepalive.enabled {
            let conn = self.clone();
            let ping_interval = self.inner.keepalive.ping_interval();
            let pong_timeout = self.inner.keepalive.pong_timeout();
            drop(tokio::spawn(async move {
                let outcome = run_keepalive(&conn, ping_interval, pong_timeout, cancel).await;
                if outcome == KeepaliveOutcome::TimedOut {
                    warn!(?pong_timeout, "keepalive timed out, closing connection");
                    conn.shutdown(Some(generation), CloseReason::KeepaliveTimeout);
                }
            }));
        }
        Ok(())
    }

    /// Close the link: pending requests fail with `ConnectionClosed`,
    /// keepalive stops, and one `Close` event is emitted. No-op when closed.
    pub fn close(&self) {
        self.shutdown(None, CloseReason::Requested);
    }

    /// Tear down the current link, if it is still the one `generation`
    /// names (`None` matches any).
    fn shutdown(&self, generation: Option<u64>, reason: CloseReason) {
        let link = {
            let mut slot = self.inner.link.lock();
            match slot.as_ref() {
                Some(link) if generation.is_none_or(|g| g == link.generation) => slot.take(),
                _ => None,
            }
        };
        let Some(link) = link else {
            return;
        };
        link.cancel.cancel();
        drop(link.outbound);

        let failed = self.inner.pending.fail_all(&RpcError::ConnectionClosed);
        info!(?reason, failed_requests = failed, "connection closed");
        self.emit(ConnectionEvent::Close(reason));
    }

    /// Whether a link is attached.
    pub fn is_open(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    /// Subscribe to local lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.inner.events.send(event);
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Encode and write a message. Emits `Send` on success.
    pub fn send(&self, message: Message) -> Result<(), ConnectionError> {
        self.write(message, None)
    }

    /// Write under the link lock. A `pending` entry is registered only while
    /// the link is held, and removed again if the write fails, so a close
    /// never sees a request whose write failed.
    fn write(
        &self,
        message: Message,
        pending: Option<(&str, ResponseCallback)>,
    ) -> Result<(), ConnectionError> {
        let text = encode(&message)?;
        {
            let slot = self.inner.link.lock();
            let link = slot.as_ref().ok_or(ConnectionError::NotConnected)?;
            let id = pending.map(|(id, callback)| {
                let _ = self.inner.pending.insert(id.to_owned(), callback);
                id
            });
            let written = match link.outbound.try_send(text) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    let _ = self.inner.dropped_messages.fetch_add(1, Ordering::Relaxed);
                    Err(ConnectionError::SendFailed)
                }
                Err(TrySendError::Closed(_)) => Err(ConnectionError::NotConnected),
            };
            if let Err(e) = written {
                if let Some(id) = id {
                    let _ = self.inner.pending.take(id);
                }
                return Err(e);
            }
        }
        self.emit(ConnectionEvent::Send(message));
        Ok(())
    }

    /// Send a notification. Delivery is not acknowledged.
    pub fn notify(&self, method: &str, payload: Option<Value>) -> Result<(), ConnectionError> {
        check_method(method)?;
        self.send(Message::notification(method, payload))
    }

    /// Send a request and return its id immediately.
    ///
    /// `callback` runs at most once: with the outcome when the matching
    /// response arrives, or with `ConnectionClosed` if the connection closes
    /// first. When this returns an error it is never called.
    pub fn request(
        &self,
        method: &str,
        payload: Option<Value>,
        callback: impl FnOnce(Result<Value, RpcError>) + Send + 'static,
    ) -> Result<String, ConnectionError> {
        check_method(method)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let message = Message::request(id.clone(), method, payload);
        let callback: ResponseCallback = Box::new(callback);
        self.write(message, Some((id.as_str(), callback)))?;
        Ok(id)
    }

    /// Send a request and wait for its outcome.
    pub async fn call(&self, method: &str, payload: Option<Value>) -> Result<Value, RpcError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.request(method, payload, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        rx.await.unwrap_or(Err(RpcError::ConnectionClosed))
    }

    /// Answer `request`; `error` takes precedence over `result`.
    pub fn respond(
        &self,
        request: &Request,
        error: Option<Value>,
        result: Option<Value>,
    ) -> Result<(), ConnectionError> {
        self.send_response(Response::new(request.id.clone(), error, result))
    }

    pub(crate) fn send_response(&self, response: Response) -> Result<(), ConnectionError> {
        self.send(Message::Response(response))
    }

    /// Run the registered action `name`, or send a plain request when there
    /// is none.
    pub async fn perform(&self, name: &str, input: ActionInput) -> Result<Value, RpcError> {
        match self.inner.actions.get(name) {
            Some(action) => action.run(self, input).await,
            None => self.call(name, input.payload).await,
        }
    }

    // ── Handler registration ────────────────────────────────────────

    /// Append a handler for `method`.
    pub fn on(&self, method: &str, handler: impl Handler + 'static) -> Result<(), ConnectionError> {
        check_method(method)?;
        self.inner
            .chain
            .push(Route::Method(method.to_owned()), Arc::new(handler));
        Ok(())
    }

    /// Append a handler for every method `predicate` accepts.
    pub fn on_match(
        &self,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
        handler: impl Handler + 'static,
    ) {
        let matcher: MethodMatcher = Arc::new(predicate);
        self.inner
            .chain
            .push(Route::Matcher(matcher), Arc::new(handler));
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Decode a frame, complete any responses it carries, and return the
    /// requests and notifications still to dispatch.
    ///
    /// A malformed frame is dropped.
    pub fn handle_frame(&self, text: &str) -> Vec<Message> {
        self.mark_activity();
        let messages = match decode_frame(text) {
            Ok(messages) => messages,
            Err(e) => {
                debug!(error = %e, "dropping malformed frame");
                return Vec::new();
            }
        };

        let mut inbound = Vec::with_capacity(messages.len());
        for message in messages {
            self.emit(ConnectionEvent::Message(message.clone()));
            match message {
                Message::Response(response) => self.correlate(response),
                other => inbound.push(other),
            }
        }
        inbound
    }

    /// Process a frame end to end, dispatching inline.
    pub async fn receive(&self, text: &str) {
        for message in self.handle_frame(text) {
            self.dispatch(message).await;
        }
    }

    fn correlate(&self, response: Response) {
        let id = response.id.clone();
        let outcome = response.into_outcome().map_err(RpcError::from_wire);
        if !self.inner.pending.complete(&id, outcome) {
            debug!(%id, "dropping response with no pending request");
        }
    }

    /// Route one message through the handler chain.
    pub async fn dispatch(&self, message: Message) {
        match message {
            Message::Request(request) => self.dispatch_request(request).await,
            Message::Notification(notification) => {
                self.dispatch_notification(notification).await;
            }
            Message::Response(response) => self.correlate(response),
        }
    }

    #[instrument(skip_all, fields(method = %request.method, id = %request.id))]
    async fn dispatch_request(&self, request: Request) {
        let handlers = self.inner.chain.matching(&request.method);
        let responder = Responder::new(self.clone(), request.id.clone());
        let mut inbound = Inbound::Request(request, responder);
        for handler in handlers {
            match handler.handle(inbound, self).await {
                Handled::Yes => return,
                Handled::No(returned) => inbound = returned,
            }
        }
        if let Inbound::Request(_, responder) = inbound {
            debug!("no handler claimed request");
            let _ = responder.err(RpcError::MethodNotFound);
        }
    }

    #[instrument(skip_all, fields(method = %notification.method))]
    async fn dispatch_notification(&self, notification: Notification) {
        let handlers = self.inner.chain.matching(&notification.method);
        if handlers.is_empty() {
            debug!("no handler for notification");
            return;
        }
        for handler in handlers {
            let _ = handler
                .handle(Inbound::Notification(notification.clone()), self)
                .await;
        }
    }

    // ── State ───────────────────────────────────────────────────────

    /// Record inbound traffic for the keepalive supervisor.
    pub fn mark_activity(&self) {
        self.inner.activity.notify_one();
    }

    pub(crate) async fn activity(&self) {
        self.inner.activity.notified().await;
    }

    /// Requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Outbound messages dropped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.inner.dropped_messages.load(Ordering::Relaxed)
    }

    /// Actions this connection was built with.
    pub fn actions(&self) -> &ActionRegistry {
        &self.inner.actions
    }

    /// Store credentials for the HTTP side channel.
    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        *self.inner.credentials.lock() = credentials;
    }

    /// Current credentials.
    pub fn credentials(&self) -> Option<Credentials> {
        self.inner.credentials.lock().clone()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("open", &self.is_open())
            .field("pending", &self.pending_count())
            .field("chain", &self.inner.chain)
            .finish_non_exhaustive()
    }
}

fn check_method(method: &str) -> Result<(), ConnectionError> {
    if is_reserved(method) {
        return Err(ConnectionError::ReservedName(method.to_owned()));
    }
    Ok(())
}
