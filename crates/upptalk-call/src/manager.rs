//! Call table and signaling state machine.
//!
//! One `webrtc` handler on the connection feeds every inbound packet to the
//! [`CallManager`]. Packets are processed in arrival order by the
//! connection's dispatcher, so SDP and ICE for a call apply in order.
//!
//! Identity rule: a packet for a known call is dropped unless its `user`
//! matches the call's remote party.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use upptalk_core::RpcError;
use upptalk_rpc::{Connection, ConnectionEvent, Handled, Handler, Inbound};
use upptalk_settings::CallSettings;
use uuid::Uuid;

use crate::call::{Call, CallState, MediaInfo, Role};
use crate::errors::CallError;
use crate::media::{
    MediaEngine, MediaError, MediaOptions, MediaStream, PeerConfig, PeerConnection, PeerEvent,
};
use crate::signal::{Packet, SIGNAL_METHOD, Signal};

const EVENT_CAPACITY: usize = 64;

/// Call activity, published on [`CallManager::subscribe`].
#[derive(Clone, Debug)]
pub enum CallEvent {
    /// A remote offer created a new call.
    Incoming(Call),
    /// The callee accepted our offer.
    Accepted {
        /// Call id.
        id: String,
        /// Callee's audio flag, if sent.
        audio: Option<bool>,
        /// Callee's video flag, if sent.
        video: Option<bool>,
    },
    /// The remote side declined.
    Rejected {
        /// Call id.
        id: String,
    },
    /// The remote side hung up or peer connectivity was lost.
    HungUp {
        /// Call id.
        id: String,
    },
    /// Local media was captured.
    LocalStream {
        /// Call id.
        id: String,
        /// The captured stream.
        stream: MediaStream,
    },
    /// Remote media arrived.
    RemoteStream {
        /// Call id.
        id: String,
        /// The received stream.
        stream: MediaStream,
    },
    /// The call changed state.
    StateChanged {
        /// Call id.
        id: String,
        /// New state.
        state: CallState,
    },
    /// Media or negotiation failed, or the remote side reported an error.
    Error {
        /// Call id.
        id: String,
        /// Description.
        message: String,
    },
}

pub(crate) struct ManagerInner {
    conn: Connection,
    media: Option<Arc<dyn MediaEngine>>,
    peer_config: PeerConfig,
    calls: Mutex<HashMap<String, Call>>,
    events: broadcast::Sender<CallEvent>,
    closed_watch: CancellationToken,
}

/// Owns the call table for one connection.
#[derive(Clone)]
pub struct CallManager {
    inner: Arc<ManagerInner>,
}

/// Non-owning handle to a [`CallManager`].
#[derive(Clone, Debug, Default)]
pub struct WeakCallManager {
    inner: Weak<ManagerInner>,
}

impl WeakCallManager {
    /// The manager, if it still exists.
    pub fn upgrade(&self) -> Option<CallManager> {
        self.inner.upgrade().map(|inner| CallManager { inner })
    }
}

impl CallManager {
    /// Create a manager and register its `webrtc` handler on `conn`.
    ///
    /// Must be called within a Tokio runtime. When `conn` closes, every live
    /// call ends as `HungUp`.
    ///
    /// `media` is `None` on platforms without peer media: outgoing calls
    /// then fail with `FeatureNotAvailable` and incoming offers are answered
    /// with an `error` packet.
    pub fn new(
        conn: Connection,
        media: Option<Arc<dyn MediaEngine>>,
        settings: &CallSettings,
    ) -> Result<Self, CallError> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(ManagerInner {
            conn: conn.clone(),
            media,
            peer_config: PeerConfig::from_settings(settings),
            calls: Mutex::new(HashMap::new()),
            events,
            closed_watch: CancellationToken::new(),
        });
        conn.on(
            SIGNAL_METHOD,
            SignalHandler {
                manager: Arc::downgrade(&inner),
            },
        )?;
        watch_connection(&inner);
        Ok(Self { inner })
    }

    /// Whether calls can be placed.
    pub fn is_supported(&self) -> bool {
        self.inner.engine().is_some()
    }

    /// Place a call to `user`.
    ///
    /// Local media is captured first, then the offer is sent; the returned
    /// call is in `Offered`.
    pub async fn call(&self, user: &str, options: MediaOptions) -> Result<Call, CallError> {
        self.inner.place_call(user, options).await
    }

    /// Feed one decoded signaling packet to the state machine.
    pub async fn handle_packet(&self, packet: Packet) {
        self.inner.handle_packet(packet).await;
    }

    /// Look up a live call.
    pub fn get(&self, id: &str) -> Option<Call> {
        self.inner.calls.lock().get(id).cloned()
    }

    /// Every live call.
    pub fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().values().cloned().collect()
    }

    /// Number of live calls.
    pub fn len(&self) -> usize {
        self.inner.calls.lock().len()
    }

    /// Whether no call is live.
    pub fn is_empty(&self) -> bool {
        self.inner.calls.lock().is_empty()
    }

    /// Subscribe to call events.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// The signaling connection.
    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    /// A handle that does not keep the manager alive.
    pub fn downgrade(&self) -> WeakCallManager {
        WeakCallManager {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManager")
            .field("supported", &self.is_supported())
            .field("calls", &self.len())
            .finish_non_exhaustive()
    }
}

impl ManagerInner {
    fn engine(&self) -> Option<Arc<dyn MediaEngine>> {
        self.media.clone().filter(|engine| engine.is_supported())
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, call: &Call, signal: Signal) -> Result<(), CallError> {
        let packet = Packet::new(call.id(), call.user(), signal);
        self.conn
            .notify(SIGNAL_METHOD, Some(packet.to_payload()))
            .map_err(CallError::from)
    }

    fn forget(&self, call: &Call) {
        let _ = self.calls.lock().remove(call.id());
    }

    // ── Local operations ────────────────────────────────────────────

    #[instrument(skip(self, options), fields(audio = options.audio, video = options.video))]
    async fn place_call(self: &Arc<Self>, user: &str, options: MediaOptions) -> Result<Call, CallError> {
        let engine = self.engine().ok_or(CallError::FeatureNotAvailable)?;
        let id = Uuid::new_v4().to_string();
        let call = Call::new(
            id.clone(),
            user.to_owned(),
            Role::Caller,
            CallState::New,
            Arc::downgrade(self),
        );
        {
            let mut session = call.session();
            session.local.audio = options.audio;
            session.local.video = options.video;
        }
        let _ = self.calls.lock().insert(id.clone(), call.clone());
        info!(call_id = %id, "placing call");

        let stream = match engine.acquire_local_media(options).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(call_id = %id, error = %e, "local media unavailable");
                self.forget(&call);
                self.emit(CallEvent::Error {
                    id,
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };
        let state = call.state();
        if state.is_terminal() {
            debug!(call_id = %id, %state, "call ended while acquiring media, not offering");
            return Err(CallError::InvalidState {
                action: "offer",
                state,
            });
        }
        let offered = self.adopt_local_stream(&call, stream);

        if !self.set_state(&call, CallState::Offered) {
            return Err(CallError::InvalidState {
                action: "offer",
                state: call.state(),
            });
        }
        if let Err(e) = self.send(
            &call,
            Signal::Offer {
                audio: offered.audio,
                video: offered.video,
            },
        ) {
            let _ = self.terminate(&call, CallState::HungUp);
            return Err(e);
        }
        Ok(call)
    }

    pub(crate) async fn accept(
        self: &Arc<Self>,
        call: &Call,
        options: Option<MediaOptions>,
    ) -> Result<(), CallError> {
        let engine = self.engine().ok_or(CallError::FeatureNotAvailable)?;
        let wanted = {
            let mut session = call.session();
            if call.role() != Role::Callee || session.state != CallState::Offered {
                return Err(CallError::InvalidState {
                    action: "accept",
                    state: session.state,
                });
            }
            let wanted = options.unwrap_or_else(|| session.remote.options());
            session.local.audio = wanted.audio;
            session.local.video = wanted.video;
            wanted
        };
        info!(call_id = %call.id(), audio = wanted.audio, video = wanted.video, "accepting call");

        let stream = match engine.acquire_local_media(wanted).await {
            Ok(stream) => stream,
            Err(e) => {
                let e = CallError::from(e);
                self.report(call, &e);
                return Err(e);
            }
        };
        let local = self.adopt_local_stream(call, stream);

        let state = call.state();
        if state != CallState::Offered {
            return Err(CallError::InvalidState {
                action: "accept",
                state,
            });
        }
        let _ = self.start_peer(call, &engine).await?;
        let _ = self.set_state(call, CallState::Accepted);
        self.send(
            call,
            Signal::Accept {
                audio: Some(local.audio),
                video: Some(local.video),
            },
        )
    }

    pub(crate) fn reject(&self, call: &Call) -> Result<(), CallError> {
        let state = call.state();
        if call.role() != Role::Callee || state != CallState::Offered {
            return Err(CallError::InvalidState {
                action: "reject",
                state,
            });
        }
        info!(call_id = %call.id(), "rejecting call");
        let sent = self.send(call, Signal::Reject);
        let _ = self.terminate(call, CallState::Rejected);
        sent
    }

    pub(crate) fn hangup(&self, call: &Call) -> Result<(), CallError> {
        let state = call.state();
        if state.is_terminal() {
            return Err(CallError::InvalidState {
                action: "hang up",
                state,
            });
        }
        info!(call_id = %call.id(), "hanging up");
        let sent = self.send(call, Signal::Hangup);
        let _ = self.terminate(call, CallState::HungUp);
        sent
    }

    // ── Inbound packets ─────────────────────────────────────────────

    #[instrument(skip_all, fields(call_id = %packet.id))]
    async fn handle_packet(self: &Arc<Self>, packet: Packet) {
        let Packet { id, user, signal } = packet;

        if self.engine().is_none() {
            if matches!(signal, Signal::Offer { .. }) {
                debug!("peer media unavailable, refusing offer");
                let reply = Packet::new(id, user, Signal::Error);
                if let Err(e) = self.conn.notify(SIGNAL_METHOD, Some(reply.to_payload())) {
                    warn!(error = %e, "failed to refuse offer");
                }
            }
            return;
        }

        let existing = self.calls.lock().get(&id).cloned();
        let Some(call) = existing else {
            match signal {
                Signal::Offer { audio, video } => self.on_offer(id, user, audio, video),
                _ => debug!("no call for packet"),
            }
            return;
        };

        if call.user() != user {
            debug!(%user, "packet user does not match call, dropping");
            return;
        }

        match signal {
            Signal::Offer { .. } => debug!("duplicate offer ignored"),
            Signal::Accept { audio, video } => self.on_remote_accept(&call, audio, video).await,
            Signal::Reject => {
                if self.terminate(&call, CallState::Rejected) {
                    self.emit(CallEvent::Rejected { id });
                }
            }
            Signal::Hangup => self.remote_hangup(&call),
            Signal::Error => {
                self.emit(CallEvent::Error {
                    id: id.clone(),
                    message: "remote side cannot take the call".into(),
                });
                if self.terminate(&call, CallState::Rejected) {
                    self.emit(CallEvent::Rejected { id });
                }
            }
            Signal::Description(description) => self.on_description(&call, description).await,
            Signal::Candidate(candidate) => self.on_candidate(&call, candidate).await,
        }
    }

    fn on_offer(self: &Arc<Self>, id: String, user: String, audio: bool, video: bool) {
        let call = Call::new(
            id.clone(),
            user,
            Role::Callee,
            CallState::Offered,
            Arc::downgrade(self),
        );
        {
            let mut session = call.session();
            session.remote.audio = audio;
            session.remote.video = video;
        }
        let _ = self.calls.lock().insert(id.clone(), call.clone());
        info!(user = %call.user(), audio, video, "incoming call");
        self.emit(CallEvent::StateChanged {
            id,
            state: CallState::Offered,
        });
        self.emit(CallEvent::Incoming(call));
    }

    async fn on_remote_accept(self: &Arc<Self>, call: &Call, audio: Option<bool>, video: Option<bool>) {
        {
            let mut session = call.session();
            if call.role() != Role::Caller || session.state != CallState::Offered {
                debug!(state = %session.state, "unexpected accept ignored");
                return;
            }
            if let Some(audio) = audio {
                session.remote.audio = audio;
            }
            if let Some(video) = video {
                session.remote.video = video;
            }
        }
        info!("call accepted");
        self.emit(CallEvent::Accepted {
            id: call.id().to_owned(),
            audio,
            video,
        });
        let _ = self.set_state(call, CallState::Accepted);

        if let Err(e) = self.send_offer_description(call).await {
            self.report(call, &e);
        }
    }

    async fn send_offer_description(self: &Arc<Self>, call: &Call) -> Result<(), CallError> {
        let engine = self.engine().ok_or(CallError::FeatureNotAvailable)?;
        let peer = self.start_peer(call, &engine).await?;
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        call.session().local_description = true;
        self.send(call, Signal::Description(offer))?;
        self.check_connected(call);
        Ok(())
    }

    async fn on_description(&self, call: &Call, description: Value) {
        let peer = call.session().peer.clone();
        let Some(peer) = peer else {
            debug!("description before peer connection, dropping");
            return;
        };
        if let Err(e) = self.apply_remote_description(call, &peer, description).await {
            self.report(call, &e);
        }
    }

    async fn apply_remote_description(
        &self,
        call: &Call,
        peer: &Arc<dyn PeerConnection>,
        description: Value,
    ) -> Result<(), CallError> {
        peer.set_remote_description(description).await?;
        let (buffered, must_answer) = {
            let mut session = call.session();
            session.remote_description = true;
            let buffered = std::mem::take(&mut session.pending_candidates);
            let must_answer = call.role() == Role::Callee && !session.local_description;
            (buffered, must_answer)
        };
        if !buffered.is_empty() {
            debug!(count = buffered.len(), "applying buffered candidates");
        }
        for candidate in buffered {
            peer.add_ice_candidate(candidate).await?;
        }

        if must_answer {
            let answer = peer.create_answer().await?;
            peer.set_local_description(answer.clone()).await?;
            call.session().local_description = true;
            self.send(call, Signal::Description(answer))?;
        }
        self.check_connected(call);
        Ok(())
    }

    async fn on_candidate(&self, call: &Call, candidate: Value) {
        let ready = {
            let mut session = call.session();
            let ready = if session.remote_description {
                session.peer.clone()
            } else {
                None
            };
            if ready.is_none() {
                session.pending_candidates.push(candidate.clone());
            }
            ready
        };
        match ready {
            Some(peer) => {
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    self.report(call, &CallError::from(e));
                }
            }
            None => debug!("buffering candidate until remote description"),
        }
    }

    /// The signaling link is gone; no further packet can reach any call.
    fn connection_lost(&self) {
        let live: Vec<Call> = self.calls.lock().values().cloned().collect();
        if !live.is_empty() {
            info!(calls = live.len(), "connection closed, ending calls");
        }
        for call in live {
            self.remote_hangup(&call);
        }
    }

    fn remote_hangup(&self, call: &Call) {
        if self.terminate(call, CallState::HungUp) {
            self.emit(CallEvent::HungUp {
                id: call.id().to_owned(),
            });
        }
    }

    // ── Peer connection ─────────────────────────────────────────────

    async fn start_peer(
        self: &Arc<Self>,
        call: &Call,
        engine: &Arc<dyn MediaEngine>,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        let stream = call
            .session()
            .local
            .stream
            .clone()
            .ok_or_else(|| MediaError::Failed("no local stream".into()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = engine.create_peer(self.peer_config.clone(), &stream, tx).await?;

        let state = {
            let mut session = call.session();
            if !session.state.is_terminal() {
                session.peer = Some(peer.clone());
            }
            session.state
        };
        if state.is_terminal() {
            peer.close();
            return Err(CallError::InvalidState {
                action: "connect",
                state,
            });
        }
        self.watch_peer(call, rx);
        Ok(peer)
    }

    fn watch_peer(self: &Arc<Self>, call: &Call, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
        let manager = Arc::downgrade(self);
        let call = call.clone();
        let cancel = call.inner.cancel.clone();
        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let Some(manager) = manager.upgrade() else { break };
                        manager.on_peer_event(&call, event);
                    }
                }
            }
        }));
    }

    fn on_peer_event(&self, call: &Call, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(Some(candidate)) => {
                if let Err(e) = self.send(call, Signal::Candidate(candidate)) {
                    warn!(call_id = %call.id(), error = %e, "failed to send candidate");
                }
            }
            PeerEvent::IceCandidate(None) => debug!(call_id = %call.id(), "candidate gathering done"),
            PeerEvent::IceConnectionState(state) => {
                debug!(call_id = %call.id(), ?state, "ice connection state");
                if state.is_gone() {
                    self.remote_hangup(call);
                }
            }
            PeerEvent::RemoteStream(stream) => {
                call.session().remote.adopt(stream.clone());
                self.emit(CallEvent::RemoteStream {
                    id: call.id().to_owned(),
                    stream,
                });
            }
        }
    }

    // ── State ───────────────────────────────────────────────────────

    fn adopt_local_stream(&self, call: &Call, stream: MediaStream) -> MediaInfo {
        let local = {
            let mut session = call.session();
            session.local.adopt(stream.clone());
            session.local.clone()
        };
        self.emit(CallEvent::LocalStream {
            id: call.id().to_owned(),
            stream,
        });
        local
    }

    /// Move to `state` unless the call already ended.
    fn set_state(&self, call: &Call, state: CallState) -> bool {
        {
            let mut session = call.session();
            if session.state.is_terminal() || session.state == state {
                return false;
            }
            session.state = state;
        }
        debug!(call_id = %call.id(), %state, "call state");
        self.emit(CallEvent::StateChanged {
            id: call.id().to_owned(),
            state,
        });
        true
    }

    fn check_connected(&self, call: &Call) {
        let ready = {
            let session = call.session();
            session.state == CallState::Accepted
                && session.local_description
                && session.remote_description
        };
        if ready && self.set_state(call, CallState::Connected) {
            info!(call_id = %call.id(), "call connected");
        }
    }

    /// End the call: close the peer, stop its event task, drop it from the
    /// table. Returns `false` if it had already ended.
    fn terminate(&self, call: &Call, state: CallState) -> bool {
        let peer = {
            let mut session = call.session();
            if session.state.is_terminal() {
                return false;
            }
            session.state = state;
            session.pending_candidates.clear();
            session.peer.take()
        };
        call.inner.cancel.cancel();
        if let Some(peer) = peer {
            peer.close();
        }
        self.forget(call);
        info!(call_id = %call.id(), %state, "call ended");
        self.emit(CallEvent::StateChanged {
            id: call.id().to_owned(),
            state,
        });
        true
    }

    fn report(&self, call: &Call, error: &CallError) {
        warn!(call_id = %call.id(), %error, "call negotiation failed");
        self.emit(CallEvent::Error {
            id: call.id().to_owned(),
            message: error.to_string(),
        });
    }
}

fn watch_connection(inner: &Arc<ManagerInner>) {
    let mut events = inner.conn.subscribe();
    let manager = Arc::downgrade(inner);
    let cancel = inner.closed_watch.clone();
    drop(tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = events.recv() => {
                    let Some(manager) = manager.upgrade() else { break };
                    match event {
                        Ok(ConnectionEvent::Close(_)) => manager.connection_lost(),
                        Ok(_) => {}
                        Err(RecvError::Lagged(_)) => {
                            if !manager.conn.is_open() {
                                manager.connection_lost();
                            }
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
    }));
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.closed_watch.cancel();
        for call in self.calls.get_mut().values() {
            call.inner.cancel.cancel();
            if let Some(peer) = call.session().peer.take() {
                peer.close();
            }
        }
    }
}

/// Routes `webrtc` traffic into the manager.
struct SignalHandler {
    manager: Weak<ManagerInner>,
}

#[async_trait]
impl Handler for SignalHandler {
    async fn handle(&self, inbound: Inbound, _conn: &Connection) -> Handled<Inbound> {
        let Some(manager) = self.manager.upgrade() else {
            return Handled::No(inbound);
        };
        let packet = inbound.payload().and_then(Packet::from_payload);
        match inbound {
            Inbound::Notification(_) => match packet {
                Some(packet) => manager.handle_packet(packet).await,
                None => debug!("ignoring malformed signaling packet"),
            },
            Inbound::Request(_, responder) => match packet {
                Some(packet) => {
                    manager.handle_packet(packet).await;
                    let _ = responder.ok(Value::Null);
                }
                None => {
                    let _ = responder.err(RpcError::invalid_params("malformed signaling packet"));
                }
            },
        }
        Handled::Yes
    }
}
