//! Call signaling over in-memory connections with a scripted media engine.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::time::timeout;
use upptalk_call::{
    CallError, CallEvent, CallManager, CallState, IceConnectionState, MediaEngine, MediaError,
    MediaOptions, MediaStream, PeerConfig, PeerConnection, PeerEvent, Role,
};
use upptalk_core::{Message, RpcError};
use upptalk_rpc::{ActionRegistry, Connection, MemoryPeer, memory_link};
use upptalk_settings::{CallSettings, IceServer, KeepaliveSettings};

const TIMEOUT: Duration = Duration::from_secs(5);

// ── Scripted media ──────────────────────────────────────────────────

struct FakeMedia {
    supported: bool,
    log: Arc<Mutex<Vec<String>>>,
    peers: Mutex<Vec<Arc<FakePeer>>>,
    configs: Mutex<Vec<PeerConfig>>,
}

impl FakeMedia {
    fn new() -> Arc<Self> {
        Self::with_support(true)
    }

    fn with_support(supported: bool) -> Arc<Self> {
        Arc::new(Self {
            supported,
            log: Arc::new(Mutex::new(Vec::new())),
            peers: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
        })
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn peer(&self, index: usize) -> Arc<FakePeer> {
        self.peers.lock()[index].clone()
    }
}

#[async_trait]
impl MediaEngine for FakeMedia {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn acquire_local_media(&self, options: MediaOptions) -> Result<MediaStream, MediaError> {
        self.log
            .lock()
            .push(format!("media audio={} video={}", options.audio, options.video));
        Ok(MediaStream {
            id: "local".into(),
            audio_tracks: usize::from(options.audio),
            video_tracks: usize::from(options.video),
        })
    }

    async fn create_peer(
        &self,
        config: PeerConfig,
        _local: &MediaStream,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        self.log.lock().push("peer".into());
        self.configs.lock().push(config);
        let peer = Arc::new(FakePeer {
            log: self.log.clone(),
            events,
        });
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

struct FakePeer {
    log: Arc<Mutex<Vec<String>>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl FakePeer {
    fn emit(&self, event: PeerEvent) {
        self.events.send(event).unwrap();
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<Value, MediaError> {
        self.log.lock().push("offer".into());
        Ok(json!({"type": "offer", "sdp": "v=0 caller"}))
    }

    async fn create_answer(&self) -> Result<Value, MediaError> {
        self.log.lock().push("answer".into());
        Ok(json!({"type": "answer", "sdp": "v=0 callee"}))
    }

    async fn set_local_description(&self, description: Value) -> Result<(), MediaError> {
        self.log.lock().push(format!("local:{}", description["type"].as_str().unwrap_or("?")));
        Ok(())
    }

    async fn set_remote_description(&self, description: Value) -> Result<(), MediaError> {
        self.log.lock().push(format!("remote:{}", description["type"].as_str().unwrap_or("?")));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), MediaError> {
        self.log
            .lock()
            .push(format!("candidate:{}", candidate["candidate"].as_str().unwrap_or("?")));
        Ok(())
    }

    fn close(&self) {
        self.log.lock().push("close".into());
    }
}

/// Holds `acquire_local_media` until `release` is notified.
struct GatedMedia {
    inner: Arc<FakeMedia>,
    release: Arc<Notify>,
}

#[async_trait]
impl MediaEngine for GatedMedia {
    fn is_supported(&self) -> bool {
        true
    }

    async fn acquire_local_media(&self, options: MediaOptions) -> Result<MediaStream, MediaError> {
        self.release.notified().await;
        self.inner.acquire_local_media(options).await
    }

    async fn create_peer(
        &self,
        config: PeerConfig,
        local: &MediaStream,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        self.inner.create_peer(config, local, events).await
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn connection() -> Connection {
    Connection::new(
        ActionRegistry::new(),
        KeepaliveSettings {
            enabled: false,
            ..KeepaliveSettings::default()
        },
    )
}

fn setup(media: Option<Arc<FakeMedia>>) -> (CallManager, MemoryPeer) {
    let conn = connection();
    let engine = media.map(|m| m as Arc<dyn MediaEngine>);
    let calls = CallManager::new(conn.clone(), engine, &CallSettings::default()).unwrap();
    let (link, server) = memory_link("mem://server", 64);
    conn.attach(link).unwrap();
    (calls, server)
}

async fn deliver(server: &MemoryPeer, payload: Value) {
    assert!(
        server
            .send_message(&Message::notification("webrtc", Some(payload)))
            .await
    );
}

/// Next `webrtc` payload the client wrote.
async fn next_signal(server: &mut MemoryPeer) -> Value {
    loop {
        let message = timeout(TIMEOUT, server.recv_message())
            .await
            .expect("timeout waiting for signal")
            .expect("link closed");
        if let Message::Notification(n) = message {
            if n.method == "webrtc" {
                return n.payload.unwrap_or(Value::Null);
            }
        }
    }
}

/// Wait until every frame delivered so far has been dispatched; returns the
/// `webrtc` payloads written meanwhile.
async fn barrier(server: &mut MemoryPeer) -> Vec<Value> {
    assert!(server.send_text(r#"{"method":"barrier","id":"sync"}"#).await);
    let mut signals = Vec::new();
    loop {
        let message = timeout(TIMEOUT, server.recv_message())
            .await
            .expect("timeout waiting for barrier")
            .expect("link closed");
        match message {
            Message::Response(r) if r.id == "sync" => return signals,
            Message::Notification(n) if n.method == "webrtc" => {
                signals.push(n.payload.unwrap_or(Value::Null));
            }
            _ => {}
        }
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<CallEvent>,
    want: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    timeout(TIMEOUT, async {
        loop {
            let event = events.recv().await.unwrap();
            if want(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timeout waiting for call event")
}

async fn incoming(
    calls: &CallManager,
    server: &MemoryPeer,
    payload: Value,
) -> upptalk_call::Call {
    let mut events = calls.subscribe();
    deliver(server, payload).await;
    match wait_for(&mut events, |e| matches!(e, CallEvent::Incoming(_))).await {
        CallEvent::Incoming(call) => call,
        _ => unreachable!(),
    }
}

// ── Caller ──────────────────────────────────────────────────────────

#[tokio::test]
async fn outgoing_call_accept_then_remote_hangup() {
    let media = FakeMedia::new();
    let (calls, mut server) = setup(Some(media.clone()));
    let mut events = calls.subscribe();

    let call = calls.call("bob", MediaOptions::audio()).await.unwrap();
    assert_eq!(call.state(), CallState::Offered);
    assert_eq!(call.role(), Role::Caller);
    assert_eq!(calls.len(), 1);

    let offer = next_signal(&mut server).await;
    assert_eq!(
        offer,
        json!({"id": call.id(), "user": "bob", "type": "offer", "audio": true, "video": false})
    );
    assert_matches!(
        wait_for(&mut events, |e| matches!(e, CallEvent::LocalStream { .. })).await,
        CallEvent::LocalStream { stream, .. } if stream.has_audio() && !stream.has_video()
    );

    deliver(
        &server,
        json!({"id": call.id(), "user": "bob", "type": "accept", "audio": false, "video": false}),
    )
    .await;
    let description = next_signal(&mut server).await;
    assert_eq!(description["sdp"]["type"], "offer");
    assert_eq!(description["user"], "bob");
    assert_eq!(call.state(), CallState::Accepted);
    assert!(!call.remote().audio);
    assert_matches!(
        wait_for(&mut events, |e| matches!(e, CallEvent::Accepted { .. })).await,
        CallEvent::Accepted { audio: Some(false), video: Some(false), .. }
    );
    assert_eq!(media.log(), vec!["media audio=true video=false", "peer", "offer", "local:offer"]);

    deliver(&server, json!({"id": call.id(), "user": "bob", "type": "hangup"})).await;
    let _ = wait_for(&mut events, |e| matches!(e, CallEvent::HungUp { .. })).await;
    assert_eq!(call.state(), CallState::HungUp);
    assert!(calls.get(call.id()).is_none());
    assert!(media.log().contains(&"close".to_owned()));
}

#[tokio::test]
async fn caller_connects_once_answer_applied() {
    let media = FakeMedia::new();
    let (calls, mut server) = setup(Some(media.clone()));
    let mut events = calls.subscribe();
    let call = calls.call("bob", MediaOptions::audio_video()).await.unwrap();
    let _ = next_signal(&mut server).await;

    deliver(&server, json!({"id": call.id(), "user": "bob", "type": "accept"})).await;
    let _ = next_signal(&mut server).await;
    deliver(
        &server,
        json!({"id": call.id(), "user": "bob", "sdp": {"type": "answer", "sdp": "v=0"}}),
    )
    .await;

    let _ = wait_for(&mut events, |e| {
        matches!(e, CallEvent::StateChanged { state: CallState::Connected, .. })
    })
    .await;
    assert_eq!(call.state(), CallState::Connected);
    assert_eq!(media.log().last().map(String::as_str), Some("remote:answer"));
}

#[tokio::test]
async fn spoofed_user_has_no_effect() {
    let media = FakeMedia::new();
    let (calls, mut server) = setup(Some(media.clone()));
    let call = calls.call("bob", MediaOptions::audio()).await.unwrap();
    let _ = next_signal(&mut server).await;

    deliver(&server, json!({"id": call.id(), "user": "mallory", "type": "accept"})).await;
    deliver(&server, json!({"id": call.id(), "user": "mallory", "type": "hangup"})).await;
    deliver(
        &server,
        json!({"id": call.id(), "user": "mallory", "candidate": {"candidate": "x"}}),
    )
    .await;
    let written = barrier(&mut server).await;

    assert!(written.is_empty());
    assert_eq!(call.state(), CallState::Offered);
    assert_eq!(call.buffered_candidates(), 0);
    assert!(calls.get(call.id()).is_some());
    assert_eq!(media.log(), vec!["media audio=true video=false"]);
}

#[tokio::test]
async fn remote_reject_removes_call() {
    let (calls, mut server) = setup(Some(FakeMedia::new()));
    let mut events = calls.subscribe();
    let call = calls.call("bob", MediaOptions::audio()).await.unwrap();
    let _ = next_signal(&mut server).await;

    deliver(&server, json!({"id": call.id(), "user": "bob", "type": "reject"})).await;
    let _ = wait_for(&mut events, |e| matches!(e, CallEvent::Rejected { .. })).await;
    assert_eq!(call.state(), CallState::Rejected);
    assert!(calls.is_empty());
}

#[tokio::test]
async fn remote_error_ends_call() {
    let (calls, mut server) = setup(Some(FakeMedia::new()));
    let mut events = calls.subscribe();
    let call = calls.call("bob", MediaOptions::audio()).await.unwrap();
    let _ = next_signal(&mut server).await;

    deliver(&server, json!({"id": call.id(), "user": "bob", "type": "error"})).await;
    let _ = wait_for(&mut events, |e| matches!(e, CallEvent::Error { .. })).await;
    let _ = wait_for(&mut events, |e| matches!(e, CallEvent::Rejected { .. })).await;
    assert!(calls.is_empty());
}

#[tokio::test]
async fn local_hangup_notifies_remote() {
    let media = FakeMedia::new();
    let (calls, mut server) = setup(Some(media.clone()));
    let call = calls.call("bob", MediaOptions::audio()).await.unwrap();
    let _ = next_signal(&mut server).await;
    deliver(&server, json!({"id": call.id(), "user": "bob", "type": "accept"})).await;
    let _ = next_signal(&mut server).await;

    call.hangup().unwrap();
    assert_eq!(
        next_signal(&mut server).await,
        json!({"id": call.id(), "user": "bob", "type": "hangup"})
    );
    assert!(calls.is_empty());
    assert!(media.log().contains(&"close".to_owned()));
    assert_matches!(
        call.hangup(),
        Err(CallError::InvalidState { state: CallState::HungUp, .. })
    );
}

#[tokio::test]
async fn hangup_while_acquiring_media_sends_no_offer() {
    let media = FakeMedia::new();
    let release = Arc::new(Notify::new());
    let engine = Arc::new(GatedMedia {
        inner: media.clone(),
        release: release.clone(),
    });
    let conn = connection();
    let engine = Some(engine as Arc<dyn MediaEngine>);
    let calls = CallManager::new(conn.clone(), engine, &CallSettings::default()).unwrap();
    let (link, mut server) = memory_link("mem://server", 64);
    conn.attach(link).unwrap();

    let placing = tokio::spawn({
        let calls = calls.clone();
        async move { calls.call("bob", MediaOptions::audio()).await }
    });
    timeout(TIMEOUT, async {
        while calls.is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("call never registered");

    let pending = calls.calls().remove(0);
    assert_eq!(pending.state(), CallState::New);
    pending.hangup().unwrap();
    release.notify_one();

    assert_matches!(
        placing.await.unwrap(),
        Err(CallError::InvalidState { state: CallState::HungUp, .. })
    );
    assert_eq!(next_signal(&mut server).await["type"], "hangup");
    assert!(barrier(&mut server).await.is_empty());
    assert!(calls.is_empty());
    assert_eq!(media.log(), vec!["media audio=true video=false"]);
}

// ── Callee ──────────────────────────────────────────────────────────

#[tokio::test]
async fn incoming_offer_then_accept_mirrors_remote_flags() {
    let media = FakeMedia::new();
    let (calls, mut server) = setup(Some(media.clone()));

    let call = incoming(
        &calls,
        &server,
        json!({"id": "c1", "user": "alice", "type": "offer", "audio": true, "video": true}),
    )
    .await;
    assert_eq!(call.id(), "c1");
    assert_eq!(call.user(), "alice");
    assert_eq!(call.role(), Role::Callee);
    assert_eq!(call.state(), CallState::Offered);
    assert!(call.remote().video);

    call.accept(None).await.unwrap();
    assert_eq!(
        next_signal(&mut server).await,
        json!({"id": "c1", "user": "alice", "type": "accept", "audio": true, "video": true})
    );
    assert_eq!(call.state(), CallState::Accepted);
    assert_matches!(
        call.accept(None).await,
        Err(CallError::InvalidState { state: CallState::Accepted, .. })
    );
}

#[tokio::test]
async fn candidates_before_description_are_buffered() {
    let media = FakeMedia::new();
    let (calls, mut server) = setup(Some(media.clone()));
    let call = incoming(
        &calls,
        &server,
        json!({"id": "c1", "user": "alice", "type": "offer", "audio": true}),
    )
    .await;
    call.accept(Some(MediaOptions::audio())).await.unwrap();
    let _ = next_signal(&mut server).await;

    for c in ["a", "b"] {
        deliver(&server, json!({"id": "c1", "user": "alice", "candidate": {"candidate": c}})).await;
    }
    let _ = barrier(&mut server).await;
    assert_eq!(call.buffered_candidates(), 2);
    assert!(!media.log().iter().any(|l| l.starts_with("candidate:")));

    let mut events = calls.subscribe();
    deliver(
        &server,
        json!({"id": "c1", "user": "alice", "sdp": {"type": "offer", "sdp": "v=0"}}),
    )
    .await;
    let answer = next_signal(&mut server).await;
    assert_eq!(answer["sdp"]["type"], "answer");
    let _ = wait_for(&mut events, |e| {
        matches!(e, CallEvent::StateChanged { state: CallState::Connected, .. })
    })
    .await;

    assert_eq!(call.buffered_candidates(), 0);
    let log = media.log();
    let tail: Vec<&str> = log.iter().skip_while(|l| *l != "remote:offer").map(String::as_str).collect();
    assert_eq!(tail, vec!["remote:offer", "candidate:a", "candidate:b", "answer", "local:answer"]);

    deliver(&server, json!({"id": "c1", "user": "alice", "candidate": {"candidate": "c"}})).await;
    let _ = barrier(&mut server).await;
    assert_eq!(media.log().last().map(String::as_str), Some("candidate:c"));
}

#[tokio::test]
async fn duplicate_offer_is_ignored() {
    let (calls, mut server) = setup(Some(FakeMedia::new()));
    let call = incoming(
        &calls,
        &server,
        json!({"id": "c1", "user": "alice", "type": "offer", "audio": true}),
    )
    .await;

    let mut events = calls.subscribe();
    deliver(
        &server,
        json!({"id": "c1", "user": "alice", "type": "offer", "audio": false, "video": true}),
    )
    .await;
    let _ = barrier(&mut server).await;

    assert!(call.remote().audio);
    assert!(!call.remote().video);
    assert_eq!(calls.len(), 1);
    assert_matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty));
}

#[tokio::test]
async fn local_reject_sends_reject() {
    let (calls, mut server) = setup(Some(FakeMedia::new()));
    let call = incoming(
        &calls,
        &server,
        json!({"id": "c1", "user": "alice", "type": "offer", "audio": true}),
    )
    .await;

    call.reject().unwrap();
    assert_eq!(
        next_signal(&mut server).await,
        json!({"id": "c1", "user": "alice", "type": "reject"})
    );
    assert_eq!(call.state(), CallState::Rejected);
    assert!(calls.is_empty());
}

#[tokio::test]
async fn caller_cannot_reject_own_call() {
    let (calls, _server) = setup(Some(FakeMedia::new()));
    let call = calls.call("bob", MediaOptions::audio()).await.unwrap();
    assert_matches!(call.reject(), Err(CallError::InvalidState { action: "reject", .. }));
}

#[tokio::test]
async fn packet_for_unknown_call_is_ignored() {
    let media = FakeMedia::new();
    let (calls, mut server) = setup(Some(media.clone()));
    deliver(&server, json!({"id": "nope", "user": "alice", "type": "accept"})).await;
    deliver(&server, json!({"id": 7, "user": "alice", "type": "offer"})).await;
    let written = barrier(&mut server).await;
    assert!(written.is_empty());
    assert!(calls.is_empty());
    assert!(media.log().is_empty());
}

// ── Peer events ─────────────────────────────────────────────────────

#[tokio::test]
async fn peer_candidates_are_forwarded_and_disconnect_hangs_up() {
    let media = FakeMedia::new();
    let (calls, mut server) = setup(Some(media.clone()));
    let mut events = calls.subscribe();
    let call = incoming(
        &calls,
        &server,
        json!({"id": "c1", "user": "alice", "type": "offer", "audio": true}),
    )
    .await;
    call.accept(None).await.unwrap();
    let _ = next_signal(&mut server).await;

    let peer = media.peer(0);
    peer.emit(PeerEvent::IceCandidate(Some(json!({"candidate": "host 1"}))));
    assert_eq!(
        next_signal(&mut server).await,
        json!({"id": "c1", "user": "alice", "candidate": {"candidate": "host 1"}})
    );

    peer.emit(PeerEvent::IceCandidate(None));
    peer.emit(PeerEvent::RemoteStream(MediaStream {
        id: "remote".into(),
        audio_tracks: 1,
        video_tracks: 1,
    }));
    let _ = wait_for(&mut events, |e| matches!(e, CallEvent::RemoteStream { .. })).await;
    assert!(call.remote().video);

    peer.emit(PeerEvent::IceConnectionState(IceConnectionState::Disconnected));
    let _ = wait_for(&mut events, |e| matches!(e, CallEvent::HungUp { .. })).await;
    assert_eq!(call.state(), CallState::HungUp);
    assert!(calls.is_empty());

    // Connectivity loss ends the call locally without a hangup packet.
    let written = barrier(&mut server).await;
    assert!(written.is_empty());
}

#[tokio::test]
async fn turn_server_reaches_peer_config() {
    let media = FakeMedia::new();
    let conn = connection();
    let settings = CallSettings {
        turn: Some(IceServer {
            url: "turn:turn.example:3478?transport=udp".into(),
            username: Some("sonny".into()),
            credential: Some("foobar".into()),
        }),
    };
    let calls = CallManager::new(conn.clone(), Some(media.clone() as Arc<dyn MediaEngine>), &settings).unwrap();
    let (link, mut server) = memory_link("mem://server", 64);
    conn.attach(link).unwrap();

    let call = calls.call("bob", MediaOptions::audio()).await.unwrap();
    let _ = next_signal(&mut server).await;
    deliver(&server, json!({"id": call.id(), "user": "bob", "type": "accept"})).await;
    let _ = next_signal(&mut server).await;

    let configs = media.configs.lock().clone();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].ice_servers, settings.turn.into_iter().collect::<Vec<_>>());
}

// ── Connection loss ─────────────────────────────────────────────────

#[tokio::test]
async fn closing_connection_hangs_up_live_calls() {
    let media = FakeMedia::new();
    let (calls, mut server) = setup(Some(media.clone()));
    let mut events = calls.subscribe();

    let outgoing = calls.call("bob", MediaOptions::audio()).await.unwrap();
    let _ = next_signal(&mut server).await;
    let answered = incoming(
        &calls,
        &server,
        json!({"id": "c9", "user": "alice", "type": "offer", "audio": true}),
    )
    .await;
    answered.accept(None).await.unwrap();
    let _ = next_signal(&mut server).await;
    assert_eq!(calls.len(), 2);

    calls.connection().close();
    for _ in 0..2 {
        let _ = wait_for(&mut events, |e| matches!(e, CallEvent::HungUp { .. })).await;
    }
    assert_eq!(outgoing.state(), CallState::HungUp);
    assert_eq!(answered.state(), CallState::HungUp);
    assert!(calls.is_empty());
    assert!(media.log().contains(&"close".to_owned()));
}

// ── Unsupported platform ────────────────────────────────────────────

#[tokio::test]
async fn unsupported_call_fails_with_feature_not_available() {
    for media in [None, Some(FakeMedia::with_support(false))] {
        let (calls, _server) = setup(media);
        assert!(!calls.is_supported());
        let err = calls.call("bob", MediaOptions::audio()).await.unwrap_err();
        assert_matches!(err, CallError::FeatureNotAvailable);
        assert_eq!(RpcError::from(err).code(), "FEATURE_NOT_AVAILABLE");
        assert!(calls.is_empty());
    }
}

#[tokio::test]
async fn unsupported_offer_is_refused_silently() {
    let (calls, mut server) = setup(None);
    let mut events = calls.subscribe();

    deliver(
        &server,
        json!({"id": "c1", "user": "alice", "type": "offer", "audio": true}),
    )
    .await;
    assert_eq!(
        next_signal(&mut server).await,
        json!({"id": "c1", "user": "alice", "type": "error"})
    );
    let _ = barrier(&mut server).await;
    assert!(calls.is_empty());
    assert_matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty));
}

// ── Request form ────────────────────────────────────────────────────

#[tokio::test]
async fn signaling_request_is_acknowledged() {
    let (calls, mut server) = setup(Some(FakeMedia::new()));
    assert!(
        server
            .send_text(r#"{"method":"webrtc","id":"r1","payload":{"id":"c9","user":"eve","type":"offer"}}"#)
            .await
    );
    let reply = loop {
        match timeout(TIMEOUT, server.recv_message()).await.unwrap().unwrap() {
            Message::Response(r) => break r,
            _ => continue,
        }
    };
    assert_eq!(reply.id, "r1");
    assert_eq!(reply.into_outcome(), Ok(Value::Null));
    assert!(calls.get("c9").is_some());

    assert!(
        server
            .send_text(r#"{"method":"webrtc","id":"r2","payload":{"id":3}}"#)
            .await
    );
    let reply = loop {
        match timeout(TIMEOUT, server.recv_message()).await.unwrap().unwrap() {
            Message::Response(r) => break r,
            _ => continue,
        }
    };
    assert_eq!(reply.id, "r2");
    assert!(reply.into_outcome().is_err());
}

// ── Two clients through a relay ─────────────────────────────────────

/// Forward frames between two links, stamping `webrtc` payloads with the
/// sender's user name the way the server does.
fn relay(mut alice: MemoryPeer, mut bob: MemoryPeer) {
    fn stamp(text: String, sender: &str) -> String {
        let Ok(mut value) = serde_json::from_str::<Value>(&text) else {
            return text;
        };
        if value["method"] == "webrtc" {
            value["payload"]["user"] = json!(sender);
        }
        value.to_string()
    }

    drop(tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(text) = alice.recv_text() => {
                    let _ = bob.send_text(stamp(text, "alice")).await;
                }
                Some(text) = bob.recv_text() => {
                    let _ = alice.send_text(stamp(text, "bob")).await;
                }
                else => break,
            }
        }
    }));
}

#[tokio::test]
async fn two_clients_reach_connected() {
    let alice_media = FakeMedia::new();
    let bob_media = FakeMedia::new();

    let alice_conn = connection();
    let alice = CallManager::new(
        alice_conn.clone(),
        Some(alice_media as Arc<dyn MediaEngine>),
        &CallSettings::default(),
    )
    .unwrap();
    let (alice_link, alice_server) = memory_link("mem://alice", 64);
    alice_conn.attach(alice_link).unwrap();

    let bob_conn = connection();
    let bob = CallManager::new(
        bob_conn.clone(),
        Some(bob_media as Arc<dyn MediaEngine>),
        &CallSettings::default(),
    )
    .unwrap();
    let (bob_link, bob_server) = memory_link("mem://bob", 64);
    bob_conn.attach(bob_link).unwrap();

    relay(alice_server, bob_server);

    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    let outgoing = alice.call("bob", MediaOptions::audio_video()).await.unwrap();
    let ringing = match wait_for(&mut bob_events, |e| matches!(e, CallEvent::Incoming(_))).await {
        CallEvent::Incoming(call) => call,
        _ => unreachable!(),
    };
    assert_eq!(ringing.id(), outgoing.id());
    assert_eq!(ringing.user(), "alice");
    assert!(ringing.remote().audio && ringing.remote().video);

    ringing.accept(Some(MediaOptions::audio())).await.unwrap();

    for events in [&mut alice_events, &mut bob_events] {
        let _ = wait_for(events, |e| {
            matches!(e, CallEvent::StateChanged { state: CallState::Connected, .. })
        })
        .await;
    }
    assert_eq!(outgoing.state(), CallState::Connected);
    assert_eq!(ringing.state(), CallState::Connected);
    assert!(!outgoing.remote().video);

    outgoing.hangup().unwrap();
    let _ = wait_for(&mut bob_events, |e| matches!(e, CallEvent::HungUp { .. })).await;
    assert!(alice.is_empty());
    assert!(bob.is_empty());
}
