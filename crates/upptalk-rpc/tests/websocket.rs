//! Connection over the real WebSocket transport against a local server.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use upptalk_rpc::{
    ActionRegistry, CloseReason, Connection, ConnectionEvent, Endpoint, WsTransport,
};
use upptalk_settings::{KeepaliveSettings, ServerSettings};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Serve one WebSocket client: answer `echo` requests, forward every other
/// frame to the test, and close when told to.
async fn boot_server() -> (u16, mpsc::UnboundedReceiver<Value>, mpsc::UnboundedSender<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();

    drop(tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        loop {
            tokio::select! {
                frame = ws.next() => {
                    let Some(Ok(WsMessage::Text(text))) = frame else { break };
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["method"] == "echo" {
                        let reply = json!({"id": value["id"], "result": value["payload"]});
                        ws.send(WsMessage::text(reply.to_string())).await.unwrap();
                    } else {
                        let _ = seen_tx.send(value);
                    }
                }
                push = push_rx.recv() => match push {
                    Some(text) if text == "CLOSE" => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    Some(text) => ws.send(WsMessage::text(text)).await.unwrap(),
                    None => break,
                },
            }
        }
    }));

    (port, seen_rx, push_tx)
}

fn target(port: u16) -> String {
    let settings = ServerSettings {
        host: "127.0.0.1".into(),
        port,
        secure: false,
        apikey: Some("test-key".into()),
        ..ServerSettings::default()
    };
    Endpoint::from_settings(&settings)
        .websocket_url()
        .unwrap()
        .to_string()
}

fn connection() -> Connection {
    Connection::new(
        ActionRegistry::new(),
        KeepaliveSettings {
            enabled: false,
            ..KeepaliveSettings::default()
        },
    )
}

#[tokio::test]
async fn request_round_trip_over_websocket() {
    let (port, _seen, _push) = boot_server().await;
    let conn = connection();
    conn.open(&WsTransport::new(), &target(port)).await.unwrap();

    let result = timeout(TIMEOUT, conn.call("echo", Some(json!({"text": "hi"}))))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, json!({"text": "hi"}));
    assert_eq!(conn.pending_count(), 0);
}

#[tokio::test]
async fn server_request_without_handler_is_answered() {
    let (port, mut seen, push) = boot_server().await;
    let conn = connection();
    conn.open(&WsTransport::new(), &target(port)).await.unwrap();

    push.send(r#"{"method":"energy","id":"srv-1"}"#.into())
        .unwrap();
    let reply = timeout(TIMEOUT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(reply, json!({"id": "srv-1", "error": "Method not found"}));
}

#[tokio::test]
async fn server_close_emits_close_event() {
    let (port, _seen, push) = boot_server().await;
    let conn = connection();
    let mut events = conn.subscribe();
    conn.open(&WsTransport::new(), &target(port)).await.unwrap();

    push.send("CLOSE".into()).unwrap();
    let reason = loop {
        if let ConnectionEvent::Close(reason) = timeout(TIMEOUT, events.recv()).await.unwrap().unwrap() {
            break reason;
        }
    };
    assert_eq!(reason, CloseReason::TransportClosed);
    assert!(!conn.is_open());
}

#[tokio::test]
async fn local_close_fails_outstanding_call() {
    let (port, _seen, _push) = boot_server().await;
    let conn = connection();
    conn.open(&WsTransport::new(), &target(port)).await.unwrap();

    let call = tokio::spawn({
        let conn = conn.clone();
        async move { conn.call("contacts", None).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.close();

    let outcome = timeout(TIMEOUT, call).await.unwrap().unwrap();
    assert_eq!(outcome, Err(upptalk_core::RpcError::ConnectionClosed));
}
