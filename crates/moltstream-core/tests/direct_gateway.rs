//! Direct transport against an in-process mock gateway.
//!
//! The mock speaks just enough of the gateway protocol: it issues a
//! `connect.challenge`, verifies the device signature, acknowledges
//! `chat.send` with a run id, and replays a scripted list of chat events.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use futures_util::{SinkExt, StreamExt};
use moltstream_core::config::GatewayConfig;
use moltstream_core::gateway::identity::SigningInput;
use moltstream_core::gateway::{
    DeviceIdentity, DirectClient, DirectSettings, GatewayError, GatewayEvent, GatewayTransport,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const TOKEN: &str = "test-token";

#[derive(Clone, Copy, PartialEq)]
enum Verdict {
    /// Verify the signature and accept if it checks out.
    Verify,
    /// Verify against a key other than the one presented.
    WrongKey,
}

struct MockGateway {
    url: String,
    requests: mpsc::UnboundedReceiver<Value>,
}

/// Spawn a mock gateway serving one connection.
///
/// `events` are sent after acknowledging the first `chat.send` with run id
/// `run-1`.
async fn spawn_gateway(verdict: Verdict, events: Vec<Value>) -> MockGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (req_tx, req_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut source) = ws.split();

        let challenge = json!({
            "type": "event",
            "event": "connect.challenge",
            "payload": {"nonce": "nonce-123", "ts": 1_700_000_000_000u64}
        });
        sink.send(Message::text(challenge.to_string())).await.unwrap();

        while let Some(Ok(msg)) = source.next().await {
            let Message::Text(text) = msg else { continue };
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            let _ = req_tx.send(frame.clone());
            let id = frame["id"].clone();

            match frame["method"].as_str() {
                Some("connect") => {
                    if signature_ok(&frame["params"], verdict) {
                        let res = json!({"type": "res", "id": id, "ok": true, "payload": {"type": "hello-ok"}});
                        sink.send(Message::text(res.to_string())).await.unwrap();
                    } else {
                        let res = json!({
                            "type": "res", "id": id, "ok": false,
                            "error": {"code": "UNAUTHORIZED", "message": "device signature invalid"}
                        });
                        sink.send(Message::text(res.to_string())).await.unwrap();
                        let _ = sink.close().await;
                        return;
                    }
                }
                Some("chat.send") => {
                    let res = json!({"type": "res", "id": id, "ok": true, "payload": {"runId": "run-1", "status": "started"}});
                    sink.send(Message::text(res.to_string())).await.unwrap();
                    for event in &events {
                        let frame = json!({"type": "event", "event": "chat", "payload": event});
                        sink.send(Message::text(frame.to_string())).await.unwrap();
                    }
                }
                _ => {}
            }
        }
    });

    MockGateway {
        url: format!("ws://{}", addr),
        requests: req_rx,
    }
}

fn signature_ok(params: &Value, verdict: Verdict) -> bool {
    let device = &params["device"];
    let scopes: Vec<String> = serde_json::from_value(params["scopes"].clone()).unwrap();
    let payload = SigningInput {
        device_id: device["id"].as_str().unwrap(),
        client_id: params["client"]["id"].as_str().unwrap(),
        client_mode: params["client"]["mode"].as_str().unwrap(),
        role: params["role"].as_str().unwrap(),
        scopes: &scopes,
        signed_at_ms: device["signedAt"].as_u64().unwrap(),
        token: params["auth"]["token"].as_str().unwrap(),
        nonce: device["nonce"].as_str().unwrap(),
    }
    .payload();

    let public = match verdict {
        Verdict::Verify => {
            let raw = URL_SAFE_NO_PAD.decode(device["publicKey"].as_str().unwrap()).unwrap();
            VerifyingKey::from_bytes(raw.as_slice().try_into().unwrap()).unwrap()
        }
        Verdict::WrongKey => SigningKey::from_bytes(&[42u8; 32]).verifying_key(),
    };
    let sig = URL_SAFE_NO_PAD.decode(device["signature"].as_str().unwrap()).unwrap();
    let sig = Signature::from_slice(&sig).unwrap();
    device["nonce"] == "nonce-123" && public.verify(payload.as_bytes(), &sig).is_ok()
}

fn client(url: &str) -> (DirectClient, mpsc::Receiver<GatewayEvent>) {
    client_with_timeout(url, 5)
}

fn client_with_timeout(url: &str, secs: u64) -> (DirectClient, mpsc::Receiver<GatewayEvent>) {
    let gateway = GatewayConfig {
        url: url.to_string(),
        token: TOKEN.to_string(),
        session_key: "main".into(),
        connect_timeout_secs: secs,
        ..GatewayConfig::default()
    };
    let identity = DeviceIdentity::new("device-abc", SigningKey::from_bytes(&[7u8; 32]));
    let (tx, rx) = mpsc::channel(64);
    (
        DirectClient::new(DirectSettings::from_config(&gateway), identity, tx),
        rx,
    )
}

fn chat(run_id: &str, state: &str, text: &str) -> Value {
    json!({
        "runId": run_id,
        "sessionKey": "main",
        "state": state,
        "message": {"role": "assistant", "content": [{"type": "text", "text": text}]}
    })
}

async fn next_event(rx: &mut mpsc::Receiver<GatewayEvent>) -> GatewayEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for gateway event")
        .expect("event channel closed")
}

#[tokio::test]
async fn handshake_sends_signed_connect() {
    let mut gw = spawn_gateway(Verdict::Verify, vec![]).await;
    let (client, _rx) = client(&gw.url);

    client.connect().await.unwrap();
    assert!(client.is_connected().await);

    let connect = gw.requests.recv().await.unwrap();
    let params = &connect["params"];
    assert_eq!(connect["type"], "req");
    assert_eq!(params["minProtocol"], 3);
    assert_eq!(params["maxProtocol"], 3);
    assert_eq!(params["client"]["id"], "gateway-client");
    assert_eq!(params["client"]["mode"], "backend");
    assert_eq!(params["role"], "operator");
    assert_eq!(params["scopes"], json!(["operator.read", "operator.write"]));
    assert_eq!(params["auth"]["token"], TOKEN);
    assert_eq!(params["device"]["id"], "device-abc");
    assert_eq!(params["device"]["nonce"], "nonce-123");

    client.close().await;
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn cumulative_chat_events_stream_as_deltas() {
    let events = vec![
        chat("run-1", "delta", "The"),
        chat("other-run", "delta", "Ignore me"),
        chat("run-1", "delta", "The answer"),
        chat("run-1", "final", "The answer is 42."),
    ];
    let mut gw = spawn_gateway(Verdict::Verify, events).await;
    let (client, mut rx) = client(&gw.url);
    client.connect().await.unwrap();

    client.send("What is the answer?").await.unwrap();

    assert_eq!(next_event(&mut rx).await, GatewayEvent::Message { delta: "The".into(), done: false });
    assert_eq!(next_event(&mut rx).await, GatewayEvent::Message { delta: " answer".into(), done: false });
    assert_eq!(next_event(&mut rx).await, GatewayEvent::Message { delta: " is 42.".into(), done: true });

    let _connect = gw.requests.recv().await.unwrap();
    let send = gw.requests.recv().await.unwrap();
    assert_eq!(send["method"], "chat.send");
    assert_eq!(send["params"]["sessionKey"], "main");
    assert_eq!(send["params"]["message"], "What is the answer?");
    assert!(send["params"]["idempotencyKey"].as_str().is_some());
}

#[tokio::test]
async fn non_extending_content_fails_the_run() {
    let events = vec![
        chat("run-1", "delta", "The answer"),
        chat("run-1", "delta", "A different answer"),
    ];
    let gw = spawn_gateway(Verdict::Verify, events).await;
    let (client, mut rx) = client(&gw.url);
    client.connect().await.unwrap();
    client.send("hi").await.unwrap();

    assert_eq!(next_event(&mut rx).await, GatewayEvent::Message { delta: "The answer".into(), done: false });
    match next_event(&mut rx).await {
        GatewayEvent::RunFailed { kind, .. } => {
            assert_eq!(kind, moltstream_core::gateway::RunFailure::ProtocolViolation)
        }
        other => panic!("expected RunFailed, got {:?}", other),
    }

    // The run is cleared, so a new send is accepted.
    client.send("again").await.unwrap();
}

#[tokio::test]
async fn bad_signature_is_rejected() {
    let gw = spawn_gateway(Verdict::WrongKey, vec![]).await;
    let (client, _rx) = client(&gw.url);

    let err = client.connect().await.unwrap_err();
    match err {
        GatewayError::Rejected(message) => assert!(message.contains("device signature invalid")),
        other => panic!("expected Rejected, got {:?}", other),
    }
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn send_while_disconnected_writes_nothing() {
    let (client, mut rx) = client("ws://127.0.0.1:9");
    assert!(matches!(client.send("hello").await, Err(GatewayError::NotConnected)));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unreachable_gateway_fails_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (client, _rx) = client(&format!("ws://{}", addr));
    assert!(client.connect().await.is_err());
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn gateway_close_emits_disconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut source) = ws.split();
        let challenge = json!({"type": "event", "event": "connect.challenge", "payload": {"nonce": "n"}});
        sink.send(Message::text(challenge.to_string())).await.unwrap();
        if let Some(Ok(Message::Text(text))) = source.next().await {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            let res = json!({"type": "res", "id": frame["id"], "ok": true});
            sink.send(Message::text(res.to_string())).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = sink.close().await;
    });

    let (client, mut rx) = client(&format!("ws://{}", addr));
    client.connect().await.unwrap();
    assert!(matches!(next_event(&mut rx).await, GatewayEvent::Disconnected(_)));
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn connect_timeout_bounds_the_whole_handshake() {
    // Each step stays under the one second limit; together they exceed it.
    let step = Duration::from_millis(700);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(step).await;
        let Ok(ws) = tokio_tungstenite::accept_async(stream).await else { return };
        let (mut sink, mut source) = ws.split();
        tokio::time::sleep(step).await;
        let challenge = json!({"type": "event", "event": "connect.challenge", "payload": {"nonce": "n"}});
        if sink.send(Message::text(challenge.to_string())).await.is_err() {
            return;
        }
        if let Some(Ok(Message::Text(text))) = source.next().await {
            tokio::time::sleep(step).await;
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            let res = json!({"type": "res", "id": frame["id"], "ok": true});
            let _ = sink.send(Message::text(res.to_string())).await;
        }
    });

    let (client, _rx) = client_with_timeout(&format!("ws://{}", addr), 1);
    let started = std::time::Instant::now();
    let result = client.connect().await;

    assert!(matches!(result, Err(GatewayError::Timeout(_))), "got {:?}", result);
    assert!(started.elapsed() < Duration::from_millis(1800));
    assert!(!client.is_connected().await);
}
