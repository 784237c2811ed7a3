//! End-to-end: editor requests through the bridge to the subprocess relay.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use moltstream_core::gateway::{CliRelay, GatewayTransport};
use moltstream_core::{Bridge, SessionManager};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

async fn next<R: tokio::io::AsyncBufRead + Unpin>(lines: &mut tokio::io::Lines<R>) -> Value {
    let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("timed out waiting for bridge output")
        .unwrap()
        .expect("bridge output closed");
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn send_streams_relay_output_and_completes() {
    let tmp = tempfile::tempdir().unwrap();
    let script = tmp.path().join("openclaw");
    std::fs::write(&script, "#!/bin/sh\necho \"you said: $5\"\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let (tx, rx) = mpsc::channel(16);
    let relay = Arc::new(CliRelay::new(
        script.to_string_lossy().into_owned(),
        "main".into(),
        tx,
    ));
    let session = SessionManager::new(tmp.path().join("sessions"), 1024, true).unwrap();

    let (out_writer, out_reader) = tokio::io::duplex(64 * 1024);
    let (mut in_writer, in_reader) = tokio::io::duplex(64 * 1024);
    let bridge = Bridge::new(relay.clone(), session, "openclaw", out_writer);
    bridge.spawn_event_pump(rx);
    bridge.connect().await.unwrap();

    let server = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.run(BufReader::new(in_reader)).await })
    };

    in_writer
        .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"send\",\"params\":{\"content\":\"hello\"},\"id\":1}\n")
        .await
        .unwrap();

    let mut lines = BufReader::new(out_reader).lines();

    assert_eq!(next(&mut lines).await["method"], "connected");

    let first = next(&mut lines).await;
    assert_eq!(first["method"], "stream");
    assert_eq!(first["params"]["delta"], "you said: hello\n");
    assert_eq!(first["params"]["done"], false);

    let last = next(&mut lines).await;
    assert_eq!(last["params"]["done"], true);

    let response = next(&mut lines).await;
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"]["status"], "ok");

    drop(in_writer);
    server.await.unwrap().unwrap();
    relay.close().await;
}
