//! Direct WebSocket transport.
//!
//! Connection lifecycle:
//!
//! ```text
//! Disconnected → Dialing → AwaitingChallenge → Authenticating → Connected
//! ```
//!
//! The handshake runs inside [`DirectClient::connect`]; once connected a
//! reader task owns the read half of the socket. Everything else (write half,
//! state, run bookkeeping) sits behind one `tokio::sync::Mutex`, so a `send`
//! from the bridge and a frame arriving on the reader never race. Events are
//! pushed to the bridge only after that lock is released.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::frames::{
    ChatEvent, ChatSendAck, ChatSendParams, ClientInfo, ConnectAuth, ConnectChallenge,
    ConnectParams, DeviceProof, EVENT_CHAT, EVENT_CONNECT_CHALLENGE, GatewayFrame, METHOD_CHAT_SEND,
    METHOD_CONNECT, PROTOCOL_VERSION,
};
use super::identity::{DeviceIdentity, SigningInput};
use super::run::RunTracker;
use super::{ConnectionState, GatewayError, GatewayEvent, GatewayTransport, RunFailure};
use crate::config::{GatewayConfig, TransportKind};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection parameters for [`DirectClient`].
#[derive(Debug, Clone)]
pub struct DirectSettings {
    pub url: String,
    pub token: String,
    pub session_key: String,
    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    /// Bound on the whole handshake: dial, challenge and connect result together
    pub connect_timeout: Duration,
}

impl DirectSettings {
    pub fn from_config(gateway: &GatewayConfig) -> Self {
        Self {
            url: gateway.url.clone(),
            token: gateway.token.clone(),
            session_key: gateway.session_key.clone(),
            client_id: gateway.client_id.clone(),
            client_mode: gateway.client_mode.clone(),
            role: gateway.role.clone(),
            scopes: gateway.scopes.clone(),
            connect_timeout: gateway.connect_timeout(),
        }
    }
}

struct Reader {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    sink: Option<WsSink>,
    tracker: RunTracker,
    reader: Option<Reader>,
    /// Bumped on every connect so a stale reader cannot tear down its successor.
    generation: u64,
}

impl Inner {
    /// Drop the socket and all run state.
    fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.sink = None;
        self.tracker.clear();
    }
}

pub struct DirectClient {
    settings: DirectSettings,
    identity: DeviceIdentity,
    events: mpsc::Sender<GatewayEvent>,
    inner: Arc<Mutex<Inner>>,
}

impl DirectClient {
    pub fn new(
        settings: DirectSettings,
        identity: DeviceIdentity,
        events: mpsc::Sender<GatewayEvent>,
    ) -> Self {
        Self {
            settings,
            identity,
            events,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Stop the reader and close the socket. Caller holds the lock.
    async fn teardown(inner: &mut Inner) {
        if let Some(reader) = inner.reader.take() {
            reader.cancel.cancel();
            reader.task.abort();
        }
        if let Some(mut sink) = inner.sink.take() {
            let _ = sink.close().await;
        }
        inner.reset();
    }

    /// Dial, answer the challenge and wait for the connect result.
    ///
    /// The caller bounds the whole exchange with one `connect_timeout`.
    async fn handshake(&self, inner: &mut Inner) -> Result<WsSource, GatewayError> {
        inner.state = ConnectionState::Dialing;
        debug!(url = %self.settings.url, "Dialing gateway");
        let (ws, _) = tokio_tungstenite::connect_async(self.settings.url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        inner.state = ConnectionState::AwaitingChallenge;
        let challenge = wait_for_challenge(&mut stream).await?;

        inner.state = ConnectionState::Authenticating;
        let request_id = uuid::Uuid::new_v4().to_string();
        let params = self.connect_params(&challenge.nonce);
        let frame = GatewayFrame::request(&request_id, METHOD_CONNECT, &params)
            .map_err(|e| GatewayError::Protocol(e.to_string()))?;
        send_frame(&mut sink, &frame).await?;

        wait_for_response(&mut stream, &request_id).await?;

        inner.sink = Some(sink);
        inner.state = ConnectionState::Connected;
        Ok(stream)
    }

    fn connect_params(&self, nonce: &str) -> ConnectParams {
        let s = &self.settings;
        let signed_at = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let payload = SigningInput {
            device_id: self.identity.device_id(),
            client_id: &s.client_id,
            client_mode: &s.client_mode,
            role: &s.role,
            scopes: &s.scopes,
            signed_at_ms: signed_at,
            token: &s.token,
            nonce,
        }
        .payload();

        ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: s.client_id.clone(),
                display_name: "moltstream".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                platform: std::env::consts::OS.to_string(),
                mode: s.client_mode.clone(),
            },
            role: s.role.clone(),
            scopes: s.scopes.clone(),
            caps: Vec::new(),
            auth: ConnectAuth {
                token: s.token.clone(),
            },
            device: DeviceProof {
                id: self.identity.device_id().to_string(),
                public_key: self.identity.public_key_base64(),
                signature: self.identity.sign(&payload),
                signed_at,
                nonce: nonce.to_string(),
            },
        }
    }
}

#[async_trait]
impl GatewayTransport for DirectClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn connect(&self) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Connected {
            return Ok(());
        }
        Self::teardown(&mut inner).await;
        inner.generation += 1;

        let handshake = tokio::time::timeout(self.settings.connect_timeout, self.handshake(&mut inner))
            .await
            .unwrap_or(Err(GatewayError::Timeout("gateway handshake")));
        let stream = match handshake {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Gateway connect failed");
                Self::teardown(&mut inner).await;
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(read_loop(
            stream,
            self.inner.clone(),
            self.events.clone(),
            cancel.clone(),
            inner.generation,
        ));
        inner.reader = Some(Reader { cancel, task });
        info!(url = %self.settings.url, "Connected to gateway");
        Ok(())
    }

    async fn send(&self, content: &str) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Connected {
            return Err(GatewayError::NotConnected);
        }
        if inner.tracker.is_busy() {
            return Err(GatewayError::Busy);
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let params = ChatSendParams {
            session_key: self.settings.session_key.clone(),
            message: content.to_string(),
            idempotency_key: uuid::Uuid::new_v4().to_string(),
        };
        let frame = GatewayFrame::request(&request_id, METHOD_CHAT_SEND, &params)
            .map_err(|e| GatewayError::Protocol(e.to_string()))?;

        let Some(sink) = inner.sink.as_mut() else {
            inner.reset();
            return Err(GatewayError::NotConnected);
        };
        if let Err(e) = send_frame(sink, &frame).await {
            warn!(error = %e, "Gateway write failed");
            Self::teardown(&mut inner).await;
            drop(inner);
            let _ = self.events.send(GatewayEvent::Disconnected(e.to_string())).await;
            return Err(e);
        }

        debug!(request_id = %request_id, "chat.send written");
        inner.tracker.begin_send(request_id);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.inner.lock().await.state == ConnectionState::Connected
    }

    async fn reconnect(&self) -> Result<(), GatewayError> {
        {
            let mut inner = self.inner.lock().await;
            Self::teardown(&mut inner).await;
        }
        self.connect().await
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().await;
        Self::teardown(&mut inner).await;
        debug!("Gateway connection closed");
    }
}

async fn send_frame(sink: &mut WsSink, frame: &GatewayFrame) -> Result<(), GatewayError> {
    let text = serde_json::to_string(frame).map_err(|e| GatewayError::Protocol(e.to_string()))?;
    sink.send(Message::text(text)).await?;
    Ok(())
}

/// Next text frame parsed as a [`GatewayFrame`]; undecodable text is skipped.
async fn next_frame(stream: &mut WsSource) -> Result<GatewayFrame, GatewayError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<GatewayFrame>(&text) {
                Ok(frame) => return Ok(frame),
                Err(e) => warn!(error = %e, "Ignoring undecodable gateway frame"),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(GatewayError::Transport("connection closed by gateway".into()));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn wait_for_challenge(stream: &mut WsSource) -> Result<ConnectChallenge, GatewayError> {
    loop {
        if let GatewayFrame::Event { event, payload, .. } = next_frame(stream).await? {
            if event == EVENT_CONNECT_CHALLENGE {
                let payload = payload.unwrap_or_default();
                return serde_json::from_value(payload)
                    .map_err(|e| GatewayError::Protocol(format!("bad connect.challenge: {}", e)));
            }
            trace!(event = %event, "Ignoring event before challenge");
        }
    }
}

async fn wait_for_response(stream: &mut WsSource, request_id: &str) -> Result<(), GatewayError> {
    loop {
        if let GatewayFrame::Response { id, ok, error, .. } = next_frame(stream).await? {
            if id != request_id {
                continue;
            }
            if ok {
                return Ok(());
            }
            let message = error
                .map(|e| e.describe())
                .unwrap_or_else(|| "connect rejected".to_string());
            return Err(GatewayError::Rejected(message));
        }
    }
}

async fn read_loop(
    mut stream: WsSource,
    inner: Arc<Mutex<Inner>>,
    events: mpsc::Sender<GatewayEvent>,
    cancel: CancellationToken,
    generation: u64,
) {
    let reason = loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = stream.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                let outgoing = handle_text(&inner, &text).await;
                for event in outgoing {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| format!("gateway closed the connection: {}", f.reason.as_str()))
                    .unwrap_or_else(|| "gateway closed the connection".to_string());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("gateway read failed: {}", e),
            None => break "gateway connection ended".to_string(),
        }
    };

    {
        let mut guard = inner.lock().await;
        if guard.generation != generation || cancel.is_cancelled() {
            return;
        }
        guard.reader = None;
        guard.reset();
    }
    warn!(reason = %reason, "Gateway disconnected");
    let _ = events.send(GatewayEvent::Disconnected(reason)).await;
}

/// Apply one inbound frame to the run state; returns the events to emit.
async fn handle_text(inner: &Mutex<Inner>, text: &str) -> Vec<GatewayEvent> {
    let frame = match serde_json::from_str::<GatewayFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Ignoring undecodable gateway frame");
            return Vec::new();
        }
    };

    match frame {
        GatewayFrame::Response {
            id,
            ok,
            payload,
            error,
        } => {
            let mut guard = inner.lock().await;
            if !guard.tracker.is_pending_send(&id) {
                trace!(id = %id, "Ignoring response for unknown request");
                return Vec::new();
            }
            if !ok {
                guard.tracker.clear();
                let message = error
                    .map(|e| e.describe())
                    .unwrap_or_else(|| "chat.send rejected".to_string());
                return vec![GatewayEvent::RunFailed {
                    kind: RunFailure::Rejected,
                    message,
                }];
            }
            let run_id = payload
                .and_then(|p| serde_json::from_value::<ChatSendAck>(p).ok())
                .and_then(|ack| ack.run_id);
            match run_id {
                Some(run_id) => {
                    debug!(run_id = %run_id, "Run started");
                    guard.tracker.acknowledge(run_id);
                    Vec::new()
                }
                None => {
                    guard.tracker.clear();
                    vec![GatewayEvent::RunFailed {
                        kind: RunFailure::Rejected,
                        message: "chat.send acknowledged without a runId".to_string(),
                    }]
                }
            }
        }
        GatewayFrame::Event { event, payload, .. } if event == EVENT_CHAT => {
            let Some(chat) = payload.and_then(|p| serde_json::from_value::<ChatEvent>(p).ok())
            else {
                warn!("Ignoring malformed chat event");
                return Vec::new();
            };
            let mut guard = inner.lock().await;
            match guard.tracker.apply(&chat) {
                Ok(Some(delivery)) => vec![GatewayEvent::Message {
                    delta: delivery.delta,
                    done: delivery.done,
                }],
                Ok(None) => {
                    trace!(run_id = %chat.run_id, "Ignoring chat event outside the active run");
                    Vec::new()
                }
                Err(violation) => vec![GatewayEvent::RunFailed {
                    kind: RunFailure::ProtocolViolation,
                    message: violation.to_string(),
                }],
            }
        }
        GatewayFrame::Event { event, .. } => {
            trace!(event = %event, "Ignoring gateway event");
            Vec::new()
        }
        GatewayFrame::Request { method, .. } => {
            trace!(method = %method, "Ignoring gateway request");
            Vec::new()
        }
    }
}
