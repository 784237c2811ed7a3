//! The stdio bridge.
//!
//! Reads one JSON-RPC request per line from the editor, dispatches it, and
//! writes responses and notifications back one per line. Gateway traffic
//! arrives on the event channel and is turned into notifications by a pump
//! task; a `send` request stays unanswered until its run completes.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::gateway::{GatewayError, GatewayEvent, GatewayTransport, RunFailure};
use crate::protocol::{
    ErrorCode, Notification, Request, RequestId, Response, SendParams, StatusResult,
};
use crate::session::SessionManager;

/// Serialized writer shared by the dispatch loop and the event pump.
struct Output<W> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> Output<W> {
    async fn write<T: Serialize>(&self, message: &T) -> Result<()> {
        let mut line = serde_json::to_vec(message).context("Failed to encode message")?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await.context("Failed to write to stdout")?;
        writer.flush().await.context("Failed to flush stdout")?;
        Ok(())
    }
}

pub struct Bridge<W> {
    transport: Arc<dyn GatewayTransport>,
    session: SessionManager,
    gateway: String,
    output: Arc<Output<W>>,
    /// Id of the `send` request waiting for its run to finish.
    pending: Arc<Mutex<Option<RequestId>>>,
}

impl<W> Clone for Bridge<W> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            session: self.session.clone(),
            gateway: self.gateway.clone(),
            output: self.output.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> Bridge<W> {
    /// `gateway` is the address reported in `status` and `connected`.
    pub fn new(
        transport: Arc<dyn GatewayTransport>,
        session: SessionManager,
        gateway: impl Into<String>,
        writer: W,
    ) -> Self {
        Self {
            transport,
            session,
            gateway: gateway.into(),
            output: Arc::new(Output {
                writer: Mutex::new(writer),
            }),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Initial connect. A failure is reported to the editor, not returned.
    pub async fn connect(&self) -> Result<()> {
        match self.transport.connect().await {
            Ok(()) => {
                info!(gateway = %self.gateway, "Bridge connected");
                self.output.write(&Notification::connected(&self.gateway)).await
            }
            Err(e) => {
                warn!(error = %e, "Initial gateway connect failed");
                self.output
                    .write(&Notification::error(format!("connect failed: {}", e)))
                    .await
            }
        }
    }

    /// Forward gateway events to the editor until the channel closes.
    pub fn spawn_event_pump(&self, mut events: mpsc::Receiver<GatewayEvent>) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = bridge.handle_event(event).await {
                    warn!(error = %e, "Event pump stopped");
                    break;
                }
            }
            debug!("Event pump finished");
        })
    }

    /// Serve requests from `input` until EOF.
    pub async fn run<R: AsyncBufRead + Unpin>(&self, input: R) -> Result<()> {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.handle_line(line).await?;
        }
        debug!("stdin closed");
        Ok(())
    }

    async fn handle_line(&self, line: &str) -> Result<()> {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Unparseable request line");
                return self
                    .output
                    .write(&Response::error(None, ErrorCode::ParseError, "parse error"))
                    .await;
            }
        };

        let id = request.id;
        let outcome = match request.method.as_str() {
            "send" => self.handle_send(id, request.params).await,
            "status" => Some(self.handle_status().await),
            "reconnect" => Some(self.handle_reconnect().await),
            "archive" => Some(self.handle_archive()),
            "session_path" => Some(self.handle_session_path()),
            other => {
                debug!(method = %other, "Unknown method");
                Some(Err((ErrorCode::MethodNotFound, "method not found".to_string())))
            }
        };

        let (Some(id), Some(outcome)) = (id, outcome) else {
            return Ok(());
        };
        let response = match outcome {
            Ok(result) => Response::result(Some(id), result),
            Err((code, message)) => Response::error(Some(id), code, message),
        };
        self.output.write(&response).await
    }

    /// `None` means no response is written here: either it is deferred until
    /// the run completes or the event pump already sent it.
    async fn handle_send(
        &self,
        id: Option<RequestId>,
        params: Option<Value>,
    ) -> Option<Outcome> {
        let params = match params.map(serde_json::from_value::<SendParams>).transpose() {
            Ok(Some(params)) if !params.content.is_empty() => params,
            Ok(_) => return Some(Err((ErrorCode::InvalidParams, "content is required".into()))),
            Err(e) => return Some(Err((ErrorCode::InvalidParams, format!("invalid params: {}", e)))),
        };

        if !self.transport.is_connected().await {
            return Some(Err((ErrorCode::NotConnected, GatewayError::NotConnected.to_string())));
        }

        {
            let mut pending = self.pending.lock().await;
            if pending.is_some() {
                return Some(Err((ErrorCode::GatewayError, GatewayError::Busy.to_string())));
            }
            *pending = id;
        }

        match self.transport.send(&params.content).await {
            Ok(()) => {
                debug!(?id, bytes = params.content.len(), "Message forwarded");
                None
            }
            Err(e) => {
                // The pump may already have answered `id` from a Disconnected event.
                let still_ours = {
                    let mut pending = self.pending.lock().await;
                    if *pending == id {
                        *pending = None;
                        true
                    } else {
                        false
                    }
                };
                still_ours.then(|| Err((send_error_code(&e), e.to_string())))
            }
        }
    }

    async fn handle_status(&self) -> Outcome {
        let status = StatusResult {
            connected: self.transport.is_connected().await,
            gateway: self.gateway.clone(),
            transport: self.transport.kind().as_str().to_string(),
        };
        serde_json::to_value(status).map_err(|e| (ErrorCode::Internal, e.to_string()))
    }

    async fn handle_reconnect(&self) -> Outcome {
        // Reconnecting drops any run in flight without a terminal event.
        self.resolve_pending(ErrorCode::GatewayError, "connection reset by reconnect".to_string())
            .await
            .map_err(|e| (ErrorCode::Internal, e.to_string()))?;

        match self.transport.reconnect().await {
            Ok(()) => {
                self.output
                    .write(&Notification::connected(&self.gateway))
                    .await
                    .map_err(|e| (ErrorCode::Internal, e.to_string()))?;
                Ok(json!({"status": "reconnected"}))
            }
            Err(e) => Err((ErrorCode::GatewayError, e.to_string())),
        }
    }

    fn handle_archive(&self) -> Outcome {
        self.session
            .archive()
            .and_then(|_| self.session.ensure_session())
            .map(|path| json!({"status": "archived", "path": path}))
            .map_err(|e| (ErrorCode::Internal, format!("{:#}", e)))
    }

    fn handle_session_path(&self) -> Outcome {
        self.session
            .ensure_session()
            .map(|path| json!({"path": path}))
            .map_err(|e| (ErrorCode::Internal, format!("{:#}", e)))
    }

    async fn handle_event(&self, event: GatewayEvent) -> Result<()> {
        match event {
            GatewayEvent::Message { delta, done } => {
                self.output.write(&Notification::stream(delta, done)).await?;
                let finished = if done { self.pending.lock().await.take() } else { None };
                if let Some(id) = finished {
                    self.output
                        .write(&Response::result(Some(id), json!({"status": "ok"})))
                        .await?;
                }
            }
            GatewayEvent::Error(message) => {
                self.output.write(&Notification::error(message)).await?;
            }
            GatewayEvent::RunFailed { kind, message } => {
                self.output.write(&Notification::error(message.clone())).await?;
                let code = match kind {
                    RunFailure::Rejected => ErrorCode::GatewayError,
                    RunFailure::ProtocolViolation => ErrorCode::Internal,
                };
                self.resolve_pending(code, message).await?;
            }
            GatewayEvent::Disconnected(reason) => {
                self.output.write(&Notification::error(reason.clone())).await?;
                self.resolve_pending(ErrorCode::GatewayError, reason).await?;
            }
        }
        Ok(())
    }

    async fn resolve_pending(&self, code: ErrorCode, message: String) -> Result<()> {
        let Some(id) = self.pending.lock().await.take() else {
            return Ok(());
        };
        self.output.write(&Response::error(Some(id), code, message)).await
    }
}

type Outcome = std::result::Result<Value, (ErrorCode, String)>;

fn send_error_code(err: &GatewayError) -> ErrorCode {
    match err {
        GatewayError::NotConnected => ErrorCode::NotConnected,
        _ => ErrorCode::GatewayError,
    }
}
