//! Subprocess relay transport.
//!
//! Runs `<command> agent --session-id <key> --message <content>` once per
//! send and streams the child's stdout back as reply text, one line per
//! delta. There is no persistent connection: "connected" means the command
//! resolved on `PATH`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{GatewayError, GatewayEvent, GatewayTransport};
use crate::config::TransportKind;

#[derive(Default)]
struct RelayState {
    program: Option<PathBuf>,
    running: Option<CancellationToken>,
}

pub struct CliRelay {
    command: String,
    session_key: String,
    events: mpsc::Sender<GatewayEvent>,
    state: Arc<Mutex<RelayState>>,
}

impl CliRelay {
    pub fn new(command: String, session_key: String, events: mpsc::Sender<GatewayEvent>) -> Self {
        Self {
            command,
            session_key,
            events,
            state: Arc::new(Mutex::new(RelayState::default())),
        }
    }

    fn build_command(&self, program: &Path, content: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.arg("agent")
            .arg("--session-id")
            .arg(&self.session_key)
            .arg("--message")
            .arg(content)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl GatewayTransport for CliRelay {
    fn kind(&self) -> TransportKind {
        TransportKind::Cli
    }

    async fn connect(&self) -> Result<(), GatewayError> {
        let program = which::which(&self.command).map_err(|e| {
            GatewayError::Relay(format!("cannot find `{}` on PATH: {}", self.command, e))
        })?;
        info!(program = %program.display(), "Relay command resolved");
        self.state.lock().await.program = Some(program);
        Ok(())
    }

    async fn send(&self, content: &str) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        let Some(program) = state.program.clone() else {
            return Err(GatewayError::NotConnected);
        };
        if state.running.is_some() {
            return Err(GatewayError::Busy);
        }

        let mut child = self
            .build_command(&program, content)
            .spawn()
            .map_err(|e| GatewayError::Relay(format!("failed to start {}: {}", program.display(), e)))?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(GatewayError::Relay("child pipes unavailable".to_string()));
        };
        debug!(pid = ?child.id(), "Relay run started");

        let cancel = CancellationToken::new();
        state.running = Some(cancel.clone());
        drop(state);

        let events = self.events.clone();
        let shared = self.state.clone();
        tokio::spawn(async move {
            let mut out = BufReader::new(stdout).lines();
            let mut err = BufReader::new(stderr).lines();
            let mut out_open = true;
            let mut err_open = true;

            while out_open || err_open {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = child.kill().await;
                        return;
                    }
                    line = out.next_line(), if out_open => match line {
                        Ok(Some(line)) => {
                            let event = GatewayEvent::Message { delta: format!("{}\n", line), done: false };
                            if events.send(event).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => out_open = false,
                        Err(e) => {
                            warn!(error = %e, "Relay stdout read failed");
                            out_open = false;
                        }
                    },
                    line = err.next_line(), if err_open => match line {
                        Ok(Some(line)) if !line.trim().is_empty() => {
                            let _ = events.send(GatewayEvent::Error(line)).await;
                        }
                        Ok(Some(_)) => {}
                        Ok(None) | Err(_) => err_open = false,
                    },
                }
            }

            let status = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return;
                }
                status = child.wait() => status,
            };
            match status {
                Ok(status) if status.success() => debug!("Relay run finished"),
                Ok(status) => {
                    let _ = events
                        .send(GatewayEvent::Error(format!("relay command failed: {}", status)))
                        .await;
                }
                Err(e) => {
                    let _ = events
                        .send(GatewayEvent::Error(format!("relay command failed: {}", e)))
                        .await;
                }
            }

            shared.lock().await.running = None;
            let _ = events
                .send(GatewayEvent::Message {
                    delta: String::new(),
                    done: true,
                })
                .await;
        });

        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().await.program.is_some()
    }

    async fn reconnect(&self) -> Result<(), GatewayError> {
        self.close().await;
        self.connect().await
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(cancel) = state.running.take() {
            debug!("Killing running relay command");
            cancel.cancel();
        }
        state.program = None;
    }
}
