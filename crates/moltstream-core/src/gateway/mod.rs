//! Gateway client.
//!
//! One outbound connection to the OpenClaw gateway, behind the
//! [`GatewayTransport`] trait. Two transports exist and are picked at
//! construction time:
//!
//! - [`DirectClient`]: authenticated WebSocket with the signed
//!   `connect.challenge` handshake and run tracking.
//! - [`CliRelay`]: runs the gateway's command-line tool once per message and
//!   streams its stdout.
//!
//! Inbound traffic reaches the bridge as [`GatewayEvent`]s on a bounded
//! channel, in the order the gateway produced it.

pub mod client;
pub mod frames;
pub mod identity;
pub mod relay;
pub mod run;

pub use client::{DirectClient, DirectSettings};
pub use identity::DeviceIdentity;
pub use relay::CliRelay;
pub use run::{Delivery, RunTracker};

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{Config, TransportKind};

/// Capacity of the gateway → bridge event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("not connected to gateway")]
    NotConnected,
    #[error("a reply is still streaming")]
    Busy,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("gateway rejected connect: {0}")]
    Rejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("relay error: {0}")]
    Relay(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

/// Why a run ended without a terminal chat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunFailure {
    /// The gateway refused the `chat.send`.
    Rejected,
    /// The run broke the cumulative-content invariant.
    ProtocolViolation,
}

/// Inbound traffic from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// New reply text; `done` marks the end of the run.
    Message { delta: String, done: bool },
    /// Something went wrong that does not end the current run.
    Error(String),
    /// The current run ended abnormally.
    RunFailed { kind: RunFailure, message: String },
    /// The connection dropped. Any run in flight is gone.
    Disconnected(String),
}

/// Connection lifecycle of the direct transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Dialing,
    AwaitingChallenge,
    Authenticating,
    Connected,
}

/// The contract both transports satisfy.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Establish the connection. Blocks until connected or failed.
    async fn connect(&self) -> Result<(), GatewayError>;

    /// Start a chat exchange. Returns once the message is written; the reply
    /// arrives as [`GatewayEvent`]s.
    async fn send(&self, content: &str) -> Result<(), GatewayError>;

    async fn is_connected(&self) -> bool;

    /// Drop any existing connection and connect again.
    async fn reconnect(&self) -> Result<(), GatewayError>;

    async fn close(&self);
}

/// Build the transport selected by `config.gateway.transport`.
///
/// The direct transport needs the device identity; it is loaded by the
/// caller once at startup and handed over here.
pub fn build_transport(
    config: &Config,
    identity: Option<DeviceIdentity>,
    events: mpsc::Sender<GatewayEvent>,
) -> Result<Arc<dyn GatewayTransport>> {
    match config.gateway.transport {
        TransportKind::Direct => {
            let identity = identity.context("direct transport requires a device identity")?;
            let settings = DirectSettings::from_config(&config.gateway);
            Ok(Arc::new(DirectClient::new(settings, identity, events)))
        }
        TransportKind::Cli => Ok(Arc::new(CliRelay::new(
            config.gateway.cli_command.clone(),
            config.gateway.session_key.clone(),
            events,
        ))),
    }
}
