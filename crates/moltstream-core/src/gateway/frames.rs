//! Gateway wire frames.
//!
//! JSON text frames over WebSocket with three envelope types: `req`
//! (client → gateway), `res` (reply to a `req`, same `id`), and `event`
//! (gateway push). The gateway's framing is authoritative; only the fields
//! the bridge reads or writes are modelled, everything else is ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version requested in the connect handshake.
pub const PROTOCOL_VERSION: u32 = 3;

pub const EVENT_CONNECT_CHALLENGE: &str = "connect.challenge";
pub const EVENT_CHAT: &str = "chat";

pub const METHOD_CONNECT: &str = "connect";
pub const METHOD_CHAT_SEND: &str = "chat.send";

/// Top-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    #[serde(rename = "req")]
    Request {
        id: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },

    #[serde(rename = "res")]
    Response {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },

    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl GatewayFrame {
    pub fn request<P: Serialize>(id: &str, method: &str, params: &P) -> serde_json::Result<Self> {
        Ok(GatewayFrame::Request {
            id: id.to_string(),
            method: method.to_string(),
            params: Some(serde_json::to_value(params)?),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl ErrorShape {
    /// Human-readable rendering, `CODE: message` when a code is present.
    pub fn describe(&self) -> String {
        match &self.code {
            Some(code) if !self.message.is_empty() => format!("{}: {}", code, self.message),
            Some(code) => code.clone(),
            None if self.message.is_empty() => "gateway error".to_string(),
            None => self.message.clone(),
        }
    }
}

/// Payload of the `connect.challenge` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectChallenge {
    pub nonce: String,
    #[serde(default)]
    pub ts: Option<u64>,
}

// ── connect ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    pub auth: ConnectAuth,
    pub device: DeviceProof,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAuth {
    pub token: String,
}

/// Signed device block; proves possession of the device key for this nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProof {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: u64,
    pub nonce: String,
}

// ── chat ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendParams {
    pub session_key: String,
    pub message: String,
    pub idempotency_key: String,
}

/// `res` payload acknowledging a `chat.send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendAck {
    pub run_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Lifecycle state reported on a chat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    Delta,
    Final,
    Error,
    Aborted,
    #[serde(other)]
    Unknown,
}

impl ChatState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChatState::Final | ChatState::Error | ChatState::Aborted)
    }
}

/// Payload of a `chat` event. `message` carries the run's cumulative reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub run_id: String,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub seq: Option<u64>,
    pub state: ChatState,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ChatEvent {
    /// Concatenated text of the cumulative message, if any.
    ///
    /// Accepts a bare string, `{content: "…"}`, or `{content: [{type:"text", text:"…"}, …]}`;
    /// non-text blocks are skipped.
    pub fn text(&self) -> Option<String> {
        let message = self.message.as_ref()?;
        if let Some(s) = message.as_str() {
            return Some(s.to_string());
        }
        let content = message.get("content").or_else(|| message.get("text"))?;
        if let Some(s) = content.as_str() {
            return Some(s.to_string());
        }
        let blocks = content.as_array()?;
        let text = blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str).unwrap_or("text") == "text")
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<String>();
        Some(text)
    }
}
