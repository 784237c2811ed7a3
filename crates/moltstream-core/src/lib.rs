// ── moltstream Core Library ──────────────────────────────────────────────────
//
// Everything the `moltstream` binary needs: configuration, logging, the
// local JSON-RPC wire types, the session log, the gateway transports, and
// the stdio bridge tying them together.

pub mod args;
pub mod bridge;
pub mod config;
pub mod gateway;
pub mod logging;
pub mod protocol;
pub mod session;

pub use bridge::Bridge;
pub use config::{Config, TransportKind};
pub use session::SessionManager;
