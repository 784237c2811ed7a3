//! Structured logging configuration for moltstream.
//!
//! Uses `tracing` with `tracing-subscriber`. Every layer writes to **stderr**:
//! stdout belongs to the editor protocol and must only ever carry JSON lines.
//!
//! ## Environment Variables
//!
//! - `MOLTSTREAM_LOG` or `RUST_LOG`: log filter (e.g. `debug`, `moltstream=debug,tungstenite=warn`)
//! - `MOLTSTREAM_LOG_FORMAT`: output format (`pretty`, `compact`, `json`)
//!
//! ```bash
//! MOLTSTREAM_LOG=moltstream=debug nvim
//! ```

use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

const DEFAULT_FILTER: &str = "moltstream=info,moltstream_core=info,warn";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, multi-line
    Pretty,
    /// Single line per event
    #[default]
    Compact,
    /// JSON objects, one per line
    Json,
}

impl LogFormat {
    /// Parse from string (case-insensitive). Unknown values fall back to compact.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            _ => Self::Compact,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive, `EnvFilter` syntax
    pub filter: String,
    pub format: LogFormat,
    /// Emit span open/close events
    pub with_spans: bool,
    /// Include file/line
    pub with_file: bool,
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::Compact,
            with_spans: false,
            with_file: false,
            with_target: true,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let filter = std::env::var("MOLTSTREAM_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_FILTER.to_string());

        let format = std::env::var("MOLTSTREAM_LOG_FORMAT")
            .map(|s| LogFormat::parse(&s))
            .unwrap_or_default();

        Self {
            filter,
            format,
            ..Default::default()
        }
    }

    /// Raise verbosity to debug for moltstream's own targets.
    pub fn verbose(mut self) -> Self {
        self.filter = "moltstream=debug,moltstream_core=debug,info".to_string();
        self.with_file = true;
        self
    }
}

/// Initialize the global tracing subscriber.
///
/// Only the first call installs a subscriber; later calls are ignored.
pub fn init(config: LogConfig) {
    let env_filter =
        EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let span_events = if config.with_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_span_events(span_events)
        .with_file(config.with_file)
        .with_line_number(config.with_file)
        .with_target(config.with_target);

    match config.format {
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(layer.json());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        LogFormat::Compact => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(layer.compact());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(layer.pretty());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }
}
