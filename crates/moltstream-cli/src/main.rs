use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use moltstream_core::args::CommonArgs;
use moltstream_core::config::{Config, TransportKind};
use moltstream_core::gateway::{self, DeviceIdentity, EVENT_CHANNEL_CAPACITY};
use moltstream_core::logging::{self, LogConfig};
use moltstream_core::{Bridge, SessionManager};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// ── CLI ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "moltstream",
    version,
    about = "Stream an OpenClaw gateway conversation to an editor over stdio"
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the JSON-RPC bridge on stdin/stdout (default)
    Serve,
    /// Inspect or rotate the session log
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Debug, Subcommand)]
enum SessionAction {
    /// Ensure the session log exists and print its path
    Path,
    /// Move the session log into the archive and start a fresh one
    Archive,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env();
    if cli.common.verbose {
        log_config = log_config.verbose();
    }
    logging::init(log_config);

    let mut config = Config::load(cli.common.config_path())?;
    cli.common.apply_overrides(&mut config);

    let session = SessionManager::new(
        &config.session.directory,
        config.session.max_size_bytes,
        config.session.auto_archive,
    )?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config, session).await,
        Commands::Session { action } => {
            match action {
                SessionAction::Path => {
                    println!("{}", session.ensure_session()?.display());
                }
                SessionAction::Archive => {
                    match session.archive()? {
                        Some(path) => println!("{}", path.display()),
                        None => println!("{}", session.archive_dir().display()),
                    }
                    session.ensure_session()?;
                }
            }
            Ok(())
        }
    }
}

async fn serve(config: Config, session: SessionManager) -> Result<()> {
    config.validate()?;

    let identity = match config.gateway.transport {
        TransportKind::Direct => Some(
            DeviceIdentity::load(&config.gateway.identity_path)
                .context("Direct transport needs a device identity")?,
        ),
        TransportKind::Cli => None,
    };

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let transport = gateway::build_transport(&config, identity, events_tx)?;
    let bridge = Bridge::new(
        transport.clone(),
        session,
        config.gateway.url.clone(),
        tokio::io::stdout(),
    );
    let pump = bridge.spawn_event_pump(events_rx);

    info!(
        gateway = %config.gateway.url,
        transport = config.gateway.transport.as_str(),
        "moltstream starting"
    );

    // Set up graceful shutdown on Ctrl+C (all platforms).
    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_for_signal.cancel();
    });

    #[cfg(unix)]
    {
        let cancel_for_term = cancel.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            if let Ok(mut sig) = signal(SignalKind::terminate()) {
                sig.recv().await;
                cancel_for_term.cancel();
            }
        });
    }

    let result = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Shutdown signal received");
            Ok(())
        }
        result = async {
            bridge.connect().await?;
            bridge.run(BufReader::new(tokio::io::stdin())).await
        } => result,
    };

    transport.close().await;
    pump.abort();
    info!("moltstream stopped");

    // A pending blocking read on stdin would keep the runtime from shutting down.
    if cancel.is_cancelled() && result.is_ok() {
        std::process::exit(0);
    }
    result
}
