use crate::config::{Config, TransportKind};
use clap::{ArgAction, Args};
use std::path::{Path, PathBuf};

// Global flags shared across every subcommand.
//
//   -c / --config      Path to a config.yaml file
//   --gateway          Gateway WebSocket URL
//   --transport        direct | cli
//   --session-dir      Directory holding session.md and archive/
//   --identity         Device identity file
//   -v / --verbose     Debug logging on stderr
#[derive(Debug, Clone, Default, Args)]
pub struct CommonArgs {
    /// Path to a config.yaml file
    #[arg(
        short = 'c',
        long,
        value_name = "PATH",
        env = "MOLTSTREAM_CONFIG",
        global = true
    )]
    pub config: Option<PathBuf>,

    /// Gateway WebSocket URL (ws://…)
    #[arg(
        long = "gateway",
        value_name = "WS_URL",
        env = "MOLTSTREAM_GATEWAY",
        global = true
    )]
    pub gateway: Option<String>,

    /// Gateway transport
    #[arg(long, value_enum, env = "MOLTSTREAM_TRANSPORT", global = true)]
    pub transport: Option<TransportKind>,

    /// Session directory (default: ~/.local/share/moltstream)
    #[arg(
        long,
        value_name = "DIR",
        env = "MOLTSTREAM_SESSION_DIR",
        global = true
    )]
    pub session_dir: Option<PathBuf>,

    /// Device identity file (default: ~/.openclaw/identity/device.json)
    #[arg(long, value_name = "PATH", env = "MOLTSTREAM_IDENTITY", global = true)]
    pub identity: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, action = ArgAction::SetTrue, global = true)]
    pub verbose: bool,
}

impl CommonArgs {
    pub fn config_path(&self) -> Option<PathBuf> {
        self.config.clone()
    }

    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(gateway) = &self.gateway {
            config.gateway.url = gateway.clone();
        }

        if let Some(transport) = self.transport {
            config.gateway.transport = transport;
        }

        if let Some(dir) = &self.session_dir {
            config.session.directory = tilde(dir);
        }

        if let Some(identity) = &self.identity {
            config.gateway.identity_path = tilde(identity);
        }
    }
}

fn tilde(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_file_values() {
        let mut config = Config::default();
        let args = CommonArgs {
            gateway: Some("ws://10.0.0.2:18789".into()),
            transport: Some(TransportKind::Cli),
            session_dir: Some(PathBuf::from("/tmp/molt")),
            ..Default::default()
        };
        args.apply_overrides(&mut config);

        assert_eq!(config.gateway.url, "ws://10.0.0.2:18789");
        assert_eq!(config.gateway.transport, TransportKind::Cli);
        assert_eq!(config.session.directory, PathBuf::from("/tmp/molt"));
        assert_eq!(config.gateway.session_key, "main");
    }

    #[test]
    fn absent_flags_leave_config_untouched() {
        let mut config = Config::default();
        let before = config.gateway.url.clone();
        CommonArgs::default().apply_overrides(&mut config);
        assert_eq!(config.gateway.url, before);
        assert_eq!(config.gateway.transport, TransportKind::Direct);
    }
}
