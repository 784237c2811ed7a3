use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which gateway transport the bridge drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Authenticated WebSocket connection to the gateway.
    #[default]
    Direct,
    /// Run the gateway's command-line tool once per message.
    Cli,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Direct => "direct",
            TransportKind::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// WebSocket URL of the gateway (ws:// or wss://)
    pub url: String,
    /// Bearer token; `${VAR}` references are expanded at load time
    pub token: String,
    pub transport: TransportKind,
    /// Gateway session the conversation is posted to
    pub session_key: String,
    pub connect_timeout_secs: u64,
    /// Device identity file (deviceId + Ed25519 PEM keys)
    pub identity_path: PathBuf,
    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    /// Executable used by the `cli` transport
    pub cli_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub directory: PathBuf,
    /// Rotate the session log once it grows past this many bytes
    pub max_size_bytes: u64,
    pub auto_archive: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".to_string(),
            token: "${OPENCLAW_TOKEN}".to_string(),
            transport: TransportKind::Direct,
            session_key: "main".to_string(),
            connect_timeout_secs: 10,
            identity_path: PathBuf::from("~/.openclaw/identity/device.json"),
            client_id: "gateway-client".to_string(),
            client_mode: "backend".to_string(),
            role: "operator".to_string(),
            scopes: vec!["operator.read".to_string(), "operator.write".to_string()],
            cli_command: "openclaw".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("~/.local/share/moltstream"),
            max_size_bytes: 1024 * 1024 * 1024,
            auto_archive: true,
        }
    }
}

impl GatewayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

impl Config {
    /// Default config location: `~/.config/moltstream/config.yaml`.
    pub fn default_path() -> PathBuf {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home_dir.join(".config").join("moltstream").join("config.yaml")
    }

    /// Load configuration from file. A missing file yields the defaults.
    ///
    /// `~` and `${VAR}` are expanded in the token and in every path.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = path.unwrap_or_else(Self::default_path);

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config from {:?}", config_path))?;
            Self::from_yaml(&content)
                .with_context(|| format!("Failed to parse config from {:?}", config_path))?
        } else {
            Config::default()
        };

        config.expand()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Expand `~` in paths and `${VAR}` in the token.
    ///
    /// An unset variable in the token expands to the empty string, which
    /// [`Config::validate`] then rejects for the direct transport.
    pub fn expand(&mut self) -> Result<()> {
        self.gateway.token = shellexpand::env_with_context_no_errors(&self.gateway.token, |var| {
            std::env::var(var).ok().or(Some(String::new()))
        })
        .into_owned();
        self.gateway.identity_path = expand_path(&self.gateway.identity_path)?;
        self.session.directory = expand_path(&self.session.directory)?;
        Ok(())
    }

    /// Check that the configuration can drive the selected transport.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.transport == TransportKind::Direct {
            let url = url::Url::parse(&self.gateway.url)
                .with_context(|| format!("Invalid gateway URL {}", self.gateway.url))?;
            if url.scheme() != "ws" && url.scheme() != "wss" {
                bail!("Gateway URL must use ws:// or wss://, got {}", self.gateway.url);
            }
            if self.gateway.token.trim().is_empty() {
                bail!("Gateway token is empty (set OPENCLAW_TOKEN or gateway.token)");
            }
        }
        if self.gateway.session_key.trim().is_empty() {
            bail!("gateway.session_key must not be empty");
        }
        Ok(())
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("Failed to expand path {}", raw))?;
    Ok(PathBuf::from(expanded.into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.gateway.transport, TransportKind::Direct);
        assert_eq!(config.gateway.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.max_size_bytes, 1_073_741_824);
        assert!(config.session.auto_archive);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = Config::from_yaml(
            "gateway:\n  url: wss://gw.example:443/ws\n  transport: cli\nsession:\n  auto_archive: false\n",
        )
        .unwrap();
        assert_eq!(config.gateway.url, "wss://gw.example:443/ws");
        assert_eq!(config.gateway.transport, TransportKind::Cli);
        assert_eq!(config.gateway.session_key, "main");
        assert!(!config.session.auto_archive);
        assert_eq!(config.session.max_size_bytes, 1_073_741_824);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load(Some(tmp.path().join("nope.yaml"))).unwrap();
        assert_eq!(config.gateway.client_id, "gateway-client");
    }

    #[test]
    fn tilde_is_expanded_in_paths() {
        let mut config = Config::default();
        config.gateway.token = "literal".into();
        config.expand().unwrap();
        assert!(!config.session.directory.to_string_lossy().starts_with('~'));
        assert!(!config.gateway.identity_path.to_string_lossy().starts_with('~'));
        assert_eq!(config.gateway.token, "literal");
    }

    #[test]
    fn validate_rejects_empty_token_for_direct() {
        let mut config = Config::default();
        config.gateway.token = String::new();
        assert!(config.validate().is_err());

        config.gateway.transport = TransportKind::Cli;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_http_url() {
        let mut config = Config::default();
        config.gateway.token = "t".into();
        config.gateway.url = "http://127.0.0.1:18789".into();
        assert!(config.validate().is_err());
    }
}
