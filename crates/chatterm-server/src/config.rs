//! Server configuration: TOML file + CLI overrides.

use chatterm_core::{TermError, TermResult};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub approval: ApprovalSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default)]
    pub workspace_root: Option<String>,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            workspace_root: None,
            allowed_origins: Vec::new(),
            cert: None,
            key: None,
        }
    }
}

/// `[sessions]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    /// Seconds a detached session may live; 0 keeps it forever.
    #[serde(default)]
    pub idle_timeout: u64,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_buffer_size: default_max_buffer_size(),
            idle_timeout: 0,
        }
    }
}

/// `[approval]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalSection {
    /// Seconds before a pending approval is interrupted; 0 never expires.
    #[serde(default = "default_approval_timeout")]
    pub timeout: u64,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            timeout: default_approval_timeout(),
        }
    }
}

fn default_port() -> u16 {
    4100
}
fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
fn default_max_sessions() -> usize {
    100
}
fn default_max_buffer_size() -> usize {
    crate::session::MAX_BUFFER_SIZE
}
fn default_approval_timeout() -> u64 {
    chatterm_approval::DEFAULT_APPROVAL_TIMEOUT.as_secs()
}

/// Values given on the command line; `None` falls back to the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub bind: Option<IpAddr>,
    pub workspace_root: Option<String>,
    pub allowed_origins: Option<Vec<String>>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub max_sessions: Option<usize>,
    pub max_buffer_size: Option<usize>,
    pub idle_timeout: Option<u64>,
    pub approval_timeout: Option<u64>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Absolute directory every terminal must stay inside.
    pub workspace_root: PathBuf,
    pub allowed_origins: Vec<String>,
    /// PEM certificate and key; both set means the listener speaks TLS.
    pub tls: Option<(PathBuf, PathBuf)>,
    pub max_sessions: usize,
    pub max_buffer_size: usize,
    /// `None` disables idle reaping.
    pub idle_timeout: Option<Duration>,
    pub approval_timeout: Duration,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> TermResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli)
    }

    /// Merge CLI overrides over a parsed file.
    pub fn resolve(file: ConfigFile, cli: CliOverrides) -> TermResult<Self> {
        let port = cli.port.unwrap_or(file.server.port);
        let bind = cli.bind.unwrap_or(file.server.bind);

        let workspace_root = match cli.workspace_root.or(file.server.workspace_root) {
            Some(root) => expand_tilde_str(&root),
            None => std::env::current_dir()?,
        };
        let workspace_root = if workspace_root.is_absolute() {
            workspace_root
        } else {
            std::env::current_dir()?.join(workspace_root)
        };

        let allowed_origins: Vec<String> = cli
            .allowed_origins
            .unwrap_or(file.server.allowed_origins)
            .into_iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();

        let tls = match (cli.cert.or(file.server.cert), cli.key.or(file.server.key)) {
            (Some(cert), Some(key)) => Some((expand_tilde_str(&cert), expand_tilde_str(&key))),
            (None, None) => None,
            _ => {
                return Err(TermError::Config(
                    "TLS needs both a certificate and a key".into(),
                ))
            }
        };

        let max_sessions = cli.max_sessions.unwrap_or(file.sessions.max_sessions);
        if max_sessions == 0 {
            return Err(TermError::Config("max_sessions must be at least 1".into()));
        }
        let max_buffer_size = cli.max_buffer_size.unwrap_or(file.sessions.max_buffer_size);
        let idle_timeout = match cli.idle_timeout.unwrap_or(file.sessions.idle_timeout) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let approval_timeout =
            Duration::from_secs(cli.approval_timeout.unwrap_or(file.approval.timeout));

        Ok(Self {
            listen_addr: SocketAddr::new(bind, port),
            workspace_root,
            allowed_origins,
            tls,
            max_sessions,
            max_buffer_size,
            idle_timeout,
            approval_timeout,
        })
    }
}

fn parse(content: &str) -> TermResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| TermError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
