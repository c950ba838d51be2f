//! chatterm-server: persistent terminals for chat sessions.
//!
//! Serves PTY-backed shells over WebSocket. Each shell belongs to a chat
//! session, lives inside the configured workspace root and survives client
//! disconnects until it is destroyed or exits.

mod config;
mod handler;
mod server;
mod session;
mod transport;
mod workspace;

use chatterm_approval::{ApprovalCoordinator, QueryInterrupter};
use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::TermServer;
use session::PtySessionStore;
use std::future::Future;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// chatterm-server: terminal sessions for chat workspaces
#[derive(Parser, Debug)]
#[command(name = "chatterm-server", version, about = "Terminal sessions over WebSocket")]
struct Cli {
    /// Listen port
    #[arg(short, long, env = "CHATTERM_PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(long, env = "CHATTERM_BIND")]
    bind: Option<IpAddr>,

    /// Directory every terminal must stay inside
    #[arg(long, env = "CHATTERM_WORKSPACE_ROOT")]
    workspace_root: Option<String>,

    /// Comma-separated list of accepted Origin headers
    #[arg(long, env = "CHATTERM_ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Option<Vec<String>>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.chatterm/config.toml")]
    config: String,

    /// Maximum concurrent terminal sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Characters of output kept per session for replay
    #[arg(long)]
    max_buffer_size: Option<usize>,

    /// Seconds a detached session may live (0 = forever)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Seconds before a pending approval is interrupted (0 = never)
    #[arg(long)]
    approval_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Interrupter used when no agent engine is attached to this process.
struct UnattachedInterrupter;

impl QueryInterrupter for UnattachedInterrupter {
    fn interrupt_query<'a>(
        &'a self,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            warn!(session_id, "approval timed out, no agent query to interrupt");
            false
        })
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting chatterm-server");

    let overrides = CliOverrides {
        port: cli.port,
        bind: cli.bind,
        workspace_root: cli.workspace_root,
        allowed_origins: cli.allowed_origins,
        cert: cli.cert,
        key: cli.key,
        max_sessions: cli.max_sessions,
        max_buffer_size: cli.max_buffer_size,
        idle_timeout: cli.idle_timeout,
        approval_timeout: cli.approval_timeout,
    };
    let server_config = match ServerConfig::load(Some(&PathBuf::from(&cli.config)), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let tls = match &server_config.tls {
        Some((cert, key)) => match load_tls_config(cert, key) {
            Ok(cfg) => Some(TlsAcceptor::from(Arc::new(cfg))),
            Err(e) => {
                error!(error = %e, "failed to load TLS config");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let store = Arc::new(PtySessionStore::new(
        server_config.max_sessions,
        server_config.max_buffer_size,
    ));
    let approvals = Arc::new(ApprovalCoordinator::with_default_timeout(
        Arc::new(UnattachedInterrupter),
        server_config.approval_timeout,
    ));
    let server = TermServer::new(server_config, store, approvals);

    let mut failed = false;
    tokio::select! {
        result = server.run(tls) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                failed = true;
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.shutdown().await;
    info!("chatterm-server stopped");
    if failed {
        std::process::exit(1);
    }
}

/// Load TLS certificate and key from PEM files, returning a rustls ServerConfig.
fn load_tls_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<rustls::ServerConfig, Box<dyn std::error::Error>> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| format!("cannot read cert {}: {e}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| format!("cannot read key {}: {e}", key_path.display()))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;

    let key =
        rustls_pemfile::private_key(&mut &key_pem[..])?.ok_or("no private key found in PEM")?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    // WebSocket upgrades ride on HTTP/1.1.
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(tls_config)
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
