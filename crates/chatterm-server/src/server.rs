//! Core server: accepts WebSocket connections and runs the terminal
//! protocol on each of them.
//!
//! Owns the PTY session store, the protocol handler and the approval
//! coordinator, and tears all of them down on shutdown.

use crate::config::ServerConfig;
use crate::handler::{ConnectionState, TerminalHandler};
use crate::session::{NativePtySpawner, Platform, PtySessionStore};
use crate::transport::websocket::{self, WebSocketConnection};
use crate::transport::ConnectionHandle;
use chatterm_approval::ApprovalCoordinator;
use chatterm_core::{encode_server_frame, TermResult};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// How often detached sessions are checked against the idle timeout.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// The chatterm server instance.
pub struct TermServer {
    config: ServerConfig,
    store: Arc<PtySessionStore>,
    handler: Arc<TerminalHandler>,
    approvals: Arc<ApprovalCoordinator>,
}

impl TermServer {
    /// Create a server around an existing store and approval coordinator.
    pub fn new(
        config: ServerConfig,
        store: Arc<PtySessionStore>,
        approvals: Arc<ApprovalCoordinator>,
    ) -> Self {
        let handler = Arc::new(TerminalHandler::new(
            store.clone(),
            Arc::new(NativePtySpawner),
            config.workspace_root.clone(),
            Platform::current(),
            std::env::var("SHELL").ok(),
        ));
        Self {
            config,
            store,
            handler,
            approvals,
        }
    }

    /// Listen and serve until the listener goes away.
    pub async fn run(&self, tls: Option<TlsAcceptor>) -> TermResult<()> {
        let mut ws_rx = websocket::start_listener(
            self.config.listen_addr,
            tls,
            self.config.allowed_origins.clone(),
        )
        .await?;

        if let Some(idle) = self.config.idle_timeout {
            let store = self.store.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(REAP_INTERVAL);
                loop {
                    interval.tick().await;
                    store.reap_detached(idle).await;
                }
            });
        }

        info!(
            addr = %self.config.listen_addr,
            workspace_root = %self.config.workspace_root.display(),
            max_sessions = self.config.max_sessions,
            "chatterm-server ready"
        );

        while let Some(conn) = ws_rx.recv().await {
            let handler = self.handler.clone();
            tokio::spawn(serve_connection(handler, conn));
        }

        info!("listener closed, shutting down");
        Ok(())
    }

    /// Kill every terminal and interrupt every pending approval.
    pub async fn shutdown(&self) {
        let interrupted = self.approvals.interrupt_all();
        let destroyed = self.store.destroy_all().await;
        info!(
            sessions = destroyed,
            approvals = interrupted.len(),
            "shutdown complete"
        );
    }
}

/// Run the terminal protocol on one WebSocket until it closes.
async fn serve_connection(handler: Arc<TerminalHandler>, conn: WebSocketConnection) {
    let remote = conn.remote_addr;
    let (mut sink, mut stream) = conn.ws_stream.split();
    let (handle, mut outbound) = ConnectionHandle::new();
    let conn_id = handle.id();
    info!(remote = %remote, conn_id, "terminal connection opened");

    // Sole writer of the socket, so frames go out in queue order.
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let frame = match encode_server_frame(&msg) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(conn_id, error = %e, "failed to encode frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(frame.into())).await {
                debug!(conn_id, error = %e, "WebSocket send failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut state = ConnectionState::new(handle);
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handler.handle_text(&mut state, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => debug!(conn_id, "ignoring binary frame"),
            Ok(_) => {}
            Err(e) => {
                warn!(remote = %remote, conn_id, error = %e, "WebSocket receive failed");
                break;
            }
        }
    }

    let attached = state.attached_session().map(str::to_string);
    handler.handle_close(state).await;
    writer.abort();
    let live_sessions = handler.store().count().await;
    info!(
        remote = %remote,
        conn_id,
        session_id = attached.as_deref().unwrap_or("-"),
        live_sessions,
        "terminal connection closed"
    );
}
