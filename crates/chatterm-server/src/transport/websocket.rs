//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections, optionally wraps them in TLS, checks the
//! `Origin` header during the upgrade and hands finished WebSocket streams
//! to the server over a channel.

use chatterm_core::{TermError, TermResult};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Maximum size of one WebSocket message (1 MiB).
pub const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// A byte stream a WebSocket can run over: plain TCP or TLS.
pub trait ServerIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ServerIo for T {}

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<Box<dyn ServerIo>>,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields accepted connections. With `tls` set,
/// every connection must complete a TLS handshake first. An empty
/// `allowed_origins` disables the origin check.
pub async fn start_listener(
    bind_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    allowed_origins: Vec<String>,
) -> TermResult<mpsc::Receiver<WebSocketConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| TermError::Transport(format!("WS bind failed: {e}")))?;

    info!(addr = %bind_addr, tls = tls.is_some(), "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let tls = tls.clone();
                    let allowed_origins = allowed_origins.clone();
                    tokio::spawn(async move {
                        let io: Box<dyn ServerIo> = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => Box::new(tls_stream),
                                Err(e) => {
                                    warn!(remote = %addr, error = %e, "TLS handshake failed");
                                    return;
                                }
                            },
                            None => Box::new(stream),
                        };
                        match accept_websocket(io, allowed_origins).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(rx)
}

#[allow(clippy::result_large_err)]
async fn accept_websocket(
    io: Box<dyn ServerIo>,
    allowed_origins: Vec<String>,
) -> Result<WebSocketStream<Box<dyn ServerIo>>, tokio_tungstenite::tungstenite::Error> {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_WS_FRAME_SIZE);
    config.max_frame_size = Some(MAX_WS_FRAME_SIZE);

    let callback = move |request: &Request, response: Response| {
        match validate_origin(request, &allowed_origins) {
            Ok(()) => Ok(response),
            Err(reason) => {
                warn!(reason, "rejecting WebSocket upgrade");
                Err(forbidden(reason))
            }
        }
    };

    tokio_tungstenite::accept_hdr_async_with_config(io, callback, Some(config)).await
}

/// Check the upgrade request's `Origin` header against the allow-list.
///
/// Returns the rejection reason on failure.
pub fn validate_origin(request: &Request, allowed_origins: &[String]) -> Result<(), &'static str> {
    if allowed_origins.is_empty() {
        return Ok(());
    }
    let origin = request
        .headers()
        .get("Origin")
        .and_then(|value| value.to_str().ok())
        .ok_or("Origin header missing")?;
    if allowed_origins.iter().any(|allowed| allowed == origin) {
        Ok(())
    } else {
        Err("Origin not allowed")
    }
}

fn forbidden(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::FORBIDDEN;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(origin: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/terminal");
        if let Some(origin) = origin {
            builder = builder.header("Origin", origin);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn empty_allow_list_accepts_anything() {
        assert!(validate_origin(&request(None), &[]).is_ok());
        assert!(validate_origin(&request(Some("https://evil.example")), &[]).is_ok());
    }

    #[test]
    fn listed_origin_is_accepted() {
        let allowed = vec!["http://localhost:3000".to_string()];
        assert!(validate_origin(&request(Some("http://localhost:3000")), &allowed).is_ok());
    }

    #[test]
    fn foreign_or_missing_origin_is_rejected() {
        let allowed = vec!["http://localhost:3000".to_string()];
        assert_eq!(
            validate_origin(&request(Some("http://localhost:3001")), &allowed),
            Err("Origin not allowed")
        );
        assert_eq!(
            validate_origin(&request(None), &allowed),
            Err("Origin header missing")
        );
    }

    #[test]
    fn rejection_is_forbidden() {
        let response = forbidden("Origin not allowed");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.body().as_deref(), Some("Origin not allowed"));
    }

    #[tokio::test]
    async fn listener_binds_ephemeral_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(start_listener(addr, None, Vec::new()).await.is_ok());
    }
}
