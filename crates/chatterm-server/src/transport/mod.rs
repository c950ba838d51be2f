//! Transport layer: WebSocket listener and per-connection outbound handles.

pub mod websocket;

use chatterm_core::ServerMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// The outbound half of one client connection.
///
/// Cloning is cheap; the PTY session store keeps a clone of the active
/// connection of each session to route output. Frames pushed here are
/// written to the socket by the connection's writer task in order.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ConnectionHandle {
    /// Create a handle with a fresh id, returning the receiver the writer
    /// task drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the writer side is still alive.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a frame. Returns `false` if the connection is gone.
    pub fn send(&self, msg: ServerMessage) -> bool {
        self.tx.send(msg).is_ok()
    }
}
