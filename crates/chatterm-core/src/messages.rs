//! Wire messages exchanged over the terminal socket.
//!
//! Every frame is a JSON object discriminated by its `"type"` field. Field
//! names are camelCase on the wire.

use serde::{Deserialize, Serialize};

/// Default terminal width when a `resize` omits `cols`.
pub const DEFAULT_COLS: u16 = 80;
/// Default terminal height when a `resize` omits `rows`.
pub const DEFAULT_ROWS: u16 = 24;

/// A frame sent by the browser terminal.
///
/// Required fields are modelled as `Option` so that a frame with a missing
/// field still decodes and can be answered with a specific error instead of
/// a generic parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Attach to the terminal of a chat session, spawning it if needed.
    #[serde(rename_all = "camelCase")]
    Create {
        chat_session_id: Option<String>,
        workspace_path: Option<String>,
    },
    /// Kill the terminal of a chat session.
    #[serde(rename_all = "camelCase")]
    Destroy { chat_session_id: Option<String> },
    /// Keystrokes for the attached terminal.
    Input { data: Option<String> },
    /// New terminal dimensions.
    Resize { cols: Option<u16>, rows: Option<u16> },
    Ping,
    /// Any `type` this server does not know.
    #[serde(other)]
    Unknown,
}

/// A frame sent to the browser terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// A fresh shell was spawned for the session.
    #[serde(rename_all = "camelCase")]
    Ready { session_id: String },
    /// Reattached to a running shell; `buffer` is the retained output.
    #[serde(rename_all = "camelCase")]
    Reconnect { session_id: String, buffer: String },
    /// Incremental shell output.
    Output { data: String },
    Error { error: String },
    Pong,
}

impl ServerMessage {
    /// Build an `error` frame from anything displayable.
    pub fn error(reason: impl std::fmt::Display) -> Self {
        ServerMessage::Error {
            error: reason.to_string(),
        }
    }
}
