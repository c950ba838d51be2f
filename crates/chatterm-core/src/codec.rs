//! JSON text framing for the terminal socket.
//!
//! Wire format: one JSON object per WebSocket text message.

use crate::error::{TermError, TermResult};
use crate::messages::{ClientMessage, ServerMessage};

/// Decode a client text frame.
///
/// Invalid JSON, a missing `type`, or a field of the wrong JSON type all
/// yield [`TermError::Malformed`]. An unrecognized `type` decodes to
/// [`ClientMessage::Unknown`].
pub fn decode_client_frame(text: &str) -> TermResult<ClientMessage> {
    serde_json::from_str(text).map_err(|e| TermError::Malformed(e.to_string()))
}

/// Encode a server frame as JSON text.
pub fn encode_server_frame(msg: &ServerMessage) -> TermResult<String> {
    Ok(serde_json::to_string(msg)?)
}
