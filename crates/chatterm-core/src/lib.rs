//! chatterm-core: Shared protocol library for the chat terminal layer.
//!
//! Provides the JSON wire messages, the text frame codec, and the error
//! kinds shared by the server and anything embedding it.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_client_frame, encode_server_frame};
pub use error::{TermError, TermResult};
pub use messages::{ClientMessage, ServerMessage, DEFAULT_COLS, DEFAULT_ROWS};
