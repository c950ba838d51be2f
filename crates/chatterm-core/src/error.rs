use thiserror::Error;

/// Errors produced by the terminal layer.
///
/// Only the `Display` text of these ever reaches a client (inside an
/// `error` frame); the kinds exist so callers and tests can match on them.
#[derive(Debug, Error)]
pub enum TermError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("workspace path escapes the workspace root: {0}")]
    WorkspaceEscape(String),

    #[error("terminal session already exists: {0}")]
    SessionExists(String),

    #[error("terminal session not found: {0}")]
    SessionNotFound(String),

    #[error("max sessions ({0}) reached")]
    CapacityReached(usize),

    #[error("failed to spawn shell: {0}")]
    Spawn(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("shell exited with code {0}")]
    ProcessExited(i32),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for TermError {
    fn from(e: serde_json::Error) -> Self {
        TermError::Malformed(e.to_string())
    }
}

pub type TermResult<T> = Result<T, TermError>;
