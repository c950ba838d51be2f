//! Terminal sessions: PTY lifecycle, output history, shell configuration.

pub mod output_buffer;
pub mod pty;
pub mod shell;
pub mod store;
pub mod utf8;

pub use output_buffer::MAX_BUFFER_SIZE;
pub use pty::{NativePtySpawner, ProcessSpawner, SpawnedProcess};
pub use shell::{shell_command, Platform};
pub use store::PtySessionStore;
pub use utf8::Utf8Stream;
