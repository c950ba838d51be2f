//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal running a [`ShellCommand`], and turns its
//! blocking reader, writer and child handles into channels so that nothing
//! on the async side ever blocks on PTY I/O.

use super::shell::ShellCommand;
use chatterm_core::{TermError, TermResult};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const READ_CHUNK_SIZE: usize = 8192;

/// A running terminal process as seen by the session store.
pub trait TerminalProcess: Send + Sync {
    /// Queue bytes for the process's terminal input.
    fn write(&self, data: &[u8]) -> TermResult<()>;

    /// Change the terminal size.
    fn resize(&self, cols: u16, rows: u16) -> TermResult<()>;

    /// Terminate the process. A no-op once it has exited.
    fn kill(&self) -> TermResult<()>;
}

/// A freshly spawned process plus the streams the output listener consumes.
pub struct SpawnedProcess {
    pub process: Box<dyn TerminalProcess>,
    /// Raw output chunks, in emission order. Closed at EOF.
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Exit code, sent once when the process exits.
    pub exit: oneshot::Receiver<i32>,
}

/// Something that can start shells in a terminal.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, shell: &ShellCommand, cols: u16, rows: u16) -> TermResult<SpawnedProcess>;
}

/// Spawns shells in real pseudo-terminals.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtySpawner;

impl ProcessSpawner for NativePtySpawner {
    fn spawn(&self, shell: &ShellCommand, cols: u16, rows: u16) -> TermResult<SpawnedProcess> {
        PtyHandle::spawn(shell, cols, rows)
    }
}

/// A managed PTY instance.
pub struct PtyHandle {
    /// Feeds the writer task; writes never block the caller.
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    /// The master for resize operations (Mutex because MasterPty is not Sync).
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    /// Set by the exit waiter once the child is reaped; its pid may be reused.
    exited: Arc<AtomicBool>,
}

impl PtyHandle {
    /// Spawn `shell` in a new PTY of the given size.
    ///
    /// Must be called from within a Tokio runtime: the blocking reader,
    /// writer and exit waiter run on the blocking pool.
    pub fn spawn(shell: &ShellCommand, cols: u16, rows: u16) -> TermResult<SpawnedProcess> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| TermError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&shell.program);
        cmd.args(&shell.args);
        for (key, value) in &shell.env {
            cmd.env(key, value);
        }
        cmd.cwd(&shell.cwd);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TermError::Spawn(format!("{}: {e}", shell.program)))?;
        // Only the child may hold the slave, or the reader never sees EOF.
        drop(pair.slave);

        let killer = child.clone_killer();
        let reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                abandon(child.as_mut());
                return Err(TermError::Spawn(format!("failed to clone PTY reader: {e}")));
            }
        };
        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                abandon(child.as_mut());
                return Err(TermError::Spawn(format!("failed to take PTY writer: {e}")));
            }
        };

        info!(
            program = %shell.program,
            cwd = %shell.cwd.display(),
            pid = ?child.process_id(),
            cols,
            rows,
            "PTY spawned"
        );

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || read_loop(reader, output_tx));

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || write_loop(writer, input_rx));

        let exited = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = oneshot::channel();
        {
            let exited = exited.clone();
            tokio::task::spawn_blocking(move || {
                let code = match child.wait() {
                    Ok(status) => i32::try_from(status.exit_code()).unwrap_or(-1),
                    Err(e) => {
                        warn!(error = %e, "failed to wait for PTY child");
                        -1
                    }
                };
                exited.store(true, Ordering::Release);
                info!(code, "PTY child exited");
                let _ = exit_tx.send(code);
            });
        }

        let handle = PtyHandle {
            input_tx,
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            exited,
        };

        Ok(SpawnedProcess {
            process: Box::new(handle),
            output: output_rx,
            exit: exit_rx,
        })
    }
}

impl TerminalProcess for PtyHandle {
    fn write(&self, data: &[u8]) -> TermResult<()> {
        self.input_tx
            .send(data.to_vec())
            .map_err(|_| TermError::Pty("PTY writer closed".into()))
    }

    fn resize(&self, cols: u16, rows: u16) -> TermResult<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        master
            .resize(size)
            .map_err(|e| TermError::Pty(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    fn kill(&self) -> TermResult<()> {
        if self.exited.load(Ordering::Acquire) {
            debug!("PTY child already exited, not signalling");
            return Ok(());
        }
        let mut killer = self.killer.lock().unwrap_or_else(PoisonError::into_inner);
        killer
            .kill()
            .map_err(|e| TermError::Pty(format!("kill failed: {e}")))
    }
}

/// Kill a child that will never be handed out, and reap it.
fn abandon(child: &mut (dyn Child + Send + Sync)) {
    if let Err(e) = child.kill() {
        debug!(error = %e, "kill of abandoned PTY child failed");
    }
    let _ = child.wait();
}

/// Blocking read loop; ends at EOF, on a read error, or when nobody listens.
fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO is how Linux reports the slave side closing.
                debug!(error = %e, "PTY read ended");
                break;
            }
        }
    }
}

/// Blocking write loop; ends when the handle is dropped.
fn write_loop(mut writer: Box<dyn Write + Send>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            warn!(error = %e, "PTY write failed");
            break;
        }
    }
}
