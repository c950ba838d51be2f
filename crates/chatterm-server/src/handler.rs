//! Terminal protocol handler.
//!
//! Drives one WebSocket connection through the terminal protocol: `create`
//! either reattaches to a live session or spawns a new shell, `input` and
//! `resize` go to the attached session, and closing the socket only
//! detaches. Every reply goes through the connection's outbound queue so
//! frames reach the client in the order they were produced.

use crate::session::{
    shell_command, Platform, ProcessSpawner, PtySessionStore, SpawnedProcess, Utf8Stream,
};
use crate::transport::ConnectionHandle;
use crate::workspace::resolve_workspace;
use chatterm_core::{
    decode_client_frame, ClientMessage, ServerMessage, TermError, TermResult, DEFAULT_COLS,
    DEFAULT_ROWS,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How long output may keep arriving after the shell has exited.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Protocol state of one connection.
pub struct ConnectionState {
    handle: ConnectionHandle,
    /// The chat session this connection last created or reattached to.
    attached: Option<String>,
}

impl ConnectionState {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            attached: None,
        }
    }

    pub fn attached_session(&self) -> Option<&str> {
        self.attached.as_deref()
    }

    fn reply(&self, msg: ServerMessage) {
        if !self.handle.send(msg) {
            debug!(conn_id = self.handle.id(), "reply dropped, connection closed");
        }
    }
}

/// Handles terminal protocol messages for all connections.
pub struct TerminalHandler {
    store: Arc<PtySessionStore>,
    spawner: Arc<dyn ProcessSpawner>,
    workspace_root: PathBuf,
    platform: Platform,
    user_shell: Option<String>,
}

impl TerminalHandler {
    pub fn new(
        store: Arc<PtySessionStore>,
        spawner: Arc<dyn ProcessSpawner>,
        workspace_root: PathBuf,
        platform: Platform,
        user_shell: Option<String>,
    ) -> Self {
        Self {
            store,
            spawner,
            workspace_root,
            platform,
            user_shell,
        }
    }

    pub fn store(&self) -> &Arc<PtySessionStore> {
        &self.store
    }

    /// Handle one text frame from the client.
    pub async fn handle_text(&self, conn: &mut ConnectionState, text: &str) {
        match decode_client_frame(text) {
            Ok(msg) => self.handle_message(conn, msg).await,
            Err(e) => {
                debug!(conn_id = conn.handle.id(), error = %e, "rejecting frame");
                conn.reply(ServerMessage::error(&e));
            }
        }
    }

    /// Handle one decoded message.
    pub async fn handle_message(&self, conn: &mut ConnectionState, msg: ClientMessage) {
        match msg {
            ClientMessage::Create {
                chat_session_id,
                workspace_path,
            } => {
                self.handle_create(conn, chat_session_id, workspace_path)
                    .await
            }
            ClientMessage::Destroy { chat_session_id } => {
                self.handle_destroy(conn, chat_session_id).await
            }
            ClientMessage::Input { data } => self.handle_input(conn, data).await,
            ClientMessage::Resize { cols, rows } => self.handle_resize(conn, cols, rows).await,
            ClientMessage::Ping => conn.reply(ServerMessage::Pong),
            ClientMessage::Unknown => {
                warn!(conn_id = conn.handle.id(), "ignoring unknown message type");
            }
        }
    }

    /// The socket closed: detach, leaving the session running.
    pub async fn handle_close(&self, conn: ConnectionState) {
        let Some(id) = conn.attached else {
            return;
        };
        if self
            .store
            .clear_active_connection_if(&id, conn.handle.id())
            .await
        {
            info!(
                session_id = %id,
                conn_id = conn.handle.id(),
                "connection detached, session kept alive"
            );
        }
    }

    async fn handle_create(
        &self,
        conn: &mut ConnectionState,
        chat_session_id: Option<String>,
        workspace_path: Option<String>,
    ) {
        let Some(id) = non_empty(chat_session_id) else {
            conn.reply(ServerMessage::error(TermError::MissingField("chatSessionId")));
            return;
        };
        let Some(path) = non_empty(workspace_path) else {
            conn.reply(ServerMessage::error(TermError::MissingField("workspacePath")));
            return;
        };

        self.detach_other(conn, &id).await;

        if self.store.reattach(&id, conn.handle.clone()).await {
            info!(session_id = %id, conn_id = conn.handle.id(), "reattached to terminal session");
            conn.attached = Some(id);
            return;
        }

        if let Err(e) = self.spawn_session(conn, &id, &path).await {
            warn!(session_id = %id, workspace = %path, error = %e, "terminal create failed");
            conn.reply(ServerMessage::error(&e));
        }
    }

    /// Stop routing another session's output here before attaching to `next`.
    async fn detach_other(&self, conn: &mut ConnectionState, next: &str) {
        let Some(prev) = conn.attached.take() else {
            return;
        };
        if prev != next {
            self.store
                .clear_active_connection_if(&prev, conn.handle.id())
                .await;
        }
    }

    async fn spawn_session(
        &self,
        conn: &mut ConnectionState,
        id: &str,
        path: &str,
    ) -> TermResult<()> {
        let dir = resolve_workspace(&self.workspace_root, path)?;
        if !self.store.has_capacity().await {
            return Err(TermError::CapacityReached(self.store.max_sessions()));
        }
        if !dir.is_dir() {
            return Err(TermError::Spawn(format!(
                "workspace directory not found: {}",
                dir.display()
            )));
        }

        let shell = shell_command(self.platform, self.user_shell.as_deref(), &dir);
        let SpawnedProcess {
            process,
            output,
            exit,
        } = self.spawner.spawn(&shell, DEFAULT_COLS, DEFAULT_ROWS)?;

        let info = match self.store.create(id, path, process).await {
            Ok(info) => info,
            Err(TermError::SessionExists(_)) => {
                // Another connection created it first.
                if self.store.reattach(id, conn.handle.clone()).await {
                    conn.attached = Some(id.to_string());
                    return Ok(());
                }
                return Err(TermError::SessionNotFound(id.to_string()));
            }
            Err(e) => return Err(e),
        };

        self.store
            .set_active_connection(id, Some(conn.handle.clone()))
            .await;
        conn.attached = Some(id.to_string());
        conn.reply(ServerMessage::Ready {
            session_id: id.to_string(),
        });

        tokio::spawn(forward_output(
            self.store.clone(),
            id.to_string(),
            info.instance,
            output,
            exit,
        ));
        Ok(())
    }

    async fn handle_destroy(&self, conn: &mut ConnectionState, chat_session_id: Option<String>) {
        let Some(id) = non_empty(chat_session_id) else {
            debug!(conn_id = conn.handle.id(), "destroy without chatSessionId");
            return;
        };
        if !self.store.destroy(&id).await {
            debug!(session_id = %id, "destroy for unknown session");
        }
        if conn.attached.as_deref() == Some(id.as_str()) {
            conn.attached = None;
        }
    }

    async fn handle_input(&self, conn: &ConnectionState, data: Option<String>) {
        let (Some(id), Some(data)) = (conn.attached.as_deref(), data) else {
            return;
        };
        match self.store.write_input(id, &data).await {
            Ok(()) => {}
            Err(TermError::SessionNotFound(_)) => debug!(session_id = %id, "input for gone session"),
            Err(e) => warn!(session_id = %id, error = %e, "failed to write input"),
        }
    }

    async fn handle_resize(&self, conn: &ConnectionState, cols: Option<u16>, rows: Option<u16>) {
        let Some(id) = conn.attached.as_deref() else {
            return;
        };
        let cols = cols.filter(|c| *c > 0).unwrap_or(DEFAULT_COLS);
        let rows = rows.filter(|r| *r > 0).unwrap_or(DEFAULT_ROWS);
        if let Err(e) = self.store.resize(id, cols, rows).await {
            warn!(session_id = %id, cols, rows, error = %e, "resize failed");
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

enum PtyEvent {
    Output(Vec<u8>),
    Eof,
    Exited(i32),
}

/// Pump a session's output into the store until the process exits, then
/// remove the session and tell whoever was attached.
async fn forward_output(
    store: Arc<PtySessionStore>,
    id: String,
    instance: u64,
    mut output: mpsc::UnboundedReceiver<Vec<u8>>,
    mut exit: oneshot::Receiver<i32>,
) {
    let mut decoder = Utf8Stream::default();
    let mut output_open = true;

    let code = loop {
        let event = if output_open {
            tokio::select! {
                biased;
                chunk = output.recv() => chunk.map_or(PtyEvent::Eof, PtyEvent::Output),
                code = &mut exit => PtyEvent::Exited(code.unwrap_or(-1)),
            }
        } else {
            PtyEvent::Exited((&mut exit).await.unwrap_or(-1))
        };

        match event {
            PtyEvent::Output(bytes) => {
                let text = decoder.decode(&bytes);
                if !text.is_empty() && !store.record_output(&id, instance, text).await {
                    debug!(session_id = %id, instance, "dropping output of replaced session");
                }
            }
            PtyEvent::Eof => output_open = false,
            PtyEvent::Exited(code) => break code,
        }
    };

    // The reader may still hold what the shell wrote just before exiting.
    // A background job keeping the slave open must not stall the exit.
    if output_open {
        let grace = tokio::time::sleep(EXIT_DRAIN_GRACE);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                biased;
                chunk = output.recv() => match chunk {
                    Some(bytes) => {
                        let text = decoder.decode(&bytes);
                        if !text.is_empty() {
                            store.record_output(&id, instance, text).await;
                        }
                    }
                    None => break,
                },
                _ = &mut grace => {
                    debug!(session_id = %id, instance, "PTY output still open after exit");
                    break;
                }
            }
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        store.record_output(&id, instance, rest).await;
    }

    let Some(active) = store.destroy_instance(&id, instance).await else {
        debug!(session_id = %id, instance, code, "exit of an already removed session");
        return;
    };
    info!(session_id = %id, code, "shell exited");
    if let Some(conn) = active.filter(ConnectionHandle::is_open) {
        conn.send(ServerMessage::error(TermError::ProcessExited(code)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::tests::{FakeProcess, SharedFake};
    use crate::session::shell::ShellCommand;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// A spawned fake shell plus the ends the test drives.
    struct FakeShell {
        process: Arc<FakeProcess>,
        output: mpsc::UnboundedSender<Vec<u8>>,
        exit: Option<oneshot::Sender<i32>>,
        command: ShellCommand,
    }

    #[derive(Default)]
    struct FakeSpawner {
        shells: Mutex<Vec<FakeShell>>,
        fail: bool,
        fail_resize: bool,
    }

    impl FakeSpawner {
        fn count(&self) -> usize {
            self.shells.lock().unwrap().len()
        }

        fn process(&self, i: usize) -> Arc<FakeProcess> {
            self.shells.lock().unwrap()[i].process.clone()
        }

        fn emit(&self, i: usize, bytes: &[u8]) {
            self.shells.lock().unwrap()[i]
                .output
                .send(bytes.to_vec())
                .unwrap();
        }

        fn exit(&self, i: usize, code: i32) {
            let tx = self.shells.lock().unwrap()[i].exit.take().unwrap();
            tx.send(code).unwrap();
        }
    }

    impl ProcessSpawner for FakeSpawner {
        fn spawn(&self, shell: &ShellCommand, _cols: u16, _rows: u16) -> TermResult<SpawnedProcess> {
            if self.fail {
                return Err(TermError::Spawn("no such shell".into()));
            }
            let process = Arc::new(FakeProcess {
                fail_resize: self.fail_resize,
                ..FakeProcess::default()
            });
            let (output_tx, output_rx) = mpsc::unbounded_channel();
            let (exit_tx, exit_rx) = oneshot::channel();
            self.shells.lock().unwrap().push(FakeShell {
                process: process.clone(),
                output: output_tx,
                exit: Some(exit_tx),
                command: shell.clone(),
            });
            Ok(SpawnedProcess {
                process: Box::new(SharedFake(process)),
                output: output_rx,
                exit: exit_rx,
            })
        }
    }

    struct Fixture {
        handler: TerminalHandler,
        spawner: Arc<FakeSpawner>,
        root: tempfile::TempDir,
    }

    fn fixture_with(spawner: FakeSpawner, max_sessions: usize) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("proj")).unwrap();
        let spawner = Arc::new(spawner);
        let handler = TerminalHandler::new(
            Arc::new(PtySessionStore::new(max_sessions, 1000)),
            spawner.clone(),
            root.path().to_path_buf(),
            Platform::Linux,
            Some("/bin/bash".into()),
        );
        Fixture {
            handler,
            spawner,
            root,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FakeSpawner::default(), 10)
    }

    fn connect() -> (ConnectionState, UnboundedReceiver<ServerMessage>) {
        let (handle, rx) = ConnectionHandle::new();
        (ConnectionState::new(handle), rx)
    }

    async fn next(rx: &mut UnboundedReceiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection queue closed")
    }

    fn create(id: &str, path: &str) -> String {
        format!(r#"{{"type":"create","chatSessionId":"{id}","workspacePath":"{path}"}}"#)
    }

    fn error_text(msg: ServerMessage) -> String {
        match msg {
            ServerMessage::Error { error } => error,
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_pong() {
        let f = fixture();
        let (mut conn, mut rx) = connect();
        f.handler.handle_text(&mut conn, r#"{"type":"ping"}"#).await;
        assert_eq!(next(&mut rx).await, ServerMessage::Pong);
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_and_connection_survives() {
        let f = fixture();
        let (mut conn, mut rx) = connect();
        f.handler.handle_text(&mut conn, "{not json").await;
        assert!(matches!(next(&mut rx).await, ServerMessage::Error { .. }));
        f.handler.handle_text(&mut conn, r#"{"type":"ping"}"#).await;
        assert_eq!(next(&mut rx).await, ServerMessage::Pong);
    }

    #[tokio::test]
    async fn unknown_type_is_ignored() {
        let f = fixture();
        let (mut conn, mut rx) = connect();
        f.handler.handle_text(&mut conn, r#"{"type":"telepathy"}"#).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn create_requires_both_fields() {
        let f = fixture();
        let (mut conn, mut rx) = connect();
        f.handler
            .handle_text(&mut conn, r#"{"type":"create","workspacePath":"proj"}"#)
            .await;
        assert!(error_text(next(&mut rx).await).contains("chatSessionId"));
        f.handler
            .handle_text(&mut conn, r#"{"type":"create","chatSessionId":"s1","workspacePath":""}"#)
            .await;
        assert!(error_text(next(&mut rx).await).contains("workspacePath"));
        assert_eq!(f.spawner.count(), 0);
    }

    #[tokio::test]
    async fn create_outside_root_is_refused() {
        let f = fixture();
        let (mut conn, mut rx) = connect();
        f.handler.handle_text(&mut conn, &create("s1", "../etc")).await;
        assert!(matches!(next(&mut rx).await, ServerMessage::Error { .. }));
        assert_eq!(f.spawner.count(), 0);
        assert!(!f.handler.store().has("s1").await);
    }

    #[tokio::test]
    async fn create_in_missing_directory_fails() {
        let f = fixture();
        let (mut conn, mut rx) = connect();
        f.handler.handle_text(&mut conn, &create("s1", "nope")).await;
        assert!(error_text(next(&mut rx).await).contains("failed to spawn"));
        assert!(!f.handler.store().has("s1").await);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let f = fixture_with(
            FakeSpawner {
                fail: true,
                ..FakeSpawner::default()
            },
            10,
        );
        let (mut conn, mut rx) = connect();
        f.handler.handle_text(&mut conn, &create("s1", "proj")).await;
        assert!(error_text(next(&mut rx).await).contains("no such shell"));
        assert_eq!(f.handler.store().count().await, 0);
        assert_eq!(conn.attached_session(), None);
    }

    #[tokio::test]
    async fn capacity_is_reported() {
        let f = fixture_with(FakeSpawner::default(), 1);
        let (mut conn, mut rx) = connect();
        f.handler.handle_text(&mut conn, &create("s1", "proj")).await;
        next(&mut rx).await;
        f.handler.handle_text(&mut conn, &create("s2", "proj")).await;
        assert!(error_text(next(&mut rx).await).contains("max sessions"));
        assert_eq!(f.spawner.count(), 1);
    }

    #[tokio::test]
    async fn shell_runs_in_resolved_workspace() {
        let f = fixture();
        let (mut conn, mut rx) = connect();
        f.handler.handle_text(&mut conn, &create("s1", "proj")).await;
        next(&mut rx).await;
        let shells = f.spawner.shells.lock().unwrap();
        let expected = f.root.path().canonicalize().unwrap().join("proj");
        assert_eq!(shells[0].command.cwd, expected);
        assert_eq!(shells[0].command.program, "/bin/bash");
    }

    #[tokio::test]
    async fn session_survives_disconnect_and_replays_on_reconnect() {
        let f = fixture();
        let (mut first, mut first_rx) = connect();

        f.handler.handle_text(&mut first, &create("S1", "proj")).await;
        assert_eq!(
            next(&mut first_rx).await,
            ServerMessage::Ready {
                session_id: "S1".into()
            }
        );

        f.handler
            .handle_text(&mut first, r#"{"type":"input","data":"echo hi\n"}"#)
            .await;
        assert_eq!(&*f.spawner.process(0).input.lock().unwrap(), b"echo hi\n");

        f.spawner.emit(0, b"hi\r\n");
        assert_eq!(
            next(&mut first_rx).await,
            ServerMessage::Output {
                data: "hi\r\n".into()
            }
        );

        f.handler.handle_close(first).await;
        drop(first_rx);
        let info = f.handler.store().get("S1").await.unwrap();
        assert!(!info.attached);

        // Output while nobody is attached is only buffered.
        f.spawner.emit(0, b"$ ");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (mut second, mut second_rx) = connect();
        f.handler.handle_text(&mut second, &create("S1", "proj")).await;
        assert_eq!(
            next(&mut second_rx).await,
            ServerMessage::Reconnect {
                session_id: "S1".into(),
                buffer: "hi\r\n$ ".into()
            }
        );
        assert_eq!(f.spawner.count(), 1);

        f.handler
            .handle_text(&mut second, r#"{"type":"destroy","chatSessionId":"S1"}"#)
            .await;
        assert_eq!(*f.spawner.process(0).kills.lock().unwrap(), 1);
        assert!(!f.handler.store().has("S1").await);

        f.handler.handle_text(&mut second, &create("S1", "proj")).await;
        assert_eq!(
            next(&mut second_rx).await,
            ServerMessage::Ready {
                session_id: "S1".into()
            }
        );
        assert_eq!(f.spawner.count(), 2);
        assert_eq!(f.handler.store().get_buffer("S1").await, "");
    }

    #[tokio::test]
    async fn newest_connection_takes_over_output() {
        let f = fixture();
        let (mut a, mut a_rx) = connect();
        let (mut b, mut b_rx) = connect();

        f.handler.handle_text(&mut a, &create("S1", "proj")).await;
        next(&mut a_rx).await;
        f.handler.handle_text(&mut b, &create("S1", "proj")).await;
        assert!(matches!(next(&mut b_rx).await, ServerMessage::Reconnect { .. }));

        f.spawner.emit(0, b"only b");
        assert_eq!(
            next(&mut b_rx).await,
            ServerMessage::Output {
                data: "only b".into()
            }
        );
        assert!(a_rx.try_recv().is_err());

        // The displaced connection closing must not detach the new one.
        f.handler.handle_close(a).await;
        assert!(f.handler.store().get("S1").await.unwrap().attached);
    }

    #[tokio::test]
    async fn switching_sessions_detaches_the_previous_one() {
        let f = fixture();
        let (mut conn, mut rx) = connect();
        f.handler.handle_text(&mut conn, &create("S1", "proj")).await;
        next(&mut rx).await;
        f.handler.handle_text(&mut conn, &create("S2", "proj")).await;
        next(&mut rx).await;

        assert!(!f.handler.store().get("S1").await.unwrap().attached);
        assert_eq!(conn.attached_session(), Some("S2"));

        f.spawner.emit(0, b"from S1");
        f.spawner.emit(1, b"from S2");
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::Output {
                data: "from S2".into()
            }
        );
    }

    #[tokio::test]
    async fn shell_exit_removes_session_and_notifies() {
        let f = fixture();
        let (mut conn, mut rx) = connect();
        f.handler.handle_text(&mut conn, &create("S1", "proj")).await;
        next(&mut rx).await;

        f.spawner.emit(0, b"bye\r\n");
        f.spawner.exit(0, 3);
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::Output {
                data: "bye\r\n".into()
            }
        );
        assert!(error_text(next(&mut rx).await).contains("exited with code 3"));
        assert!(!f.handler.store().has("S1").await);
        assert_eq!(*f.spawner.process(0).kills.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn late_exit_does_not_remove_recreated_session() {
        let f = fixture();
        let (mut conn, mut rx) = connect();
        f.handler.handle_text(&mut conn, &create("S1", "proj")).await;
        next(&mut rx).await;
        f.handler
            .handle_text(&mut conn, r#"{"type":"destroy","chatSessionId":"S1"}"#)
            .await;
        f.handler.handle_text(&mut conn, &create("S1", "proj")).await;
        next(&mut rx).await;

        f.spawner.exit(0, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.handler.store().has("S1").await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resize_defaults_and_failures_are_contained() {
        let f = fixture_with(
            FakeSpawner {
                fail_resize: true,
                ..FakeSpawner::default()
            },
            10,
        );
        let (mut conn, mut rx) = connect();
        f.handler.handle_text(&mut conn, &create("S1", "proj")).await;
        next(&mut rx).await;
        f.handler
            .handle_text(&mut conn, r#"{"type":"resize","cols":100,"rows":30}"#)
            .await;
        assert!(rx.try_recv().is_err());
        assert!(f.handler.store().has("S1").await);

        let g = fixture();
        let (mut conn, mut rx) = connect();
        g.handler.handle_text(&mut conn, &create("S1", "proj")).await;
        next(&mut rx).await;
        g.handler.handle_text(&mut conn, r#"{"type":"resize"}"#).await;
        g.handler
            .handle_text(&mut conn, r#"{"type":"resize","cols":132,"rows":43}"#)
            .await;
        assert_eq!(
            *g.spawner.process(0).sizes.lock().unwrap(),
            vec![(DEFAULT_COLS, DEFAULT_ROWS), (132, 43)]
        );
    }

    #[tokio::test]
    async fn input_without_session_is_ignored() {
        let f = fixture();
        let (mut conn, mut rx) = connect();
        f.handler
            .handle_text(&mut conn, r#"{"type":"input","data":"ls\n"}"#)
            .await;
        f.handler
            .handle_text(&mut conn, r#"{"type":"resize","cols":10,"rows":10}"#)
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn multibyte_output_split_across_reads() {
        let f = fixture();
        let (mut conn, mut rx) = connect();
        f.handler.handle_text(&mut conn, &create("S1", "proj")).await;
        next(&mut rx).await;

        let bytes = "→ok".as_bytes();
        f.spawner.emit(0, &bytes[..2]);
        f.spawner.emit(0, &bytes[2..]);
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::Output {
                data: "→ok".into()
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_shell_output_precedes_exit_error() {
        use crate::session::NativePtySpawner;

        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("proj")).unwrap();
        let handler = TerminalHandler::new(
            Arc::new(PtySessionStore::new(10, 100_000)),
            Arc::new(NativePtySpawner),
            root.path().to_path_buf(),
            Platform::current(),
            Some("/bin/sh".into()),
        );
        let (mut conn, mut rx) = connect();
        handler.handle_text(&mut conn, &create("S1", "proj")).await;
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::Ready {
                session_id: "S1".into()
            }
        );

        let script = r#"i=0; while [ $i -lt 300 ]; do i=$((i+1)); echo line-$i; done; exit 3"#;
        let input = format!(r#"{{"type":"input","data":"{script}\n"}}"#);
        handler.handle_text(&mut conn, &input).await;

        let mut output = String::new();
        let error = loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("shell did not exit in time")
                .expect("connection queue closed");
            match msg {
                ServerMessage::Output { data } => output.push_str(&data),
                other => break error_text(other),
            }
        };

        assert!(error.contains("exited with code 3"), "{error}");
        for n in 1..=300 {
            assert!(output.contains(&format!("line-{n}\r\n")), "missing line-{n}");
        }
        assert!(!handler.store().has("S1").await);
        assert!(rx.try_recv().is_err());
    }
}
