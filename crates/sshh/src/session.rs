//! The session surface handed to user handlers.
//!
//! A [`Session`] is created for every accepted `session` channel and passed
//! to the registered handler once the client issues `shell` or `exec`. The
//! handler owns its own task; everything it needs from the channel (writes,
//! input, window updates, client signals, exit) goes through the session.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use russh_keys::key::PublicKey;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::auth::{PERM_KEY_DATA, Permissions};
use crate::events::ConnInfo;
use crate::pty::{Pty, Window};
use crate::signal::Signal;
use crate::{BoxFuture, ChannelHandler, Error, Result};

/// Most signals buffered before a sink is registered; later arrivals are
/// dropped silently.
pub(crate) const SIGNAL_BUFFER_LIMIT: usize = 128;

/// Handles a session channel. Receives the session surface and returns the
/// exit status delivered to the client.
pub type SessionHandler = Arc<dyn Fn(Session) -> BoxFuture<'static, i32> + Send + Sync>;

/// Creates a [`SessionHandler`] from an async function.
pub fn session_handler<F, Fut>(f: F) -> SessionHandler
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = i32> + Send + 'static,
{
    Arc::new(move |session| Box::pin(f(session)))
}

/// Configuration for the built-in `session` channel machinery.
#[derive(Clone)]
pub struct SessionChannelHandler {
    pub(crate) handler: SessionHandler,
    pub(crate) allow_pty: bool,
    pub(crate) allow_agent_forwarding: bool,
}

/// Creates a channel handler that serves `session` channels with the given
/// user handler. `allow_pty` gates `pty-req`; `allow_agent_forwarding`
/// gates `auth-agent-req@openssh.com`.
pub fn session_channel_handler(
    handler: SessionHandler,
    allow_pty: bool,
    allow_agent_forwarding: bool,
) -> ChannelHandler {
    ChannelHandler::Session(SessionChannelHandler {
        handler,
        allow_pty,
        allow_agent_forwarding,
    })
}

/// Messages from a session to its channel output pump.
#[derive(Debug)]
pub(crate) enum SessionOutput {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(u32),
}

/// Commands for the per-session signal router task.
pub(crate) enum SignalCmd {
    Deliver(Signal),
    Register(Option<mpsc::Sender<Signal>>),
}

/// State shared between the channel request machinery and the session.
pub(crate) struct SessionShared {
    pub(crate) handled: AtomicBool,
    pub(crate) exited: AtomicBool,
    pub(crate) agent_requested: AtomicBool,
    pub(crate) pty: RwLock<Option<Pty>>,
    pub(crate) winch_tx: Mutex<Option<mpsc::UnboundedSender<Window>>>,
}

impl SessionShared {
    pub(crate) fn new() -> Self {
        Self {
            handled: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            agent_requested: AtomicBool::new(false),
            pty: RwLock::new(None),
            winch_tx: Mutex::new(None),
        }
    }

    /// Marks the session handled. Returns `false` when a `shell` or
    /// `exec` request already won the race.
    pub(crate) fn mark_handled(&self) -> bool {
        self.handled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn is_handled(&self) -> bool {
        self.handled.load(Ordering::SeqCst)
    }
}

struct SessionCore {
    conn: ConnInfo,
    env: Vec<String>,
    command: Vec<String>,
    permissions: Option<Permissions>,
    shared: Arc<SessionShared>,
    output_tx: mpsc::UnboundedSender<SessionOutput>,
    signal_tx: mpsc::UnboundedSender<SignalCmd>,
    winch_rx: Mutex<Option<mpsc::UnboundedReceiver<Window>>>,
    input_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    cancel: CancellationToken,
}

/// A live `session` channel as seen by a user handler.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionCore>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.inner.conn.user)
            .field("remote_addr", &self.inner.conn.remote_addr)
            .field("command", &self.inner.command)
            .field("pty", &self.inner.shared.pty.read().is_some())
            .finish()
    }
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        conn: ConnInfo,
        env: Vec<String>,
        command: Vec<String>,
        permissions: Option<Permissions>,
        shared: Arc<SessionShared>,
        output_tx: mpsc::UnboundedSender<SessionOutput>,
        signal_tx: mpsc::UnboundedSender<SignalCmd>,
        winch_rx: Option<mpsc::UnboundedReceiver<Window>>,
        input_rx: Option<mpsc::Receiver<Vec<u8>>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(SessionCore {
                conn,
                env,
                command,
                permissions,
                shared,
                output_tx,
                signal_tx,
                winch_rx: Mutex::new(winch_rx),
                input_rx: tokio::sync::Mutex::new(input_rx),
                cancel,
            }),
        }
    }

    /// Username used when establishing the connection.
    pub fn user(&self) -> &str {
        &self.inner.conn.user
    }

    /// Client side of the connection.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.conn.remote_addr
    }

    /// Server side of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.conn.local_addr
    }

    /// Copy of the environment accumulated from `env` requests, in arrival
    /// order, as `KEY=VALUE` strings. Mutating the returned vector has no
    /// effect on the session.
    pub fn environ(&self) -> Vec<String> {
        self.inner.env.clone()
    }

    /// Copy of the shell-split command from `exec`, empty for `shell`.
    pub fn command(&self) -> Vec<String> {
        self.inner.command.clone()
    }

    /// Permissions granted during authentication, if any.
    pub fn permissions(&self) -> Option<Permissions> {
        self.inner.permissions.clone()
    }

    /// The public key that authenticated this connection, reconstructed
    /// from the permission extensions. `None` when another method was used.
    pub fn public_key(&self) -> Option<PublicKey> {
        let permissions = self.inner.permissions.as_ref()?;
        let data = permissions.extension(PERM_KEY_DATA)?;
        russh_keys::parse_public_key_base64(data).ok()
    }

    /// Whether the client requested agent forwarding (and it was allowed).
    pub fn agent_requested(&self) -> bool {
        self.inner.shared.agent_requested.load(Ordering::SeqCst)
    }

    /// The accepted pseudo-terminal, with its current window.
    pub fn pty(&self) -> Option<Pty> {
        self.inner.shared.pty.read().clone()
    }

    /// Takes the window-update stream. The stream is seeded with the
    /// initial window from `pty-req` and receives every subsequent
    /// `window-change`. Returns `None` when no PTY was accepted or the
    /// stream was already taken.
    pub fn window_changes(&self) -> Option<mpsc::UnboundedReceiver<Window>> {
        self.inner.winch_rx.lock().take()
    }

    /// Receives raw input written by the client, `None` once the channel
    /// closed or another caller holds the stream.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        let mut guard = self.inner.input_rx.lock().await;
        guard.as_mut()?.recv().await
    }

    /// Writes to the client's standard output. With a PTY attached, `\n`
    /// is rewritten to `\r\n`. The returned count never exceeds the input
    /// length even when the on-wire byte count is larger.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        let payload = if self.inner.shared.pty.read().is_some() {
            normalize_newlines(data)
        } else {
            data.to_vec()
        };
        self.inner
            .output_tx
            .send(SessionOutput::Stdout(payload))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "session channel closed"))?;
        Ok(data.len())
    }

    /// Writes a string to the client's standard output.
    pub fn write_string(&self, s: &str) -> io::Result<usize> {
        self.write(s.as_bytes())
    }

    /// Writes to the client's standard error stream.
    pub fn write_stderr(&self, data: &[u8]) -> io::Result<usize> {
        self.inner
            .output_tx
            .send(SessionOutput::Stderr(data.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "session channel closed"))?;
        Ok(data.len())
    }

    /// Sends the exit status and closes the session: the window stream, the
    /// channel, and the parent connection. A second call returns
    /// [`Error::AlreadyExited`].
    pub fn exit(&self, code: i32) -> Result<()> {
        if self
            .inner
            .shared
            .exited
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyExited);
        }
        debug!(user = %self.inner.conn.user, code, "session exit");
        self.inner.shared.winch_tx.lock().take();
        let _ = self.inner.output_tx.send(SessionOutput::Exit(code as u32));
        Ok(())
    }

    /// Registers a sink for client signals; `None` unregisters. Signals
    /// buffered before registration are replayed to the sink in arrival
    /// order, from a task separate from the request loop, so a slow sink
    /// never stalls request processing.
    pub fn signals(&self, sink: Option<mpsc::Sender<Signal>>) {
        let _ = self.inner.signal_tx.send(SignalCmd::Register(sink));
    }

    /// Token cancelled when the server or this connection shuts down.
    /// Handlers should watch it and return promptly.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Completes when the session's scope is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }
}

/// Routes client signals to the registered sink, buffering up to
/// [`SIGNAL_BUFFER_LIMIT`] while no sink is registered. Buffered signals
/// drain FIFO on registration; overflow is dropped, not an error.
pub(crate) async fn run_signal_router(mut rx: mpsc::UnboundedReceiver<SignalCmd>) {
    let mut sink: Option<mpsc::Sender<Signal>> = None;
    let mut buffer: VecDeque<Signal> = VecDeque::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            SignalCmd::Register(new_sink) => {
                sink = new_sink;
                if let Some(tx) = &sink {
                    while let Some(signal) = buffer.pop_front() {
                        if tx.send(signal).await.is_err() {
                            sink = None;
                            break;
                        }
                    }
                }
            }
            SignalCmd::Deliver(signal) => match &sink {
                Some(tx) => {
                    if tx.send(signal).await.is_err() {
                        sink = None;
                    }
                }
                None => {
                    if buffer.len() < SIGNAL_BUFFER_LIMIT {
                        buffer.push_back(signal);
                    } else {
                        trace!(%signal, "signal buffer full, dropping");
                    }
                }
            },
        }
    }
}

/// Rewrites `\n` to `\r\n`, collapsing any resulting `\r\r\n` back to
/// `\r\n`. Applying the rewrite twice yields the same bytes as once.
pub(crate) fn normalize_newlines(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    for &byte in data {
        if byte == b'\n' && out.last() != Some(&b'\r') {
            out.push(b'\r');
        }
        out.push(byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> ConnInfo {
        ConnInfo {
            user: "test".to_string(),
            local_addr: "127.0.0.1:22".parse().unwrap(),
            remote_addr: "127.0.0.1:40000".parse().unwrap(),
        }
    }

    fn test_session(
        env: Vec<String>,
        shared: Arc<SessionShared>,
    ) -> (
        Session,
        mpsc::UnboundedReceiver<SessionOutput>,
        mpsc::UnboundedReceiver<SignalCmd>,
    ) {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let session = Session::new(
            test_conn(),
            env,
            Vec::new(),
            None,
            shared,
            output_tx,
            signal_tx,
            None,
            None,
            CancellationToken::new(),
        );
        (session, output_rx, signal_rx)
    }

    #[test]
    fn test_normalize_newlines() {
        assert_eq!(normalize_newlines(b"a\nb"), b"a\r\nb");
        assert_eq!(normalize_newlines(b"a\r\nb"), b"a\r\nb");
        assert_eq!(normalize_newlines(b"\n\n"), b"\r\n\r\n");
        assert_eq!(normalize_newlines(b"plain"), b"plain");
        assert_eq!(normalize_newlines(b""), b"");
    }

    #[test]
    fn test_normalize_idempotent() {
        let inputs: [&[u8]; 5] = [b"a\nb\nc", b"\r\n", b"\r\r\n", b"x\ry\n", b"\n\r\n\n"];
        for input in inputs {
            let once = normalize_newlines(input);
            let twice = normalize_newlines(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_write_reports_input_length() {
        let shared = Arc::new(SessionShared::new());
        *shared.pty.write() = Some(Pty {
            term: "xterm".to_string(),
            window: Window::default(),
            modes: Vec::new(),
        });
        let (session, mut output_rx, _signal_rx) = test_session(Vec::new(), shared);

        let n = session.write(b"a\nb\n").unwrap();
        assert_eq!(n, 4);
        match output_rx.try_recv().unwrap() {
            SessionOutput::Stdout(data) => assert_eq!(data, b"a\r\nb\r\n"),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn test_write_without_pty_passes_through() {
        let shared = Arc::new(SessionShared::new());
        let (session, mut output_rx, _signal_rx) = test_session(Vec::new(), shared);

        session.write(b"a\nb").unwrap();
        match output_rx.try_recv().unwrap() {
            SessionOutput::Stdout(data) => assert_eq!(data, b"a\nb"),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn test_exit_once() {
        let shared = Arc::new(SessionShared::new());
        let (session, mut output_rx, _signal_rx) = test_session(Vec::new(), shared);

        session.exit(3).unwrap();
        assert!(matches!(session.exit(0), Err(Error::AlreadyExited)));
        match output_rx.try_recv().unwrap() {
            SessionOutput::Exit(code) => assert_eq!(code, 3),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn test_environ_is_independent_copy() {
        let shared = Arc::new(SessionShared::new());
        let (session, _output_rx, _signal_rx) =
            test_session(vec!["FOO=bar".to_string()], shared);

        let mut env = session.environ();
        env.push("INJECTED=1".to_string());
        assert_eq!(session.environ(), vec!["FOO=bar".to_string()]);
    }

    #[tokio::test]
    async fn test_signal_router_replays_buffer_in_order() {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_signal_router(cmd_rx));

        cmd_tx.send(SignalCmd::Deliver(Signal::Int)).unwrap();
        cmd_tx.send(SignalCmd::Deliver(Signal::Term)).unwrap();

        let (sink_tx, mut sink_rx) = mpsc::channel(8);
        cmd_tx.send(SignalCmd::Register(Some(sink_tx))).unwrap();

        assert_eq!(sink_rx.recv().await, Some(Signal::Int));
        assert_eq!(sink_rx.recv().await, Some(Signal::Term));

        cmd_tx.send(SignalCmd::Deliver(Signal::Hup)).unwrap();
        assert_eq!(sink_rx.recv().await, Some(Signal::Hup));
    }

    #[tokio::test]
    async fn test_signal_router_drops_past_buffer_limit() {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_signal_router(cmd_rx));

        for _ in 0..SIGNAL_BUFFER_LIMIT {
            cmd_tx.send(SignalCmd::Deliver(Signal::Int)).unwrap();
        }
        cmd_tx.send(SignalCmd::Deliver(Signal::Term)).unwrap();

        let (sink_tx, mut sink_rx) = mpsc::channel(SIGNAL_BUFFER_LIMIT + 8);
        cmd_tx.send(SignalCmd::Register(Some(sink_tx))).unwrap();

        for _ in 0..SIGNAL_BUFFER_LIMIT {
            assert_eq!(sink_rx.recv().await, Some(Signal::Int));
        }
        // The 129th signal was dropped; nothing further is pending.
        cmd_tx.send(SignalCmd::Deliver(Signal::Quit)).unwrap();
        assert_eq!(sink_rx.recv().await, Some(Signal::Quit));
    }

    #[tokio::test]
    async fn test_signal_router_unregister() {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_signal_router(cmd_rx));

        let (sink_tx, mut sink_rx) = mpsc::channel(8);
        cmd_tx.send(SignalCmd::Register(Some(sink_tx))).unwrap();
        cmd_tx.send(SignalCmd::Register(None)).unwrap();
        cmd_tx.send(SignalCmd::Deliver(Signal::Int)).unwrap();

        // The signal went to the buffer, not the old sink.
        let (sink2_tx, mut sink2_rx) = mpsc::channel(8);
        cmd_tx.send(SignalCmd::Register(Some(sink2_tx))).unwrap();
        assert_eq!(sink2_rx.recv().await, Some(Signal::Int));
        assert!(sink_rx.try_recv().is_err());
    }
}
