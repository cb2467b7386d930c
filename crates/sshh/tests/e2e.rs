//! End-to-end tests: a real server on loopback, driven by the russh
//! client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sshh::russh::client;
use sshh::russh::{ChannelMsg, Sig};
use sshh::russh_keys::PublicKeyBase64;
use sshh::russh_keys::key::KeyPair;
use sshh::{
    AuthRejection, ChannelHandler, Config, Event, EventHandler, PERM_KEY_FINGERPRINT, Server,
    SessionHandler, Signal, fingerprint_md5, session_channel_handler, session_handler,
};
use tokio::sync::mpsc;

type ClientChannel = sshh::russh::Channel<client::Msg>;

// ============================================================================
// Harness
// ============================================================================

struct TestClient;

#[async_trait::async_trait]
impl client::Handler for TestClient {
    type Error = sshh::russh::Error;

    async fn check_server_key(
        &mut self,
        _key: &sshh::russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    fn handler(&self) -> EventHandler {
        let log = self.0.clone();
        Arc::new(move |event: &Event| log.lock().unwrap().push(event.clone()))
    }

    fn snapshot(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.snapshot().iter().filter(|e| pred(e)).count()
    }

    async fn wait_until(&self, pred: impl Fn(&[Event]) -> bool) -> bool {
        for _ in 0..500 {
            if pred(&self.snapshot()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

struct TestServer {
    server: Arc<Server>,
    addr: SocketAddr,
    task: tokio::task::JoinHandle<sshh::Result<()>>,
    events: EventLog,
}

fn session_handlers(handler: SessionHandler) -> HashMap<String, ChannelHandler> {
    let mut handlers = HashMap::new();
    handlers.insert(
        "session".to_string(),
        session_channel_handler(handler, true, false),
    );
    handlers
}

/// Password callback accepting `testuser` / `secret`.
fn test_password_config(mut config: Config) -> Config {
    config.password_callback = Some(Arc::new(|conn: &sshh::ConnInfo, password: &str| {
        if conn.user == "testuser" && password == "secret" {
            Ok(None)
        } else {
            Err(AuthRejection::new("invalid credentials"))
        }
    }));
    config
}

async fn start_server(mut config: Config) -> Result<TestServer> {
    let events = EventLog::default();
    config.addr = "127.0.0.1:0".to_string();
    config.max_deadline = Duration::from_millis(50);
    config.host_key = Some(KeyPair::generate_ed25519().expect("failed to generate host key"));
    config.server_config = Some(sshh::russh::server::Config::default());
    config.event_handler = Some(events.handler());

    let server = Arc::new(Server::new(config)?);
    let task = tokio::spawn({
        let server = server.clone();
        async move { server.listen_and_serve().await }
    });

    let mut addr = None;
    for _ in 0..200 {
        if let Some(bound) = server.local_addr() {
            addr = Some(bound);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let addr = addr.context("server did not bind")?;

    Ok(TestServer {
        server,
        addr,
        task,
        events,
    })
}

async fn connect(addr: SocketAddr) -> Result<client::Handle<TestClient>> {
    let config = Arc::new(client::Config::default());
    let session = client::connect(config, addr, TestClient).await?;
    Ok(session)
}

async fn connect_password(addr: SocketAddr) -> Result<client::Handle<TestClient>> {
    let mut session = connect(addr).await?;
    let authenticated = session.authenticate_password("testuser", "secret").await?;
    if !authenticated {
        bail!("authentication failed");
    }
    Ok(session)
}

/// Waits for the reply to the most recent channel request.
async fn wait_reply(channel: &mut ClientChannel) -> Result<bool> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(true),
            Some(ChannelMsg::Failure) => return Ok(false),
            Some(_) => continue,
            None => bail!("channel closed while waiting for a reply"),
        }
    }
}

/// Collects stdout and the exit status until the channel closes.
async fn read_until_close(channel: &mut ClientChannel) -> (Vec<u8>, Option<u32>) {
    let mut data = Vec::new();
    let mut status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data: chunk } => data.extend_from_slice(&chunk),
            ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
            _ => {}
        }
    }
    (data, status)
}

/// A handler that holds the session open until its scope is cancelled.
fn wait_for_shutdown_handler() -> SessionHandler {
    session_handler(|session| async move {
        session.cancelled().await;
        0
    })
}

// ============================================================================
// Session dispatch
// ============================================================================

#[tokio::test]
async fn test_exec_command_and_exit_status() -> Result<()> {
    let (probe_tx, mut probe_rx) = mpsc::channel(1);
    let handler = session_handler(move |session| {
        let probe_tx = probe_tx.clone();
        async move {
            let _ = probe_tx.send(session.command()).await;
            let _ = session.write(b"hello from the server");
            7
        }
    });

    let config = test_password_config(Config {
        channel_handlers: session_handlers(handler),
        ..Default::default()
    });
    let server = start_server(config).await?;

    let mut session = connect_password(server.addr).await?;
    let mut channel = session.channel_open_session().await?;
    channel.exec(true, "echo hello world").await?;
    assert!(wait_reply(&mut channel).await?, "exec should be accepted");

    let command = probe_rx.recv().await.context("handler did not run")?;
    assert_eq!(command, vec!["echo", "hello", "world"]);

    let (data, status) = read_until_close(&mut channel).await;
    assert_eq!(data, b"hello from the server");
    assert_eq!(status, Some(7));

    server.server.stop().await;
    server.task.await??;
    Ok(())
}

#[tokio::test]
async fn test_exec_with_quoting() -> Result<()> {
    let (probe_tx, mut probe_rx) = mpsc::channel(1);
    let handler = session_handler(move |session| {
        let probe_tx = probe_tx.clone();
        async move {
            let _ = probe_tx.send(session.command()).await;
            0
        }
    });

    let config = test_password_config(Config {
        channel_handlers: session_handlers(handler),
        ..Default::default()
    });
    let server = start_server(config).await?;

    let mut session = connect_password(server.addr).await?;
    let mut channel = session.channel_open_session().await?;
    channel.exec(true, r#"grep "two words" file.txt"#).await?;
    assert!(wait_reply(&mut channel).await?);

    let command = probe_rx.recv().await.context("handler did not run")?;
    assert_eq!(command, vec!["grep", "two words", "file.txt"]);

    server.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_env_after_shell_is_rejected() -> Result<()> {
    let (probe_tx, mut probe_rx) = mpsc::channel(1);
    let handler = session_handler(move |session| {
        let probe_tx = probe_tx.clone();
        async move {
            let _ = probe_tx.send(session.environ()).await;
            session.cancelled().await;
            0
        }
    });

    let config = test_password_config(Config {
        channel_handlers: session_handlers(handler),
        ..Default::default()
    });
    let server = start_server(config).await?;

    let mut session = connect_password(server.addr).await?;
    let mut channel = session.channel_open_session().await?;

    channel.set_env(true, "FOO", "bar").await?;
    assert!(wait_reply(&mut channel).await?, "env before shell succeeds");

    channel.request_shell(true).await?;
    assert!(wait_reply(&mut channel).await?, "shell succeeds");

    channel.set_env(true, "LATE", "nope").await?;
    assert!(
        !wait_reply(&mut channel).await?,
        "env after shell must be refused"
    );

    let environ = probe_rx.recv().await.context("handler did not run")?;
    assert_eq!(environ, vec!["FOO=bar".to_string()]);

    server.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_second_shell_request_is_rejected() -> Result<()> {
    let config = test_password_config(Config {
        channel_handlers: session_handlers(wait_for_shutdown_handler()),
        ..Default::default()
    });
    let server = start_server(config).await?;

    let mut session = connect_password(server.addr).await?;
    let mut channel = session.channel_open_session().await?;

    channel.request_shell(true).await?;
    assert!(wait_reply(&mut channel).await?);

    channel.request_shell(true).await?;
    assert!(
        !wait_reply(&mut channel).await?,
        "a second shell must be refused"
    );

    server.server.stop().await;
    Ok(())
}

// ============================================================================
// Signals
// ============================================================================

#[tokio::test]
async fn test_signals_buffered_before_sink_registration() -> Result<()> {
    let (go_tx, go_rx) = mpsc::channel::<()>(1);
    let go_rx = Arc::new(tokio::sync::Mutex::new(Some(go_rx)));
    let (probe_tx, mut probe_rx) = mpsc::channel(1);

    let handler = session_handler(move |session| {
        let go_rx = go_rx.clone();
        let probe_tx = probe_tx.clone();
        async move {
            // Hold off sink registration until the client sent its signals.
            let mut go_rx = go_rx.lock().await.take().expect("handler runs once");
            let _ = go_rx.recv().await;

            let (sink_tx, mut sink_rx) = mpsc::channel(16);
            session.signals(Some(sink_tx));

            let mut received = Vec::new();
            for _ in 0..2 {
                match sink_rx.recv().await {
                    Some(signal) => received.push(signal),
                    None => break,
                }
            }
            let _ = probe_tx.send(received).await;
            0
        }
    });

    let config = test_password_config(Config {
        channel_handlers: session_handlers(handler),
        ..Default::default()
    });
    let server = start_server(config).await?;

    let mut session = connect_password(server.addr).await?;
    let mut channel = session.channel_open_session().await?;
    channel.request_shell(true).await?;
    assert!(wait_reply(&mut channel).await?);

    channel.signal(Sig::INT).await?;
    channel.signal(Sig::TERM).await?;
    // Give the request stream time to drain into the buffer.
    tokio::time::sleep(Duration::from_millis(100)).await;
    go_tx.send(()).await?;

    let received = probe_rx.recv().await.context("handler did not report")?;
    assert_eq!(received, vec![Signal::Int, Signal::Term]);

    server.server.stop().await;
    Ok(())
}

// ============================================================================
// PTY
// ============================================================================

#[tokio::test]
async fn test_pty_window_changes_and_write_normalization() -> Result<()> {
    let (probe_tx, mut probe_rx) = mpsc::channel(1);
    let handler = session_handler(move |session| {
        let probe_tx = probe_tx.clone();
        async move {
            let mut windows = session.window_changes().expect("pty was requested");
            let initial = windows.recv().await;
            let _ = session.write(b"line one\nline two\n");
            let resized = windows.recv().await;
            let _ = probe_tx.send((initial, resized)).await;
            0
        }
    });

    let config = test_password_config(Config {
        channel_handlers: session_handlers(handler),
        ..Default::default()
    });
    let server = start_server(config).await?;

    let mut session = connect_password(server.addr).await?;
    let mut channel = session.channel_open_session().await?;

    channel.request_pty(true, "xterm", 80, 24, 0, 0, &[]).await?;
    assert!(wait_reply(&mut channel).await?, "pty-req accepted");

    channel.request_shell(true).await?;
    assert!(wait_reply(&mut channel).await?);

    channel.window_change(120, 40, 0, 0).await?;

    let (initial, resized) = probe_rx.recv().await.context("handler did not report")?;
    let initial = initial.context("initial window missing")?;
    assert_eq!((initial.cols, initial.rows), (80, 24));
    let resized = resized.context("resized window missing")?;
    assert_eq!((resized.cols, resized.rows), (120, 40));

    let (data, status) = read_until_close(&mut channel).await;
    assert_eq!(data, b"line one\r\nline two\r\n");
    assert_eq!(status, Some(0));

    server.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_second_pty_request_is_rejected() -> Result<()> {
    let config = test_password_config(Config {
        channel_handlers: session_handlers(wait_for_shutdown_handler()),
        ..Default::default()
    });
    let server = start_server(config).await?;

    let mut session = connect_password(server.addr).await?;
    let mut channel = session.channel_open_session().await?;

    channel.request_pty(true, "xterm", 80, 24, 0, 0, &[]).await?;
    assert!(wait_reply(&mut channel).await?);

    channel.request_pty(true, "vt100", 80, 24, 0, 0, &[]).await?;
    assert!(
        !wait_reply(&mut channel).await?,
        "a second pty-req must be refused"
    );

    server.server.stop().await;
    Ok(())
}

// ============================================================================
// Public-key authentication
// ============================================================================

#[tokio::test]
async fn test_public_key_permission_extensions() -> Result<()> {
    let (probe_tx, mut probe_rx) = mpsc::channel(1);
    let handler = session_handler(move |session| {
        let probe_tx = probe_tx.clone();
        async move {
            let key_bytes = session.public_key().map(|key| key.public_key_bytes());
            let fingerprint = session
                .permissions()
                .and_then(|perms| perms.extension(PERM_KEY_FINGERPRINT).map(String::from));
            let _ = probe_tx.send((key_bytes, fingerprint)).await;
            0
        }
    });

    let mut config = Config {
        channel_handlers: session_handlers(handler),
        ..Default::default()
    };
    // Accept any key with no explicit permissions; the framework injects
    // the extensions itself.
    config.public_key_callback = Some(Arc::new(
        |_conn: &sshh::ConnInfo, _key: &sshh::russh_keys::key::PublicKey| Ok(None),
    ));
    let server = start_server(config).await?;

    let client_key = KeyPair::generate_ed25519().expect("failed to generate client key");
    let client_pub = client_key.clone_public_key()?;

    let mut session = connect(server.addr).await?;
    let authenticated = session
        .authenticate_publickey("testuser", Arc::new(client_key))
        .await?;
    assert!(authenticated, "public key auth should succeed");

    let mut channel = session.channel_open_session().await?;
    channel.exec(true, "whoami").await?;
    assert!(wait_reply(&mut channel).await?);

    let (key_bytes, fingerprint) = probe_rx.recv().await.context("handler did not report")?;
    assert_eq!(
        key_bytes.context("session had no public key")?,
        client_pub.public_key_bytes()
    );
    assert_eq!(
        fingerprint.context("fingerprint extension missing")?,
        fingerprint_md5(&client_pub)
    );

    server.server.stop().await;
    Ok(())
}

// ============================================================================
// Admission control
// ============================================================================

#[tokio::test]
async fn test_max_connections_refuses_excess() -> Result<()> {
    let config = test_password_config(Config {
        max_connections: 1,
        channel_handlers: session_handlers(wait_for_shutdown_handler()),
        ..Default::default()
    });
    let server = start_server(config).await?;

    // First connection fills the server.
    let mut first = connect_password(server.addr).await?;
    assert!(
        server
            .events
            .wait_until(|events| events
                .iter()
                .any(|e| matches!(e, Event::MaxConnections)))
            .await,
        "cap crossing should be reported"
    );

    // The second is refused before any banner.
    assert!(connect(server.addr).await.is_err(), "must be refused");
    assert!(
        server
            .events
            .wait_until(|events| {
                events
                    .iter()
                    .filter(|e| matches!(e, Event::ConnectionClosed { .. }))
                    .count()
                    >= 1
            })
            .await
    );

    // No handshake was attempted for the refused connection.
    assert_eq!(
        server
            .events
            .count(|e| matches!(e, Event::HandshakeSuccessful { .. })),
        1
    );
    assert_eq!(server.events.count(|e| matches!(e, Event::MaxConnections)), 1);

    drop(first);
    server.server.stop().await;
    server.task.await??;
    Ok(())
}

#[tokio::test]
async fn test_max_client_connections_per_ip() -> Result<()> {
    let config = test_password_config(Config {
        max_client_connections: 2,
        channel_handlers: session_handlers(wait_for_shutdown_handler()),
        ..Default::default()
    });
    let server = start_server(config).await?;

    let mut first = connect_password(server.addr).await?;
    let mut second = connect_password(server.addr).await?;
    assert!(
        server
            .events
            .wait_until(|events| events
                .iter()
                .any(|e| matches!(e, Event::MaxClientConnections { .. })))
            .await,
        "per-IP cap crossing should be reported"
    );

    assert!(connect(server.addr).await.is_err(), "third must be refused");

    assert_eq!(
        server
            .events
            .count(|e| matches!(e, Event::ConnectionOpened { .. })),
        2
    );
    assert_eq!(
        server
            .events
            .count(|e| matches!(e, Event::MaxClientConnections { .. })),
        1
    );
    assert_eq!(
        server
            .events
            .count(|e| matches!(e, Event::HandshakeSuccessful { .. })),
        2
    );

    drop(first);
    drop(second);
    server.server.stop().await;
    Ok(())
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_graceful_shutdown_under_load() -> Result<()> {
    let config = test_password_config(Config {
        max_connections: 10,
        channel_handlers: session_handlers(wait_for_shutdown_handler()),
        ..Default::default()
    });
    let server = start_server(config).await?;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect_password(server.addr).await?);
    }
    assert_eq!(
        server
            .events
            .count(|e| matches!(e, Event::HandshakeSuccessful { .. })),
        3
    );

    server.server.stop().await;
    server.task.await??;

    let events = server.events.snapshot();
    let stopped = events
        .iter()
        .position(|e| matches!(e, Event::ServerStopped))
        .context("missing ServerStopped")?;
    let listener_closed = events
        .iter()
        .position(|e| matches!(e, Event::ListenerClosed))
        .context("missing ListenerClosed")?;
    assert!(stopped < listener_closed);

    let closed: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, Event::ConnectionClosed { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(closed.len(), 3, "one close event per admitted connection");
    assert!(closed.iter().all(|&i| i > listener_closed));

    drop(clients);
    Ok(())
}

#[tokio::test]
async fn test_shutdown_via_signal_channel() -> Result<()> {
    let (signal_tx, signal_rx) = mpsc::channel(1);
    let mut config = test_password_config(Config {
        channel_handlers: session_handlers(wait_for_shutdown_handler()),
        ..Default::default()
    });
    config.signal_rx = Some(signal_rx);
    let server = start_server(config).await?;

    signal_tx.send(()).await?;
    server.task.await??;

    let events = server.events.snapshot();
    assert!(events.iter().any(|e| matches!(e, Event::ServerStopped)));
    assert!(events.iter().any(|e| matches!(e, Event::ListenerClosed)));
    Ok(())
}

// ============================================================================
// Handshake failures
// ============================================================================

#[tokio::test]
async fn test_failed_auth_reports_handshake_failure() -> Result<()> {
    let config = test_password_config(Config {
        channel_handlers: session_handlers(wait_for_shutdown_handler()),
        ..Default::default()
    });
    let server = start_server(config).await?;

    let mut session = connect(server.addr).await?;
    let authenticated = session.authenticate_password("testuser", "wrong").await?;
    assert!(!authenticated);
    drop(session);

    assert!(
        server
            .events
            .wait_until(|events| events
                .iter()
                .any(|e| matches!(e, Event::HandshakeFailed { .. })))
            .await,
        "a connection that never authenticates fails the handshake"
    );
    assert_eq!(
        server
            .events
            .count(|e| matches!(e, Event::HandshakeSuccessful { .. })),
        0
    );

    server.server.stop().await;
    Ok(())
}
