#![forbid(unsafe_code)]

//! # sshh
//!
//! An embeddable SSH server framework.
//!
//! sshh accepts TCP connections, performs the SSH handshake through the
//! `russh` transport, and dispatches channels and global requests to
//! handlers you register. It ships with:
//!
//! - **Admission control**: global and per-IP connection caps enforced
//!   before the SSH banner is ever sent
//! - **Graceful shutdown**: cancellation cascades from the server to every
//!   connection and session, and the accept loop drains before returning
//! - **Interactive sessions**: a `session` channel state machine carrying
//!   PTY, environment, window-change, client-signal, and exit-status
//!   semantics end to end
//! - **Typed events**: every observable state change reported through one
//!   non-blocking handler
//!
//! ## Example
//!
//! ```rust,ignore
//! use sshh::{listen_and_serve, session_channel_handler, session_handler};
//! use sshh::{with_channel_handler, with_host_key_file, with_password_auth};
//!
//! #[tokio::main]
//! async fn main() -> sshh::Result<()> {
//!     listen_and_serve(
//!         "127.0.0.1:2222",
//!         [
//!             with_host_key_file("host_key"),
//!             with_password_auth("admin", "password"),
//!             with_channel_handler(
//!                 "session",
//!                 session_channel_handler(
//!                     session_handler(|session| async move {
//!                         let _ = session.write_string("Hello!\n");
//!                         0
//!                     }),
//!                     true,
//!                     false,
//!                 ),
//!             ),
//!         ],
//!     )
//!     .await
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh_keys::key::KeyPair;
use thiserror::Error as ThisError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod auth;
pub mod events;
mod handler;
pub mod pty;
mod server;
pub mod session;
pub mod signal;

pub use auth::{
    AuthLogCallback, AuthOutcome, AuthRejection, PERM_KEY_DATA, PERM_KEY_FINGERPRINT,
    PERM_KEY_TYPE, PasswordCallback, Permissions, PublicKeyCallback, fingerprint_md5,
};
pub use events::{ConnInfo, Event, EventHandler, tracing_event_handler};
pub use pty::{Pty, TerminalMode, Window};
pub use server::Server;
pub use session::{
    Session, SessionChannelHandler, SessionHandler, session_channel_handler, session_handler,
};
pub use signal::Signal;

// Re-export the transport crates for embedders.
pub use russh;
pub use russh_keys;

/// Errors produced by the server framework.
#[derive(Debug, ThisError)]
pub enum Error {
    /// I/O error, typically from binding or accepting.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Error from the SSH transport.
    #[error("ssh error: {0}")]
    Russh(#[from] russh::Error),

    /// Key loading or parsing error.
    #[error("key error: {0}")]
    KeyLoad(#[from] russh_keys::Error),

    /// The bind address did not resolve.
    #[error("invalid bind address: {0}")]
    InvalidAddress(String),

    /// The server configuration is incomplete or inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// `Session::exit` was called more than once.
    #[error("exit called more than once")]
    AlreadyExited,
}

/// A specialized [`Result`] for framework operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed future, used by handler types.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A bidirectional byte stream the SSH transport can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// An owned, type-erased transport.
pub type BoxTransport = Box<dyn Transport>;

/// Invoked once per accepted TCP connection; may wrap the stream (TLS,
/// rate limiting, byte accounting) and return a replacement transport.
pub type ConnectionCallback = Arc<dyn Fn(TcpStream) -> BoxTransport + Send + Sync>;

/// A global request surfaced by the transport, dispatched by type through
/// [`Config::request_handlers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequest {
    /// `tcpip-forward`: the handler may rewrite `port` (e.g. when asked to
    /// bind port 0); the rewritten value reaches the client in the reply.
    TcpipForward { address: String, port: u32 },
    /// `cancel-tcpip-forward`.
    CancelTcpipForward { address: String, port: u32 },
}

impl GlobalRequest {
    /// The SSH request type string.
    pub fn request_type(&self) -> &'static str {
        match self {
            GlobalRequest::TcpipForward { .. } => "tcpip-forward",
            GlobalRequest::CancelTcpipForward { .. } => "cancel-tcpip-forward",
        }
    }
}

/// Handles global requests on a connection. Returns whether the request
/// succeeded; the reply is sent only when the client asked for one.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, conn: &ConnInfo, request: &mut GlobalRequest) -> bool;
}

/// Parameters of a channel open, passed to raw channel handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOpen {
    /// A `session` channel.
    Session,
    /// A `direct-tcpip` channel with its target and originator.
    DirectTcpip {
        host_to_connect: String,
        port_to_connect: u32,
        originator_address: String,
        originator_port: u32,
    },
}

/// Handles a channel by driving the raw transport channel directly. Used
/// for channel types without built-in machinery (e.g. `direct-tcpip`).
#[async_trait]
pub trait RawChannelHandler: Send + Sync {
    async fn handle_channel(
        &self,
        conn: ConnInfo,
        open: ChannelOpen,
        channel: russh::Channel<russh::server::Msg>,
        cancel: CancellationToken,
    );
}

/// A registered channel handler: either the built-in session machinery or
/// a raw handler.
pub enum ChannelHandler {
    /// Serve `session` channels through the session state machine.
    Session(SessionChannelHandler),
    /// Hand the raw channel to the handler.
    Raw(Arc<dyn RawChannelHandler>),
}

/// Wraps a [`RawChannelHandler`] for registration.
pub fn raw_channel_handler<H: RawChannelHandler + 'static>(handler: H) -> ChannelHandler {
    ChannelHandler::Raw(Arc::new(handler))
}

/// Server configuration. Construct directly or through the option
/// functions and [`listen_and_serve`]. Immutable once the server is built.
pub struct Config {
    /// Bind endpoint; empty means `:22`, and a bare `:port` binds all
    /// interfaces.
    pub addr: String,
    /// Global open-connection cap; 0 means unlimited.
    pub max_connections: usize,
    /// Per-source-IP open-connection cap; 0 means unlimited.
    pub max_client_connections: usize,
    /// Upper bound on how long an accept may block; 0 means the default of
    /// one second. Also bounds how long shutdown can go unnoticed.
    pub max_deadline: Duration,
    /// Hard lifetime of each connection; 0 means unlimited.
    pub max_connection_duration: Duration,
    /// Global request dispatch, keyed by request type.
    pub request_handlers: HashMap<String, Arc<dyn RequestHandler>>,
    /// Channel dispatch, keyed by channel type.
    pub channel_handlers: HashMap<String, ChannelHandler>,
    /// Optional transport wrapper, invoked once per TCP connection.
    pub connection_callback: Option<ConnectionCallback>,
    /// Non-blocking event observer.
    pub event_handler: Option<EventHandler>,
    /// Host signer; installed into the SSH configuration when present.
    pub host_key: Option<KeyPair>,
    /// Underlying SSH transport configuration. Required.
    pub server_config: Option<russh::server::Config>,
    /// Any message on this channel triggers graceful shutdown.
    pub signal_rx: Option<mpsc::Receiver<()>>,
    /// Password authentication policy.
    pub password_callback: Option<PasswordCallback>,
    /// Public-key authentication policy. Wrapped by the server to inject
    /// the `pub-key-*` permission extensions on success.
    pub public_key_callback: Option<PublicKeyCallback>,
    /// Called once per authentication attempt.
    pub auth_log_callback: Option<AuthLogCallback>,
    /// Accept connections without client authentication.
    pub no_client_auth: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: String::new(),
            max_connections: 0,
            max_client_connections: 0,
            max_deadline: Duration::ZERO,
            max_connection_duration: Duration::ZERO,
            request_handlers: HashMap::new(),
            channel_handlers: HashMap::new(),
            connection_callback: None,
            event_handler: None,
            host_key: None,
            server_config: None,
            signal_rx: None,
            password_callback: None,
            public_key_callback: None,
            auth_log_callback: None,
            no_client_auth: false,
        }
    }
}

// -----------------------------------------------------------------------------
// Option functions
// -----------------------------------------------------------------------------

/// Modifies the configuration; options that load external material (e.g. a
/// host key file) can fail.
pub type ServerOption = Box<dyn FnOnce(&mut Config) -> Result<()> + Send>;

fn require_ssh_config(config: &Config, what: &str) -> Result<()> {
    if config.server_config.is_none() {
        return Err(Error::Configuration(format!(
            "{what} requires the ssh server configuration to be set"
        )));
    }
    Ok(())
}

/// Sets the bind address.
pub fn with_address(addr: impl Into<String>) -> ServerOption {
    let addr = addr.into();
    Box::new(move |config| {
        config.addr = addr;
        Ok(())
    })
}

/// Sets the global open-connection cap.
pub fn with_max_connections(max: usize) -> ServerOption {
    Box::new(move |config| {
        config.max_connections = max;
        Ok(())
    })
}

/// Sets the per-source-IP open-connection cap.
pub fn with_max_client_connections(max: usize) -> ServerOption {
    Box::new(move |config| {
        config.max_client_connections = max;
        Ok(())
    })
}

/// Sets the maximum accept-blocking window.
pub fn with_max_deadline(deadline: Duration) -> ServerOption {
    Box::new(move |config| {
        config.max_deadline = deadline;
        Ok(())
    })
}

/// Sets the hard per-connection lifetime.
pub fn with_max_connection_duration(duration: Duration) -> ServerOption {
    Box::new(move |config| {
        config.max_connection_duration = duration;
        Ok(())
    })
}

/// Registers a global-request handler for a request type.
pub fn with_request_handler<H: RequestHandler + 'static>(
    request_type: impl Into<String>,
    handler: H,
) -> ServerOption {
    let request_type = request_type.into();
    Box::new(move |config| {
        config
            .request_handlers
            .insert(request_type, Arc::new(handler));
        Ok(())
    })
}

/// Registers a channel handler for a channel type.
pub fn with_channel_handler(
    channel_type: impl Into<String>,
    handler: ChannelHandler,
) -> ServerOption {
    let channel_type = channel_type.into();
    Box::new(move |config| {
        config.channel_handlers.insert(channel_type, handler);
        Ok(())
    })
}

/// Sets the connection callback that may wrap the transport.
pub fn with_connection_callback<F>(callback: F) -> ServerOption
where
    F: Fn(TcpStream) -> BoxTransport + Send + Sync + 'static,
{
    Box::new(move |config| {
        config.connection_callback = Some(Arc::new(callback));
        Ok(())
    })
}

/// Sets the event handler. Must be non-blocking.
pub fn with_event_handler(handler: EventHandler) -> ServerOption {
    Box::new(move |config| {
        config.event_handler = Some(handler);
        Ok(())
    })
}

/// Sets the host key.
pub fn with_host_key(key: KeyPair) -> ServerOption {
    Box::new(move |config| {
        config.host_key = Some(key);
        Ok(())
    })
}

/// Loads the host key from an OpenSSH-format file. Fails at option time
/// when the file is missing or does not parse.
pub fn with_host_key_file(path: impl AsRef<Path>) -> ServerOption {
    let path = path.as_ref().to_path_buf();
    Box::new(move |config| {
        let key = russh_keys::load_secret_key(&path, None)?;
        config.host_key = Some(key);
        Ok(())
    })
}

/// Sets the channel whose messages trigger graceful shutdown.
pub fn with_signal_channel(rx: mpsc::Receiver<()>) -> ServerOption {
    Box::new(move |config| {
        config.signal_rx = Some(rx);
        Ok(())
    })
}

/// Replaces the underlying SSH transport configuration.
pub fn with_server_config(server_config: russh::server::Config) -> ServerOption {
    Box::new(move |config| {
        config.server_config = Some(server_config);
        Ok(())
    })
}

/// Enables password authentication for a single fixed credential pair.
pub fn with_password_auth(user: impl Into<String>, password: impl Into<String>) -> ServerOption {
    let user = user.into();
    let password = password.into();
    Box::new(move |config| {
        require_ssh_config(config, "password auth")?;
        config.password_callback = Some(Arc::new(move |conn, supplied| {
            if conn.user == user && supplied == password {
                Ok(Some(Permissions::default()))
            } else {
                Err(AuthRejection::new("invalid username or password"))
            }
        }));
        Ok(())
    })
}

/// Sets a custom password authentication callback.
pub fn with_password_callback<F>(callback: F) -> ServerOption
where
    F: Fn(&ConnInfo, &str) -> AuthOutcome + Send + Sync + 'static,
{
    Box::new(move |config| {
        require_ssh_config(config, "password auth")?;
        config.password_callback = Some(Arc::new(callback));
        Ok(())
    })
}

/// Enables public-key authentication for a single authorized key, matched
/// by fingerprint.
pub fn with_public_key_auth(key: russh_keys::key::PublicKey) -> ServerOption {
    Box::new(move |config| {
        require_ssh_config(config, "public key auth")?;
        let wanted = fingerprint_md5(&key);
        config.public_key_callback = Some(Arc::new(move |_conn, offered| {
            if fingerprint_md5(offered) == wanted {
                Ok(None)
            } else {
                Err(AuthRejection::new("unauthorized"))
            }
        }));
        Ok(())
    })
}

/// Sets a custom public-key authentication callback.
pub fn with_public_key_callback<F>(callback: F) -> ServerOption
where
    F: Fn(&ConnInfo, &russh_keys::key::PublicKey) -> AuthOutcome + Send + Sync + 'static,
{
    Box::new(move |config| {
        require_ssh_config(config, "public key auth")?;
        config.public_key_callback = Some(Arc::new(callback));
        Ok(())
    })
}

/// Sets the callback invoked once per authentication attempt.
pub fn with_auth_log_callback<F>(callback: F) -> ServerOption
where
    F: Fn(&ConnInfo, &str, Option<&AuthRejection>) + Send + Sync + 'static,
{
    Box::new(move |config| {
        require_ssh_config(config, "auth logging")?;
        config.auth_log_callback = Some(Arc::new(callback));
        Ok(())
    })
}

/// Accepts connections without client authentication.
pub fn with_no_client_auth() -> ServerOption {
    Box::new(move |config| {
        require_ssh_config(config, "no-auth")?;
        config.no_client_auth = true;
        Ok(())
    })
}

/// Builds a server from the options and serves until shutdown.
///
/// Seeds a default SSH transport configuration and, when no `session`
/// handler was registered, a default one that exits immediately with
/// status 0, so a minimal program only supplies a host key and an auth
/// callback.
pub async fn listen_and_serve(
    addr: impl Into<String>,
    options: impl IntoIterator<Item = ServerOption>,
) -> Result<()> {
    let mut config = Config {
        addr: addr.into(),
        max_deadline: Duration::from_secs(1),
        server_config: Some(russh::server::Config::default()),
        ..Default::default()
    };
    for option in options {
        option(&mut config)?;
    }
    if !config.channel_handlers.contains_key("session") {
        config.channel_handlers.insert(
            "session".to_string(),
            session_channel_handler(session_handler(|_session| async { 0 }), true, false),
        );
    }
    let server = Server::new(config)?;
    server.listen_and_serve().await
}
