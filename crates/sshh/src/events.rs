//! Typed server events.
//!
//! Every observable state change on the server is reported through a single
//! [`EventHandler`]. The handler is invoked from the accept loop and from
//! connection tasks, so it must be non-blocking: a handler that blocks
//! stalls server progress. The framework does not persist events.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

/// Snapshot of an authenticated connection, attached to request and channel
/// events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInfo {
    /// Username supplied during authentication.
    pub user: String,
    /// Server side of the connection.
    pub local_addr: SocketAddr,
    /// Client side of the connection.
    pub remote_addr: SocketAddr,
}

/// An event emitted by the server.
#[derive(Debug, Clone)]
pub enum Event {
    /// `listen_and_serve` was called, before the listener exists.
    ServerStarted,
    /// The server is stopping, before open connections have drained.
    ServerStopped,
    /// The TCP listener is bound and accepting.
    ListenerOpened { addr: SocketAddr },
    /// The TCP listener was closed.
    ListenerClosed,
    /// A connection was admitted.
    ConnectionOpened {
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    },
    /// A connection was closed, or refused by admission control.
    ConnectionClosed {
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    },
    /// An accept attempt failed with a non-timeout error.
    ConnectionFailed { error: String },
    /// The open-connection count just reached the global cap.
    MaxConnections,
    /// A client's connection count just reached the per-IP cap.
    MaxClientConnections {
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    },
    /// The SSH handshake and authentication completed.
    HandshakeSuccessful {
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    },
    /// The SSH handshake failed; the connection terminates.
    HandshakeFailed {
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        error: String,
    },
    /// A global request was dispatched to a registered handler.
    Request {
        conn: ConnInfo,
        request_type: String,
    },
    /// A global request arrived with no registered handler.
    UnknownRequest {
        conn: ConnInfo,
        request_type: String,
    },
    /// A channel open was dispatched to a registered handler.
    Channel {
        conn: ConnInfo,
        channel_type: String,
    },
    /// A channel open arrived with no registered handler; it was rejected.
    UnknownChannel {
        conn: ConnInfo,
        channel_type: String,
    },
}

/// Receives server events. Must be non-blocking and safe to call from any
/// task.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// An event handler that logs every event through `tracing`.
pub fn tracing_event_handler() -> EventHandler {
    Arc::new(|event: &Event| match event {
        Event::ServerStarted => info!("server started"),
        Event::ServerStopped => info!("server stopped"),
        Event::ListenerOpened { addr } => info!(%addr, "listener opened"),
        Event::ListenerClosed => info!("listener closed"),
        Event::ConnectionOpened {
            local_addr,
            remote_addr,
        } => info!(local = %local_addr, remote = %remote_addr, "connection opened"),
        Event::ConnectionClosed {
            local_addr,
            remote_addr,
        } => info!(local = %local_addr, remote = %remote_addr, "connection closed"),
        Event::ConnectionFailed { error } => warn!(%error, "connection failed"),
        Event::MaxConnections => warn!("connection limit reached"),
        Event::MaxClientConnections {
            local_addr,
            remote_addr,
        } => warn!(local = %local_addr, remote = %remote_addr, "client connection limit reached"),
        Event::HandshakeSuccessful {
            local_addr,
            remote_addr,
        } => info!(local = %local_addr, remote = %remote_addr, "handshake successful"),
        Event::HandshakeFailed {
            local_addr,
            remote_addr,
            error,
        } => warn!(local = %local_addr, remote = %remote_addr, %error, "handshake failed"),
        Event::Request { conn, request_type } => {
            debug!(user = %conn.user, remote = %conn.remote_addr, %request_type, "global request")
        }
        Event::UnknownRequest { conn, request_type } => {
            debug!(user = %conn.user, remote = %conn.remote_addr, %request_type, "unknown global request")
        }
        Event::Channel { conn, channel_type } => {
            debug!(user = %conn.user, remote = %conn.remote_addr, %channel_type, "channel opened")
        }
        Event::UnknownChannel { conn, channel_type } => {
            debug!(user = %conn.user, remote = %conn.remote_addr, %channel_type, "unknown channel type")
        }
    })
}
