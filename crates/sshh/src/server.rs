//! The connection acceptor: deadlined accept loop, admission control, and
//! graceful shutdown.
//!
//! The accept loop is the single owner of the connection registry; all
//! counter math happens on this task. Connection teardown is reported back
//! through a close channel rather than shared counters, so no locking is
//! needed anywhere on the admission path.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::Event;
use crate::handler::{ConnHandler, ServerShared};
use crate::{BoxTransport, Config, ConnectionCallback, Error, Result};

/// Starting accept deadline. Doubles on every idle timeout up to the
/// configured maximum, and resets on any accept or close notification.
const INITIAL_DEADLINE: Duration = Duration::from_millis(5);

/// How long a cancelled connection may keep running to flush its final
/// messages (exit status, channel close) before the transport is dropped.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Teardown report from a connection task to the acceptor.
#[derive(Debug)]
struct CloseNotice {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

/// Open-connection counts, owned exclusively by the accept loop.
#[derive(Debug, Default)]
struct ConnectionRegistry {
    open: usize,
    per_ip: HashMap<IpAddr, usize>,
}

impl ConnectionRegistry {
    fn total(&self) -> usize {
        self.open
    }

    fn count_for(&self, ip: IpAddr) -> usize {
        self.per_ip.get(&ip).copied().unwrap_or(0)
    }

    /// Records an admitted connection, returning the new totals
    /// `(open, per_ip)` so cap crossings can be detected.
    fn acquire(&mut self, ip: IpAddr) -> (usize, usize) {
        self.open += 1;
        let count = self.per_ip.entry(ip).or_insert(0);
        *count += 1;
        (self.open, *count)
    }

    /// Records a closed connection. Counts never go negative; an absent
    /// per-IP entry is ignored.
    fn release(&mut self, ip: IpAddr) {
        self.open = self.open.saturating_sub(1);
        if let Some(count) = self.per_ip.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                self.per_ip.remove(&ip);
            }
        }
    }
}

/// An SSH server: accepts connections, enforces admission caps, and
/// dispatches channels and requests to the configured handlers.
///
/// Construct with [`Server::new`], run with [`Server::listen_and_serve`]
/// (which blocks until shutdown), and stop with [`Server::stop`] from
/// another task.
pub struct Server {
    shared: Arc<ServerShared>,
    ssh_config: Arc<russh::server::Config>,
    connection_callback: Option<ConnectionCallback>,
    addr: String,
    max_connections: usize,
    max_client_connections: usize,
    max_deadline: Duration,
    max_connection_duration: Duration,
    cancel: CancellationToken,
    done: CancellationToken,
    close_tx: mpsc::Sender<CloseNotice>,
    close_rx: Mutex<Option<mpsc::Receiver<CloseNotice>>>,
    signal_rx: Mutex<Option<mpsc::Receiver<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Creates a server from a configuration. Fails when the SSH transport
    /// configuration is absent. The host key, when provided, is installed
    /// into the transport configuration, and a configured public-key
    /// callback is wrapped to inject the `pub-key-*` permission
    /// extensions.
    pub fn new(mut config: Config) -> Result<Self> {
        let mut ssh_config = config.server_config.take().ok_or_else(|| {
            Error::Configuration("ssh server configuration must be provided".to_string())
        })?;

        if config.max_deadline.is_zero() {
            config.max_deadline = Duration::from_secs(1);
        }

        let public_key_callback = config
            .public_key_callback
            .take()
            .map(crate::auth::wrap_public_key_callback);

        let mut methods = russh::MethodSet::empty();
        if public_key_callback.is_some() {
            methods |= russh::MethodSet::PUBLICKEY;
        }
        if config.password_callback.is_some() {
            methods |= russh::MethodSet::PASSWORD;
        }
        if config.no_client_auth || methods.is_empty() {
            methods |= russh::MethodSet::NONE;
        }
        ssh_config.methods = methods;

        if let Some(key) = config.host_key.take() {
            ssh_config.keys.push(key);
        }
        if ssh_config.keys.is_empty() {
            warn!("no host key configured, handshakes will fail");
        }

        let shared = Arc::new(ServerShared {
            channel_handlers: config.channel_handlers,
            request_handlers: config.request_handlers,
            event_handler: config.event_handler,
            password_callback: config.password_callback,
            public_key_callback,
            auth_log_callback: config.auth_log_callback,
            no_client_auth: config.no_client_auth,
        });

        let (close_tx, close_rx) = mpsc::channel(1);

        Ok(Self {
            shared,
            ssh_config: Arc::new(ssh_config),
            connection_callback: config.connection_callback,
            addr: config.addr,
            max_connections: config.max_connections,
            max_client_connections: config.max_client_connections,
            max_deadline: config.max_deadline,
            max_connection_duration: config.max_connection_duration,
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            close_tx,
            close_rx: Mutex::new(Some(close_rx)),
            signal_rx: Mutex::new(config.signal_rx),
            local_addr: Mutex::new(None),
        })
    }

    /// The resolved listen address, available once the listener is bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Requests shutdown and waits for the accept loop to drain every open
    /// connection.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.done.cancelled().await;
    }

    /// Binds the listener and serves until shutdown. Address resolution
    /// and bind errors are returned synchronously; otherwise this blocks
    /// until the accept loop has drained after [`Server::stop`], a signal
    /// on the configured signal channel, or cancellation.
    pub async fn listen_and_serve(&self) -> Result<()> {
        let result = self.listen_inner().await;
        self.done.cancel();
        result
    }

    async fn listen_inner(&self) -> Result<()> {
        let mut close_rx = self
            .close_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Configuration("server is already running".to_string()))?;
        let mut signal_rx = self.signal_rx.lock().take();

        self.shared.emit(Event::ServerStarted);

        let requested = if self.addr.is_empty() {
            ":22".to_string()
        } else {
            self.addr.clone()
        };
        // A bare ":port" binds all interfaces.
        let requested = if requested.starts_with(':') {
            format!("0.0.0.0{requested}")
        } else {
            requested
        };
        let addr = tokio::net::lookup_host(requested.as_str())
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| Error::InvalidAddress(requested.clone()))?;

        let listener = TcpListener::bind(addr).await?;
        let listener_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(listener_addr);
        self.shared.emit(Event::ListenerOpened {
            addr: listener_addr,
        });
        info!(addr = %listener_addr, "listening");

        self.accept_loop(listener, listener_addr, &mut close_rx, &mut signal_rx)
            .await;
        Ok(())
    }

    async fn accept_loop(
        &self,
        listener: TcpListener,
        listener_addr: SocketAddr,
        close_rx: &mut mpsc::Receiver<CloseNotice>,
        signal_rx: &mut Option<mpsc::Receiver<()>>,
    ) {
        let mut registry = ConnectionRegistry::default();
        let mut deadline = INITIAL_DEADLINE;

        loop {
            if deadline > self.max_deadline {
                deadline = self.max_deadline;
            }

            // Shutdown, signals, and close notifications take precedence
            // when ready; otherwise a deadlined accept keeps the loop
            // responsive without spinning.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = recv_shutdown_signal(signal_rx) => {
                    info!("shutdown signal received");
                    self.cancel.cancel();
                    *signal_rx = None;
                }
                notice = close_rx.recv() => {
                    if let Some(notice) = notice {
                        registry.release(notice.remote_addr.ip());
                        deadline = INITIAL_DEADLINE;
                        self.shared.emit(Event::ConnectionClosed {
                            local_addr: notice.local_addr,
                            remote_addr: notice.remote_addr,
                        });
                    }
                }
                accepted = tokio::time::timeout(deadline, listener.accept()) => match accepted {
                    Err(_) => {
                        // Idle: back off to keep an unloaded server cheap.
                        deadline = deadline.saturating_mul(2);
                    }
                    Ok(Err(error)) => {
                        self.shared.emit(Event::ConnectionFailed {
                            error: error.to_string(),
                        });
                    }
                    Ok(Ok((stream, remote_addr))) => {
                        deadline = INITIAL_DEADLINE;
                        self.admit(stream, remote_addr, listener_addr, &mut registry);
                    }
                },
            }
        }

        self.shared.emit(Event::ServerStopped);
        drop(listener);
        self.shared.emit(Event::ListenerClosed);

        // Drain: every admitted connection reports back exactly once.
        while registry.total() > 0 {
            match close_rx.recv().await {
                Some(notice) => {
                    registry.release(notice.remote_addr.ip());
                    self.shared.emit(Event::ConnectionClosed {
                        local_addr: notice.local_addr,
                        remote_addr: notice.remote_addr,
                    });
                }
                None => break,
            }
        }
    }

    fn admit(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
        listener_addr: SocketAddr,
        registry: &mut ConnectionRegistry,
    ) {
        let local_addr = stream.local_addr().unwrap_or(listener_addr);
        let ip = remote_addr.ip();

        if self.max_connections > 0 && registry.total() >= self.max_connections {
            debug!(remote = %remote_addr, "refusing connection, server at capacity");
            drop(stream);
            self.shared.emit(Event::ConnectionClosed {
                local_addr,
                remote_addr,
            });
            return;
        }

        if self.max_client_connections > 0 && registry.count_for(ip) >= self.max_client_connections
        {
            debug!(remote = %remote_addr, "refusing connection, client at capacity");
            drop(stream);
            self.shared.emit(Event::ConnectionClosed {
                local_addr,
                remote_addr,
            });
            return;
        }

        let (open, per_ip) = registry.acquire(ip);
        if self.max_connections > 0 && open == self.max_connections {
            self.shared.emit(Event::MaxConnections);
        }
        if self.max_client_connections > 0 && per_ip == self.max_client_connections {
            self.shared.emit(Event::MaxClientConnections {
                local_addr,
                remote_addr,
            });
        }

        self.shared.emit(Event::ConnectionOpened {
            local_addr,
            remote_addr,
        });

        let task = ConnectionTask {
            shared: self.shared.clone(),
            ssh_config: self.ssh_config.clone(),
            connection_callback: self.connection_callback.clone(),
            cancel: self.cancel.clone(),
            close_tx: self.close_tx.clone(),
            max_duration: self.max_connection_duration,
        };
        tokio::spawn(task.run(stream, local_addr, remote_addr));
    }
}

/// Everything a connection task needs, detached from the server borrow.
struct ConnectionTask {
    shared: Arc<ServerShared>,
    ssh_config: Arc<russh::server::Config>,
    connection_callback: Option<ConnectionCallback>,
    cancel: CancellationToken,
    close_tx: mpsc::Sender<CloseNotice>,
    max_duration: Duration,
}

impl ConnectionTask {
    async fn run(self, stream: TcpStream, local_addr: SocketAddr, remote_addr: SocketAddr) {
        let conn_cancel = self.cancel.child_token();
        let authenticated = Arc::new(AtomicBool::new(false));
        let handler = ConnHandler::new(
            self.shared.clone(),
            local_addr,
            remote_addr,
            conn_cancel.clone(),
            authenticated.clone(),
        );

        let transport: BoxTransport = match &self.connection_callback {
            Some(callback) => callback(stream),
            None => Box::new(stream),
        };

        let result = self.drive(transport, handler, &conn_cancel).await;
        if authenticated.load(Ordering::SeqCst) {
            if let Err(error) = result {
                debug!(remote = %remote_addr, %error, "connection ended with error");
            }
        } else {
            let error = match result {
                Err(error) => error.to_string(),
                Ok(()) => "connection closed before authentication".to_string(),
            };
            self.shared.emit(Event::HandshakeFailed {
                local_addr,
                remote_addr,
                error,
            });
        }

        let _ = self
            .close_tx
            .send(CloseNotice {
                local_addr,
                remote_addr,
            })
            .await;
    }

    async fn drive(
        &self,
        transport: BoxTransport,
        handler: ConnHandler,
        conn_cancel: &CancellationToken,
    ) -> Result<()> {
        let session =
            russh::server::run_stream(self.ssh_config.clone(), transport, handler).await?;
        tokio::pin!(session);

        tokio::select! {
            result = &mut session => {
                result?;
                Ok(())
            }
            _ = conn_cancel.cancelled() => {
                // Session exit or server shutdown: let the transport flush
                // its final messages before the connection drops.
                let _ = tokio::time::timeout(CLOSE_GRACE, &mut session).await;
                Ok(())
            }
            _ = hard_deadline(self.max_duration) => {
                debug!("connection reached maximum duration");
                Ok(())
            }
        }
    }
}

/// Resolves when the hard connection lifetime elapses; never when the
/// lifetime is unlimited.
async fn hard_deadline(duration: Duration) {
    if duration.is_zero() {
        std::future::pending::<()>().await
    } else {
        tokio::time::sleep(duration).await
    }
}

/// Resolves when the caller-supplied signal channel yields (or closes);
/// never when no channel is configured.
async fn recv_shutdown_signal(rx: &mut Option<mpsc::Receiver<()>>) {
    match rx.as_mut() {
        Some(rx) => {
            rx.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}
