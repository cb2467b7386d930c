//! Bridge between the SSH transport and the framework's dispatch maps.
//!
//! One [`ConnHandler`] exists per connection. The transport delivers
//! authentication attempts, channel opens, and channel requests to it; the
//! bridge routes them through the configured handler maps and drives the
//! per-channel session state machine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use russh::server::{Auth, Handler as TransportHandler, Msg, Session as TransportSession};
use russh::{Channel, ChannelId, Sig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::auth::{AuthLogCallback, AuthRejection, PasswordCallback, Permissions, PublicKeyCallback};
use crate::events::{ConnInfo, Event, EventHandler};
use crate::pty::{Pty, TerminalMode, Window};
use crate::session::{
    Session, SessionChannelHandler, SessionOutput, SessionShared, SignalCmd, run_signal_router,
};
use crate::signal::Signal;
use crate::{ChannelHandler, ChannelOpen, Error, GlobalRequest, RequestHandler};

/// Client input buffered per channel before the handler reads it.
const INPUT_BUFFER: usize = 1024;

/// Immutable per-server state shared by every connection.
pub(crate) struct ServerShared {
    pub(crate) channel_handlers: HashMap<String, ChannelHandler>,
    pub(crate) request_handlers: HashMap<String, Arc<dyn RequestHandler>>,
    pub(crate) event_handler: Option<EventHandler>,
    pub(crate) password_callback: Option<PasswordCallback>,
    pub(crate) public_key_callback: Option<PublicKeyCallback>,
    pub(crate) auth_log_callback: Option<AuthLogCallback>,
    pub(crate) no_client_auth: bool,
}

impl ServerShared {
    pub(crate) fn emit(&self, event: Event) {
        if let Some(handler) = &self.event_handler {
            handler(&event);
        }
    }
}

/// Per-channel state for the session request machine.
struct ChannelState {
    config: SessionChannelHandler,
    shared: Arc<SessionShared>,
    env: Vec<String>,
    output_tx: mpsc::UnboundedSender<SessionOutput>,
    signal_tx: mpsc::UnboundedSender<SignalCmd>,
    winch_rx: Option<mpsc::UnboundedReceiver<Window>>,
    input_tx: mpsc::Sender<Vec<u8>>,
    input_rx: Option<mpsc::Receiver<Vec<u8>>>,
}

/// Transport handler for a single connection.
pub(crate) struct ConnHandler {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    conn_cancel: CancellationToken,
    authenticated: Arc<AtomicBool>,
    user: Option<String>,
    permissions: Option<Permissions>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl ConnHandler {
    pub(crate) fn new(
        shared: Arc<ServerShared>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        conn_cancel: CancellationToken,
        authenticated: Arc<AtomicBool>,
    ) -> Self {
        Self {
            shared,
            local_addr,
            remote_addr,
            conn_cancel,
            authenticated,
            user: None,
            permissions: None,
            channels: HashMap::new(),
        }
    }

    fn conn_info(&self, user: &str) -> ConnInfo {
        ConnInfo {
            user: user.to_string(),
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
        }
    }

    fn authed_conn_info(&self) -> ConnInfo {
        self.conn_info(self.user.as_deref().unwrap_or_default())
    }

    fn log_auth(&self, conn: &ConnInfo, method: &str, rejection: Option<&AuthRejection>) {
        if let Some(log) = &self.shared.auth_log_callback {
            log(conn, method, rejection);
        }
    }

    fn accept_auth(&mut self, conn: ConnInfo, permissions: Option<Permissions>) -> Auth {
        self.user = Some(conn.user);
        self.permissions = permissions;
        if !self.authenticated.swap(true, Ordering::SeqCst) {
            self.shared.emit(Event::HandshakeSuccessful {
                local_addr: self.local_addr,
                remote_addr: self.remote_addr,
            });
        }
        Auth::Accept
    }

    fn reject_auth() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
        }
    }

    /// Marks the channel handled and spawns the user handler, exactly once
    /// per channel across racing `shell` and `exec` requests. Returns the
    /// reply for the request.
    fn start_session(&mut self, channel: ChannelId, command: Vec<String>) -> bool {
        let conn = self.authed_conn_info();
        let permissions = self.permissions.clone();
        let cancel = self.conn_cancel.child_token();
        let Some(state) = self.channels.get_mut(&channel) else {
            return false;
        };
        if !state.shared.mark_handled() {
            return false;
        }

        let session = Session::new(
            conn,
            state.env.clone(),
            command,
            permissions,
            state.shared.clone(),
            state.output_tx.clone(),
            state.signal_tx.clone(),
            state.winch_rx.take(),
            state.input_rx.take(),
            cancel,
        );
        let handler = state.config.handler.clone();
        tokio::spawn(async move {
            let code = handler(session.clone()).await;
            // No-op when the handler already called exit itself.
            let _ = session.exit(code);
        });
        true
    }
}

#[async_trait]
impl TransportHandler for ConnHandler {
    type Error = Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        let conn = self.conn_info(user);
        if self.shared.no_client_auth {
            self.log_auth(&conn, "none", None);
            return Ok(self.accept_auth(conn, None));
        }
        let rejection = AuthRejection::new("authentication required");
        self.log_auth(&conn, "none", Some(&rejection));
        Ok(Self::reject_auth())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let conn = self.conn_info(user);
        let Some(callback) = self.shared.password_callback.clone() else {
            let rejection = AuthRejection::new("password authentication not configured");
            self.log_auth(&conn, "password", Some(&rejection));
            return Ok(Self::reject_auth());
        };
        match callback(&conn, password) {
            Ok(permissions) => {
                self.log_auth(&conn, "password", None);
                debug!(user, remote = %self.remote_addr, "password auth accepted");
                Ok(self.accept_auth(conn, permissions))
            }
            Err(rejection) => {
                self.log_auth(&conn, "password", Some(&rejection));
                debug!(user, remote = %self.remote_addr, reason = %rejection, "password auth rejected");
                Ok(Self::reject_auth())
            }
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh_keys::key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let conn = self.conn_info(user);
        let Some(callback) = self.shared.public_key_callback.clone() else {
            let rejection = AuthRejection::new("public key authentication not configured");
            self.log_auth(&conn, "publickey", Some(&rejection));
            return Ok(Self::reject_auth());
        };
        match callback(&conn, public_key) {
            Ok(permissions) => {
                self.log_auth(&conn, "publickey", None);
                debug!(user, key_type = public_key.name(), "public key auth accepted");
                Ok(self.accept_auth(conn, permissions))
            }
            Err(rejection) => {
                self.log_auth(&conn, "publickey", Some(&rejection));
                debug!(user, key_type = public_key.name(), reason = %rejection, "public key auth rejected");
                Ok(Self::reject_auth())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut TransportSession,
    ) -> Result<bool, Self::Error> {
        let conn = self.authed_conn_info();
        let Some(registered) = self.shared.channel_handlers.get("session") else {
            self.shared.emit(Event::UnknownChannel {
                conn,
                channel_type: "session".to_string(),
            });
            return Ok(false);
        };
        self.shared.emit(Event::Channel {
            conn: conn.clone(),
            channel_type: "session".to_string(),
        });

        match registered {
            ChannelHandler::Raw(handler) => {
                let handler = handler.clone();
                let cancel = self.conn_cancel.child_token();
                tokio::spawn(async move {
                    handler
                        .handle_channel(conn, ChannelOpen::Session, channel, cancel)
                        .await;
                });
            }
            ChannelHandler::Session(config) => {
                let channel_id = channel.id();
                debug!(channel = ?channel_id, user = %conn.user, "session channel opened");

                let (output_tx, output_rx) = mpsc::unbounded_channel();
                let (signal_tx, signal_rx) = mpsc::unbounded_channel();
                let (input_tx, input_rx) = mpsc::channel(INPUT_BUFFER);

                tokio::spawn(run_signal_router(signal_rx));
                tokio::spawn(run_output_pump(
                    channel,
                    session.handle(),
                    channel_id,
                    output_rx,
                    self.conn_cancel.clone(),
                ));

                self.channels.insert(
                    channel_id,
                    ChannelState {
                        config: config.clone(),
                        shared: Arc::new(SessionShared::new()),
                        env: Vec::new(),
                        output_tx,
                        signal_tx,
                        winch_rx: None,
                        input_tx,
                        input_rx: Some(input_rx),
                    },
                );
            }
        }
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut TransportSession,
    ) -> Result<bool, Self::Error> {
        let conn = self.authed_conn_info();
        match self.shared.channel_handlers.get("direct-tcpip") {
            Some(ChannelHandler::Raw(handler)) => {
                self.shared.emit(Event::Channel {
                    conn: conn.clone(),
                    channel_type: "direct-tcpip".to_string(),
                });
                let handler = handler.clone();
                let cancel = self.conn_cancel.child_token();
                let open = ChannelOpen::DirectTcpip {
                    host_to_connect: host_to_connect.to_string(),
                    port_to_connect,
                    originator_address: originator_address.to_string(),
                    originator_port,
                };
                tokio::spawn(async move {
                    handler.handle_channel(conn, open, channel, cancel).await;
                });
                Ok(true)
            }
            _ => {
                self.shared.emit(Event::UnknownChannel {
                    conn,
                    channel_type: "direct-tcpip".to_string(),
                });
                Ok(false)
            }
        }
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        let Some(state) = self.channels.get_mut(&channel) else {
            session.channel_failure(channel);
            return Ok(());
        };
        if state.shared.is_handled() {
            session.channel_failure(channel);
            return Ok(());
        }
        trace!(channel = ?channel, name = variable_name, "env request");
        state.env.push(format!("{variable_name}={variable_value}"));
        session.channel_success(channel);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(TerminalMode, u32)],
        session: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        let Some(state) = self.channels.get_mut(&channel) else {
            session.channel_failure(channel);
            return Ok(());
        };
        if !state.config.allow_pty || state.shared.is_handled() || state.shared.pty.read().is_some() {
            session.channel_failure(channel);
            return Ok(());
        }

        debug!(
            channel = ?channel,
            term,
            cols = col_width,
            rows = row_height,
            "pty request"
        );
        let window = Window {
            cols: col_width,
            rows: row_height,
            width_px: pix_width,
            height_px: pix_height,
        };
        *state.shared.pty.write() = Some(Pty {
            term: term.to_string(),
            window,
            modes: modes.to_vec(),
        });

        // The window stream always carries the initial window.
        let (winch_tx, winch_rx) = mpsc::unbounded_channel();
        let _ = winch_tx.send(window);
        *state.shared.winch_tx.lock() = Some(winch_tx);
        state.winch_rx = Some(winch_rx);

        session.channel_success(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        let Some(state) = self.channels.get_mut(&channel) else {
            session.channel_failure(channel);
            return Ok(());
        };
        let window = Window {
            cols: col_width,
            rows: row_height,
            width_px: pix_width,
            height_px: pix_height,
        };
        {
            let mut guard = state.shared.pty.write();
            let Some(pty) = guard.as_mut() else {
                drop(guard);
                session.channel_failure(channel);
                return Ok(());
            };
            pty.window = window;
        }
        if let Some(tx) = state.shared.winch_tx.lock().as_ref() {
            let _ = tx.send(window);
        }
        session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        if self.start_session(channel, Vec::new()) {
            session.channel_success(channel);
        } else {
            session.channel_failure(channel);
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        // A command that fails shell-splitting runs with an empty command
        // vector rather than failing the request.
        let command = shlex::split(&String::from_utf8_lossy(data)).unwrap_or_default();
        debug!(channel = ?channel, ?command, "exec request");
        if self.start_session(channel, command) {
            session.channel_success(channel);
        } else {
            session.channel_failure(channel);
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        debug!(channel = ?channel, subsystem = name, "subsystem refused");
        session.channel_failure(channel);
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal_name: Sig,
        _session: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            match Signal::from_sig(&signal_name) {
                Some(signal) => {
                    trace!(channel = ?channel, %signal, "client signal");
                    let _ = state.signal_tx.send(SignalCmd::Deliver(signal));
                }
                None => trace!(channel = ?channel, ?signal_name, "unknown signal dropped"),
            }
        }
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        _session: &mut TransportSession,
    ) -> Result<bool, Self::Error> {
        let Some(state) = self.channels.get(&channel) else {
            return Ok(false);
        };
        if state.config.allow_agent_forwarding {
            state.shared.agent_requested.store(true, Ordering::SeqCst);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            if let Err(mpsc::error::TrySendError::Full(_)) = state.input_tx.try_send(data.to_vec())
            {
                warn!(channel = ?channel, "input buffer full, dropping data");
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        trace!(channel = ?channel, "channel eof");
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        trace!(channel = ?channel, "channel closed");
        self.channels.remove(&channel);
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut TransportSession,
    ) -> Result<bool, Self::Error> {
        let conn = self.authed_conn_info();
        let Some(handler) = self.shared.request_handlers.get("tcpip-forward") else {
            self.shared.emit(Event::UnknownRequest {
                conn,
                request_type: "tcpip-forward".to_string(),
            });
            return Ok(false);
        };
        self.shared.emit(Event::Request {
            conn: conn.clone(),
            request_type: "tcpip-forward".to_string(),
        });
        let mut request = GlobalRequest::TcpipForward {
            address: address.to_string(),
            port: *port,
        };
        let ok = handler.handle_request(&conn, &mut request).await;
        if let GlobalRequest::TcpipForward { port: bound, .. } = request {
            *port = bound;
        }
        Ok(ok)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut TransportSession,
    ) -> Result<bool, Self::Error> {
        let conn = self.authed_conn_info();
        let Some(handler) = self.shared.request_handlers.get("cancel-tcpip-forward") else {
            self.shared.emit(Event::UnknownRequest {
                conn,
                request_type: "cancel-tcpip-forward".to_string(),
            });
            return Ok(false);
        };
        self.shared.emit(Event::Request {
            conn: conn.clone(),
            request_type: "cancel-tcpip-forward".to_string(),
        });
        let mut request = GlobalRequest::CancelTcpipForward {
            address: address.to_string(),
            port,
        };
        Ok(handler.handle_request(&conn, &mut request).await)
    }
}

/// Forwards session output to the channel. On exit, delivers the status as
/// a 4-byte big-endian `exit-status` request, closes the channel, then
/// closes the parent connection.
async fn run_output_pump(
    channel: Channel<Msg>,
    handle: russh::server::Handle,
    channel_id: ChannelId,
    mut output_rx: mpsc::UnboundedReceiver<SessionOutput>,
    conn_cancel: CancellationToken,
) {
    while let Some(msg) = output_rx.recv().await {
        match msg {
            SessionOutput::Stdout(data) => {
                let _ = channel.data(&data[..]).await;
            }
            SessionOutput::Stderr(data) => {
                let _ = channel.extended_data(1, &data[..]).await;
            }
            SessionOutput::Exit(code) => {
                let _ = handle.exit_status_request(channel_id, code).await;
                let _ = channel.close().await;
                conn_cancel.cancel();
                break;
            }
        }
    }
    trace!(channel = ?channel_id, "output pump finished");
}
