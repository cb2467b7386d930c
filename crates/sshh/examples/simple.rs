//! Minimal embedding: a host key, password auth, and a greeting.
//!
//! Connect with `ssh admin@127.0.0.1 -p 9022` (password: `password`).

use russh_keys::key::KeyPair;
use sshh::{
    listen_and_serve, session_channel_handler, session_handler, tracing_event_handler,
    with_channel_handler, with_event_handler, with_host_key, with_max_deadline,
    with_password_auth, with_signal_channel,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> sshh::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Ctrl-C triggers graceful shutdown through the signal channel.
    let (signal_tx, signal_rx) = tokio::sync::mpsc::channel(1);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = signal_tx.send(()).await;
    });

    listen_and_serve(
        "127.0.0.1:9022",
        [
            with_host_key(KeyPair::generate_ed25519().expect("failed to generate host key")),
            with_max_deadline(Duration::from_secs(5)),
            with_password_auth("admin", "password"),
            with_signal_channel(signal_rx),
            with_event_handler(tracing_event_handler()),
            with_channel_handler(
                "session",
                session_channel_handler(
                    session_handler(|session| async move {
                        let _ = session.write_string(&format!(
                            "\r\nNice job, {}! You are connected!\r\n",
                            session.user()
                        ));
                        0
                    }),
                    true,
                    false,
                ),
            ),
        ],
    )
    .await
}
