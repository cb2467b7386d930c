//! Interactive echo shell demonstrating PTY, window-change, and signal
//! handling on the session surface.
//!
//! Connect with `ssh admin@127.0.0.1 -p 9022` (password: `password`).
//! Typed lines are echoed back; `exit` or `quit` ends the session, as does
//! sending INT or TERM.

use russh_keys::key::KeyPair;
use sshh::{Config, Server, Session, Signal, session_channel_handler, session_handler};
use std::collections::HashMap;
use std::time::Duration;

const PROMPT: &str = ">>> ";

async fn shell(session: Session) -> i32 {
    let Some(pty) = session.pty() else {
        let _ = session.write_string("an interactive terminal is required\r\n");
        return 1;
    };
    let mut windows = session
        .window_changes()
        .expect("window stream follows the pty");
    // The stream is seeded with the window from the pty request.
    let window = windows.recv().await.unwrap_or(pty.window);

    let (signal_tx, mut signal_rx) = tokio::sync::mpsc::channel(16);
    session.signals(Some(signal_tx));

    let _ = session.write_string(&format!(
        "\r\nWelcome, {}! term={} ({}x{})\r\n{PROMPT}",
        session.user(),
        pty.term,
        window.cols,
        window.rows
    ));

    let mut line = String::new();
    loop {
        tokio::select! {
            _ = session.cancelled() => return 0,
            signal = signal_rx.recv() => match signal {
                Some(Signal::Int) | Some(Signal::Term) | None => {
                    let _ = session.write_string("\r\nGoodbye!\r\n");
                    return 0;
                }
                Some(other) => {
                    let _ = session.write_string(&format!("\r\n[signal {other}]\r\n{PROMPT}"));
                }
            },
            window = windows.recv() => {
                if let Some(window) = window {
                    let _ = session.write_string(&format!(
                        "\r\n[resize {}x{}]\r\n{PROMPT}",
                        window.cols, window.rows
                    ));
                }
            }
            input = session.recv() => {
                let Some(input) = input else { return 0 };
                for byte in input {
                    match byte {
                        b'\r' | b'\n' => {
                            let entered = line.trim().to_string();
                            line.clear();
                            if entered == "exit" || entered == "quit" {
                                let _ = session.write_string("\r\nGoodbye!\r\n");
                                return 0;
                            }
                            if entered.is_empty() {
                                let _ = session.write_string(&format!("\r\n{PROMPT}"));
                            } else {
                                let _ = session.write_string(&format!("\r\n{entered}\r\n{PROMPT}"));
                            }
                        }
                        // Backspace
                        0x7f | 0x08 => {
                            if line.pop().is_some() {
                                let _ = session.write(b"\x08 \x08");
                            }
                        }
                        b' '..=b'~' => {
                            line.push(byte as char);
                            let _ = session.write(&[byte]);
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> sshh::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let (signal_tx, signal_rx) = tokio::sync::mpsc::channel(1);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = signal_tx.send(()).await;
    });

    let mut channel_handlers = HashMap::new();
    channel_handlers.insert(
        "session".to_string(),
        session_channel_handler(session_handler(shell), true, false),
    );

    let server = Server::new(Config {
        addr: "127.0.0.1:9022".to_string(),
        max_deadline: Duration::from_secs(5),
        host_key: Some(KeyPair::generate_ed25519().expect("failed to generate host key")),
        signal_rx: Some(signal_rx),
        event_handler: Some(sshh::tracing_event_handler()),
        channel_handlers,
        password_callback: Some(std::sync::Arc::new(|conn: &sshh::ConnInfo, password: &str| {
            if conn.user == "admin" && password == "password" {
                Ok(None)
            } else {
                Err(sshh::AuthRejection::new("invalid username or password"))
            }
        })),
        server_config: Some(sshh::russh::server::Config::default()),
        ..Default::default()
    })?;

    server.listen_and_serve().await
}
