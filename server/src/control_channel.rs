//! Control socket listener: one command line, one response, close. Commands run in
//! isolation per connection; shutdown requests are handed to the daemon loop through a
//! channel so the response reaches the CLI before the process exits.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use common::config::{Config, ReloadOutcome};
use common::control;

/// Sent to the daemon loop when a shutdown command is accepted.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownRequest {
    pub with_sessions: bool,
}

/// Reading the single command line must not hang the handler forever.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind the control socket and serve commands until the daemon exits. A stale socket
/// file must already be cleared by the caller (after probing it for a live daemon).
pub fn spawn(
    socket_path: PathBuf,
    config: Arc<RwLock<Config>>,
    shutdown_tx: mpsc::Sender<ShutdownRequest>,
) -> std::io::Result<()> {
    let listener = UnixListener::bind(&socket_path)?;
    println!("[ttymux] control socket at {}", socket_path.display());
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let config = config.clone();
                    let shutdown_tx = shutdown_tx.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, config, shutdown_tx).await;
                    });
                }
                Err(e) => {
                    eprintln!("[ttymux] control socket accept failed: {e}");
                    break;
                }
            }
        }
    });
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    config: Arc<RwLock<Config>>,
    shutdown_tx: mpsc::Sender<ShutdownRequest>,
) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line)).await;
    if !matches!(read, Ok(Ok(n)) if n > 0) {
        return;
    }
    let command = line.trim();
    let response = match command {
        control::CMD_PING => control::RESP_PONG.to_string(),
        control::CMD_SHUTDOWN => {
            let _ = shutdown_tx.send(ShutdownRequest { with_sessions: false }).await;
            control::RESP_OK.to_string()
        }
        control::CMD_SHUTDOWN_WITH_SESSIONS => {
            let _ = shutdown_tx.send(ShutdownRequest { with_sessions: true }).await;
            control::RESP_OK.to_string()
        }
        control::CMD_RELOAD => reload_response(&config),
        other => {
            eprintln!("[ttymux] unrecognized control command: {other:?}");
            control::RESP_ERROR.to_string()
        }
    };
    let mut stream = reader.into_inner();
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Re-read settings.json, apply the live fields, and report the split. The swapped-in
/// config is visible to the next session start through the shared handle.
fn reload_response(config: &Arc<RwLock<Config>>) -> String {
    let current = config.read().expect("config lock").clone();
    let (applied, outcome) = current.reload();
    *config.write().expect("config lock") = applied;
    if !outcome.reloaded.is_empty() {
        println!("[ttymux] reloaded: {}", outcome.reloaded.join(", "));
    }
    if !outcome.requires_restart.is_empty() {
        println!(
            "[ttymux] restart required for: {}",
            outcome.requires_restart.join(", ")
        );
    }
    serde_json::to_string(&outcome).unwrap_or_else(|e| {
        let fallback = ReloadOutcome {
            success: false,
            reloaded: vec![],
            requires_restart: vec![],
            error: Some(e.to_string()),
        };
        serde_json::to_string(&fallback).unwrap_or_else(|_| control::RESP_ERROR.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        socket: PathBuf,
        shutdown_rx: mpsc::Receiver<ShutdownRequest>,
        config: Arc<RwLock<Config>>,
        _home: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let home = tempfile::tempdir().unwrap();
        let config = Arc::new(RwLock::new(Config::load(home.path())));
        let socket = home.path().join("control.sock");
        let (tx, rx) = mpsc::channel(4);
        spawn(socket.clone(), config.clone(), tx).unwrap();
        Fixture {
            socket,
            shutdown_rx: rx,
            config,
            _home: home,
        }
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let fx = fixture();
        assert!(control::ping(&fx.socket).await);
    }

    #[tokio::test]
    async fn unrecognized_command_gets_error_token() {
        let fx = fixture();
        use tokio::io::AsyncReadExt;
        let mut stream = UnixStream::connect(&fx.socket).await.unwrap();
        stream.write_all(b"self-destruct\n").await.unwrap();
        let mut resp = String::new();
        stream.read_to_string(&mut resp).await.unwrap();
        assert_eq!(resp.trim(), control::RESP_ERROR);
    }

    #[tokio::test]
    async fn shutdown_with_sessions_reaches_daemon_loop() {
        let mut fx = fixture();
        control::shutdown(&fx.socket, true).await.unwrap();
        let req = fx.shutdown_rx.recv().await.unwrap();
        assert!(req.with_sessions);
    }

    #[tokio::test]
    async fn plain_shutdown_leaves_sessions_alone() {
        let mut fx = fixture();
        control::shutdown(&fx.socket, false).await.unwrap();
        let req = fx.shutdown_rx.recv().await.unwrap();
        assert!(!req.with_sessions);
    }

    #[tokio::test]
    async fn reload_applies_live_fields() {
        let fx = fixture();
        let home = fx.config.read().unwrap().home_dir.clone();
        std::fs::write(
            home.join("settings.json"),
            r#"{ "inject_ime_helper": false }"#,
        )
        .unwrap();
        let outcome = control::reload(&fx.socket).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.reloaded, ["inject_ime_helper"]);
        assert!(!fx.config.read().unwrap().inject_ime_helper);
    }
}
