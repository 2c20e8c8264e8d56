//! Control socket protocol: a unix socket next to state.json, one command line and one
//! response per connection. The CLI side lives here; the listener lives in the server
//! crate. `ping` probes resolve to "not running" instead of erroring, so callers can
//! branch on liveness without a failure path.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::config::ReloadOutcome;

pub const CMD_PING: &str = "ping";
pub const CMD_SHUTDOWN: &str = "shutdown";
pub const CMD_SHUTDOWN_WITH_SESSIONS: &str = "shutdown-with-sessions";
pub const CMD_RELOAD: &str = "reload";

pub const RESP_PONG: &str = "pong";
pub const RESP_OK: &str = "ok";
/// Generic failure token for unrecognized commands.
pub const RESP_ERROR: &str = "error";

/// Ping is a quick liveness probe; general commands may stop sessions first.
pub const PING_TIMEOUT: Duration = Duration::from_secs(1);
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("control socket connect failed: {0}")]
    Connect(std::io::Error),
    #[error("control command timed out")]
    Timeout,
    #[error("unexpected control response: {0:?}")]
    UnexpectedResponse(String),
    #[error("control socket i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// One request/response exchange: connect, send the command line, read until the
/// daemon closes the connection.
async fn exchange(socket_path: &Path, command: &str) -> Result<String, TransportError> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(TransportError::Connect)?;
    stream.write_all(command.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response.trim().to_string())
}

async fn exchange_timeout(
    socket_path: &Path,
    command: &str,
    timeout: Duration,
) -> Result<String, TransportError> {
    tokio::time::timeout(timeout, exchange(socket_path, command))
        .await
        .map_err(|_| TransportError::Timeout)?
}

/// Liveness probe. True only for a timely, literal `pong`; a missing socket, timeout,
/// or any other traffic all read as "daemon not running".
pub async fn ping(socket_path: &Path) -> bool {
    matches!(
        exchange_timeout(socket_path, CMD_PING, PING_TIMEOUT).await,
        Ok(resp) if resp == RESP_PONG
    )
}

/// Ask the daemon to exit. `with_sessions` also stops every running worker first.
/// Anything but the literal `ok` is a transport error.
pub async fn shutdown(socket_path: &Path, with_sessions: bool) -> Result<(), TransportError> {
    let command = if with_sessions {
        CMD_SHUTDOWN_WITH_SESSIONS
    } else {
        CMD_SHUTDOWN
    };
    let resp = exchange_timeout(socket_path, command, COMMAND_TIMEOUT).await?;
    if resp == RESP_OK {
        Ok(())
    } else {
        Err(TransportError::UnexpectedResponse(resp))
    }
}

/// Ask the daemon to reload settings.json; returns which fields were applied live and
/// which require a restart.
pub async fn reload(socket_path: &Path) -> Result<ReloadOutcome, TransportError> {
    let resp = exchange_timeout(socket_path, CMD_RELOAD, COMMAND_TIMEOUT).await?;
    let value: serde_json::Value =
        serde_json::from_str(&resp).map_err(|_| TransportError::UnexpectedResponse(resp.clone()))?;
    let success = value.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
    let as_list = |key: &str| {
        value
            .get(key)
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default()
    };
    Ok(ReloadOutcome {
        success,
        reloaded: as_list("reloaded"),
        requires_restart: as_list("requiresRestart"),
        error: value
            .get("error")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixListener;

    /// One-shot server that answers every connection with a fixed response.
    fn serve_fixed(listener: UnixListener, response: &'static str) {
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                let _ = reader.read_line(&mut line).await;
                let mut stream = reader.into_inner();
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
    }

    #[tokio::test]
    async fn ping_missing_socket_reads_as_not_running() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!ping(&dir.path().join("control.sock")).await);
    }

    #[tokio::test]
    async fn ping_pong_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        serve_fixed(UnixListener::bind(&path).unwrap(), RESP_PONG);
        assert!(ping(&path).await);
    }

    #[tokio::test]
    async fn ping_rejects_unexpected_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        serve_fixed(UnixListener::bind(&path).unwrap(), "hello?");
        assert!(!ping(&path).await);
    }

    #[tokio::test]
    async fn shutdown_with_sessions_sends_literal_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let seen = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let mut stream = reader.into_inner();
            stream.write_all(RESP_OK.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            line.trim().to_string()
        });
        shutdown(&path, true).await.unwrap();
        assert_eq!(seen.await.unwrap(), CMD_SHUTDOWN_WITH_SESSIONS);
    }

    #[tokio::test]
    async fn non_ok_shutdown_response_is_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        serve_fixed(UnixListener::bind(&path).unwrap(), "nope");
        let err = shutdown(&path, false).await.unwrap_err();
        assert!(matches!(err, TransportError::UnexpectedResponse(_)));
    }

    #[tokio::test]
    async fn shutdown_against_missing_socket_is_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = shutdown(&dir.path().join("control.sock"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
    }

    #[tokio::test]
    async fn reload_parses_outcome_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        serve_fixed(
            UnixListener::bind(&path).unwrap(),
            r#"{"success":true,"reloaded":["inject_ime_helper"],"requiresRestart":["base_port"]}"#,
        );
        let outcome = reload(&path).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.reloaded, ["inject_ime_helper"]);
        assert_eq!(outcome.requires_restart, ["base_port"]);
        assert!(outcome.error.is_none());
    }
}
