// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Thin Unix-socket client for talking to `relayd`. Grounded on the
//! teacher's `client.rs` (connect-or-start, env-var timeouts), scoped down
//! to a single blocking request/response round trip per invocation since
//! this CLI has no long-lived session of its own.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use relay_daemon::protocol::{self, ProtocolError};
use relay_daemon::{DaemonPaths, Request, Response};
use thiserror::Error;
use tokio::net::UnixStream;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("relayd is not running (no socket at {0})")]
    DaemonNotRunning(PathBuf),
    #[error("failed to start relayd: {0}")]
    DaemonStartFailed(String),
    #[error("timed out waiting for relayd to start")]
    DaemonStartTimeout,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn timeout_connect() -> Duration {
    std::env::var("RELAY_TIMEOUT_CONNECT_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(5))
}

fn poll_interval() -> Duration {
    Duration::from_millis(50)
}

pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    /// Connects to an already-running daemon, failing if none is listening.
    pub async fn connect() -> Result<Self, ClientError> {
        let paths = DaemonPaths::load();
        if UnixStream::connect(&paths.socket_path).await.is_err() {
            return Err(ClientError::DaemonNotRunning(paths.socket_path));
        }
        Ok(Self { socket_path: paths.socket_path })
    }

    /// Connects to a running daemon, spawning one in the background and
    /// polling for its socket to appear if none is running yet.
    pub async fn connect_or_start() -> Result<Self, ClientError> {
        let paths = DaemonPaths::load();
        if UnixStream::connect(&paths.socket_path).await.is_ok() {
            return Ok(Self { socket_path: paths.socket_path });
        }

        let relayd_path = find_relayd_binary()?;
        std::process::Command::new(&relayd_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| ClientError::DaemonStartFailed(e.to_string()))?;

        let deadline = Instant::now() + timeout_connect();
        while Instant::now() < deadline {
            if UnixStream::connect(&paths.socket_path).await.is_ok() {
                return Ok(Self { socket_path: paths.socket_path });
            }
            tokio::time::sleep(poll_interval()).await;
        }
        Err(ClientError::DaemonStartTimeout)
    }

    pub async fn request(&self, request: Request) -> Result<Response, ClientError> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        protocol::write_message(&mut stream, &request).await?;
        Ok(protocol::read_message(&mut stream).await?)
    }
}

fn find_relayd_binary() -> Result<PathBuf, ClientError> {
    let current_exe = std::env::current_exe().map_err(ClientError::Io)?;
    let candidate = current_exe.with_file_name("relayd");
    if candidate.exists() {
        return Ok(candidate);
    }
    Ok(PathBuf::from("relayd"))
}
