// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! IPC protocol between `relay` (CLI) and `relayd` (daemon).
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload, grounded
//! directly on `protocol_wire.rs`'s framing.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum message size (16 MB is generous for a status/log line payload).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("connection closed")]
    ConnectionClosed,
}

/// Request sent by the CLI to the daemon (spec.md §6 exposed interfaces:
/// `Pool.Acquire/Release/Close`, `Session.Send`, `Orchestrator.GetRecoveryStats`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Request {
    Ping,
    Status,
    Acquire { workspace_id: String, system_prompt: String, working_directory: std::path::PathBuf },
    Send { workspace_id: String, session_id: String, input: String },
    Release { workspace_id: String, session_id: String },
    Close { workspace_id: String, session_id: String },
    Logs { workspace_id: String, session_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspacePoolStatus {
    pub workspace_id: String,
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionHandle {
    pub session_id: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogLine {
    pub sequence: u64,
    pub message_type: String,
    pub payload: serde_json::Value,
}

/// Response from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Response {
    Pong,
    Status { uptime_secs: u64, pools: Vec<WorkspacePoolStatus> },
    Session(SessionHandle),
    Ok,
    Logs { lines: Vec<LogLine> },
    Error { kind: String, message: String },
}

/// Encodes `value` as length-prefixed JSON and writes it to `writer`.
pub async fn write_message<W, T>(writer: &mut W, value: &T) -> Result<(), ProtocolError>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(value)?;
    if json.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge { size: json.len(), max: MAX_MESSAGE_SIZE });
    }
    writer.write_all(&(json.len() as u32).to_be_bytes()).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed JSON message from `reader`.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(ProtocolError::ConnectionClosed),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge { size: len, max: MAX_MESSAGE_SIZE });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_request_over_an_in_memory_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let request = Request::Send { workspace_id: "w1".to_string(), session_id: "s1".to_string(), input: "hi\n".to_string() };
        write_message(&mut a, &request).await.expect("write");
        let decoded: Request = read_message(&mut b).await.expect("read");
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn read_on_a_closed_writer_reports_connection_closed() {
        let (a, mut b) = tokio::io::duplex(4096);
        drop(a);
        let result: Result<Request, ProtocolError> = read_message(&mut b).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }
}
