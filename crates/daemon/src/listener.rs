// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unix socket listener: accepts one task per connection, reads length-
//! prefixed `Request`s, dispatches against the shared `AppState`, and writes
//! back `Response`s. Grounded on `listener/mod.rs`'s one-task-per-connection
//! accept loop shape.

use crate::protocol::{self, LogLine, Request, Response, SessionHandle, WorkspacePoolStatus};
use crate::runtime::AppState;
use relay_core::{SessionId, WorkspaceId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, warn};

pub struct Listener {
    listener: UnixListener,
    state: Arc<AppState>,
    start_time: Instant,
}

impl Listener {
    pub fn new(listener: UnixListener, state: Arc<AppState>, start_time: Instant) -> Self {
        Self { listener, state, start_time }
    }

    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let state = self.state.clone();
                    let start_time = self.start_time;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, state, start_time).await {
                            warn!(error = %e, "connection ended with an error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                }
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, state: Arc<AppState>, start_time: Instant) -> Result<(), protocol::ProtocolError> {
    loop {
        let request: Request = match protocol::read_message(&mut stream).await {
            Ok(request) => request,
            Err(protocol::ProtocolError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        };
        let response = dispatch(&state, request, start_time).await;
        protocol::write_message(&mut stream, &response).await?;
    }
}

async fn dispatch(state: &Arc<AppState>, request: Request, start_time: Instant) -> Response {
    match request {
        Request::Ping => Response::Pong,
        Request::Status => {
            let pools = state
                .pool_sizes()
                .into_iter()
                .map(|(workspace_id, pool_size)| WorkspacePoolStatus { workspace_id: workspace_id.as_str().to_string(), pool_size })
                .collect();
            Response::Status { uptime_secs: start_time.elapsed().as_secs(), pools }
        }
        Request::Acquire { workspace_id, system_prompt, working_directory } => {
            let pool = state.pool_for(&WorkspaceId::new(workspace_id));
            let config = state.default_session_config(system_prompt, working_directory);
            match pool.acquire(config).await {
                Ok(session) => Response::Session(SessionHandle { session_id: session.id().as_str().to_string(), state: session.state().to_string() }),
                Err(e) => Response::Error { kind: "pool".to_string(), message: e.to_string() },
            }
        }
        Request::Send { workspace_id, session_id, input } => {
            let pool = state.pool_for(&WorkspaceId::new(workspace_id));
            match find_session(&pool, &session_id) {
                Some(session) => match session.send(input.as_bytes()).await {
                    Ok(()) => Response::Ok,
                    Err(e) => Response::Error { kind: "session".to_string(), message: e.to_string() },
                },
                None => unknown_session(&session_id),
            }
        }
        Request::Release { workspace_id, session_id } => {
            let pool = state.pool_for(&WorkspaceId::new(workspace_id));
            match find_session(&pool, &session_id) {
                Some(session) => {
                    pool.release(&session);
                    Response::Ok
                }
                None => unknown_session(&session_id),
            }
        }
        Request::Close { workspace_id, session_id } => {
            let pool = state.pool_for(&WorkspaceId::new(workspace_id));
            match pool.close(&SessionId::new(session_id.clone()), Duration::from_secs(5)).await {
                Ok(()) => Response::Ok,
                Err(e) => Response::Error { kind: "pool".to_string(), message: e.to_string() },
            }
        }
        Request::Logs { workspace_id, session_id } => {
            let topic = relay_core::Topic::Session(SessionId::new(session_id.clone()));
            let receiver = state.bus().subscribe(topic, 64, relay_core::BackpressurePolicy::DropOldest);
            let mut lines = Vec::new();
            while let Ok(Some(message)) = tokio::time::timeout(Duration::from_millis(50), receiver.recv()).await {
                lines.push(LogLine { sequence: message.sequence, message_type: message.message_type.as_tag().to_string(), payload: message.payload });
            }
            let _ = workspace_id;
            Response::Logs { lines }
        }
    }
}

fn unknown_session(session_id: &str) -> Response {
    Response::Error { kind: "session".to_string(), message: format!("no session with id {session_id}") }
}

/// Linear scan over a workspace pool's live sessions. Pools are sized in the
/// single digits to low tens (`pool.max_size`), so this is cheap; `Pool`
/// deliberately exposes no by-id lookup since routing is always by
/// compatible-config weighted selection (spec.md §4.9).
fn find_session(pool: &Arc<relay_pool::Pool<relay_core::SystemClock>>, session_id: &str) -> Option<Arc<relay_session::Session<relay_core::SystemClock>>> {
    pool.sessions().into_iter().find(|session| session.id().as_str() == session_id)
}
