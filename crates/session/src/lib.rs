// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session (spec.md §4.8): a long-lived logical conversation bound to one
//! Supervisor and one Pipeline, plus its configuration and metrics.
//!
//! The idle/lifetime background sweep is grounded on
//! `other_examples/c6c6d505_..._interactive_session.rs.rs`'s
//! `cleanup_expired_sessions` (periodic `Instant`-based elapsed check),
//! narrowed from a group sweep over every session to one background task per
//! `Session` racing a shutdown oneshot, matching `watcher.rs`'s task shape.

#![forbid(unsafe_code)]

use parking_lot::Mutex;
use relay_core::{Clock, SessionConfig, SessionId, SessionState, WorkspaceId};
use relay_supervisor::Supervisor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is not accepting input in its current state")]
    NotAcceptingInput,
    #[error("session has already ended")]
    AlreadyEnded,
}

/// Usage counters (spec.md §3 `Session` metrics).
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionMetrics {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub command_count: u64,
    pub error_count: u64,
}

struct Timing {
    created_at: Instant,
    last_active: Instant,
}

struct Background {
    shutdown: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

/// One logical conversation. Exclusively owns one `Supervisor`; the Pipeline
/// publishing that Supervisor's stdout lives inside the Supervisor already
/// (spec.md §3 ownership: "each Session exclusively owns its Supervisor and
/// Pipeline").
pub struct Session<C: Clock> {
    id: SessionId,
    workspace_id: WorkspaceId,
    clock: C,
    supervisor: Arc<Supervisor<C>>,
    config: Mutex<SessionConfig>,
    state: Mutex<SessionState>,
    metrics: Mutex<SessionMetrics>,
    timing: Mutex<Timing>,
    background: Mutex<Option<Background>>,
}

impl<C: Clock> Session<C> {
    pub fn new(id: SessionId, workspace_id: WorkspaceId, clock: C, supervisor: Arc<Supervisor<C>>, config: SessionConfig) -> Arc<Self> {
        let now = clock.now();
        let session = Arc::new(Self {
            id,
            workspace_id,
            clock,
            supervisor,
            config: Mutex::new(config),
            state: Mutex::new(SessionState::Pending),
            metrics: Mutex::new(SessionMetrics::default()),
            timing: Mutex::new(Timing { created_at: now, last_active: now }),
            background: Mutex::new(None),
        });
        session.spawn_lifecycle_watcher();
        session
    }

    pub fn id(&self) -> SessionId {
        self.id.clone()
    }

    pub fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn config(&self) -> SessionConfig {
        self.config.lock().clone()
    }

    pub fn metrics(&self) -> SessionMetrics {
        *self.metrics.lock()
    }

    pub fn supervisor(&self) -> &Arc<Supervisor<C>> {
        &self.supervisor
    }

    pub fn created_at(&self) -> Instant {
        self.timing.lock().created_at
    }

    pub fn last_active(&self) -> Instant {
        self.timing.lock().last_active
    }

    /// Updates the soft-match field `turn_budget` in place without affecting
    /// pool compatibility (spec.md §4.9).
    pub fn set_turn_budget(&self, turn_budget: u32) {
        self.config.lock().turn_budget = turn_budget;
    }

    /// `Idle -> Active` on any Send (spec.md §4.8); `Pending -> Active` is
    /// driven separately by `note_first_message` once the Supervisor's
    /// first output arrives.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), SessionError> {
        {
            let state = self.state.lock();
            if matches!(*state, SessionState::Ending | SessionState::Ended | SessionState::Failed) {
                return Err(SessionError::NotAcceptingInput);
            }
        }
        if self.supervisor.send(bytes).await.is_err() {
            let mut metrics = self.metrics.lock();
            metrics.error_count += 1;
            return Err(SessionError::NotAcceptingInput);
        }
        let mut metrics = self.metrics.lock();
        metrics.bytes_out += bytes.len() as u64;
        metrics.command_count += 1;
        drop(metrics);
        self.touch_active();
        Ok(())
    }

    /// Called once the Supervisor's stdout has produced its first `Message`
    /// (spec.md §4.8 `Pending -> Active`).
    pub fn note_first_message(&self, bytes: usize) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Pending {
                *state = SessionState::Active;
            }
        }
        self.metrics.lock().bytes_in += bytes as u64;
        self.touch_active();
    }

    /// Called for every subsequent Message; bumps `bytes_in` and freshens
    /// the idle clock without re-deriving the `Pending -> Active` edge.
    pub fn note_message(&self, bytes: usize) {
        self.metrics.lock().bytes_in += bytes as u64;
        self.touch_active();
    }

    fn touch_active(&self) {
        let now = self.clock.now();
        self.timing.lock().last_active = now;
        let mut state = self.state.lock();
        if *state == SessionState::Idle {
            *state = SessionState::Active;
        }
    }

    /// `Active -> Idle` on explicit Pool release (spec.md §4.9 `Release`).
    /// A no-op outside `Active`: `Pending`/`Ending`/`Ended`/`Failed` sessions
    /// are not releasable, and an already-`Idle` session has nothing to do.
    pub fn release(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Active {
            *state = SessionState::Idle;
        }
    }

    /// `* -> Ending` on explicit close: stops the Supervisor and waits for
    /// it to exit, then transitions to `Ended`.
    pub async fn close(&self, graceful_deadline: Duration) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return Err(SessionError::AlreadyEnded);
            }
            *state = SessionState::Ending;
        }
        self.stop_background();
        let _ = self.supervisor.stop(graceful_deadline).await;
        *self.state.lock() = SessionState::Ended;
        Ok(())
    }

    /// `* -> Failed` on Orchestrator Escalate (spec.md §4.8). Terminal: the
    /// Pool removes this Session immediately and never reuses its id.
    pub fn fail(&self) {
        self.stop_background();
        *self.state.lock() = SessionState::Failed;
    }

    fn stop_background(&self) {
        if let Some(background) = self.background.lock().take() {
            let _ = background.shutdown.send(());
            background.task.abort();
        }
    }

    fn spawn_lifecycle_watcher(self: &Arc<Self>) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let session = self.clone();
        let task = tokio::spawn(lifecycle_watch(session, shutdown_rx));
        *self.background.lock() = Some(Background { shutdown: shutdown_tx, task });
    }
}

/// Enforces `max_idle` (Active -> Idle) and `max_lifetime` (forces Ending
/// regardless of activity), polling on a fixed tick like
/// `cleanup_expired_sessions`'s periodic sweep, generalised to one session
/// per task with a shutdown handshake instead of a shared interval driving
/// every session in a map.
async fn lifecycle_watch<C: Clock>(session: Arc<Session<C>>, mut shutdown_rx: oneshot::Receiver<()>) {
    const TICK: Duration = Duration::from_secs(1);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                debug!("lifecycle watcher stopping: session closed");
                break;
            }
            _ = tokio::time::sleep(TICK) => {
                if session.state().is_terminal() {
                    break;
                }
                let now = session.clock.now();
                let (max_idle, max_lifetime) = {
                    let config = session.config.lock();
                    (config.max_idle, config.max_lifetime)
                };
                let (created_at, last_active) = {
                    let timing = session.timing.lock();
                    (timing.created_at, timing.last_active)
                };

                if now.duration_since(created_at) >= max_lifetime {
                    let mut state = session.state.lock();
                    if !state.is_terminal() {
                        *state = SessionState::Ending;
                    }
                    continue;
                }

                if now.duration_since(last_active) >= max_idle {
                    let mut state = session.state.lock();
                    if *state == SessionState::Active {
                        *state = SessionState::Idle;
                    }
                }
            }
        }
    }
}
