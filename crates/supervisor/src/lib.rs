// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process Supervisor (spec.md §4.1): owns one subprocess through spawn,
//! health probing, graceful shutdown, and restart.
//!
//! The background health-probe loop's `tokio::select!` structure (probe
//! interval raced against a shutdown signal) is grounded on `watcher.rs`'s
//! `watch_loop`; the interrupt -> terminate -> kill escalation and its
//! halving deadlines are grounded on `crates/adapters/src/subprocess.rs`'s
//! `run_with_timeout` (`tokio::time::timeout` wrapping each awaited step).

#![forbid(unsafe_code)]

pub mod state;

pub use state::{ProcessRecord, ProcessState};

use parking_lot::Mutex;
use relay_core::Clock;
use relay_sandbox::{BoxedStdin, BoxedStdout, ExitStatus, ProcessSpec, Sandbox, SandboxedProcess, Signal};
use relay_stream::Pipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("a process is already running or starting")]
    AlreadyRunning,
    #[error("failed to spawn the subprocess: {0}")]
    SpawnFailed(String),
    #[error("no process is running")]
    NotRunning,
    #[error("write to stdin failed: {0}")]
    WriteFailed(String),
    #[error("write to stdin timed out")]
    WriteTimedOut,
}

impl From<relay_sandbox::SandboxError> for SupervisorError {
    fn from(e: relay_sandbox::SandboxError) -> Self {
        match e {
            relay_sandbox::SandboxError::SpawnFailed(msg) => SupervisorError::SpawnFailed(msg),
            relay_sandbox::SandboxError::NotRunning => SupervisorError::NotRunning,
            relay_sandbox::SandboxError::Io(msg) => SupervisorError::WriteFailed(msg),
        }
    }
}

/// Health and shutdown timing, loaded from `relay_core::config::SupervisorConfig`.
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub health_interval: Duration,
    pub health_failure_budget: u32,
    pub graceful_deadline: Duration,
    pub write_timeout: Duration,
}

impl From<&relay_core::config::SupervisorConfig> for HealthPolicy {
    fn from(c: &relay_core::config::SupervisorConfig) -> Self {
        Self {
            health_interval: c.health_interval,
            health_failure_budget: c.health_failure_budget,
            graceful_deadline: c.graceful_deadline,
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from(&relay_core::config::SupervisorConfig::default())
    }
}

struct RunningProcess {
    process: Box<dyn SandboxedProcess>,
    stdin: Option<BoxedStdin>,
}

struct Background {
    shutdown: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

/// Owns at most one live subprocess at a time. `start`/`stop`/`restart`
/// serialize against each other through `running`'s lock; the health-probe
/// loop runs as a detached background task between `start` and the next
/// `stop`/crash, sharing `record`/`running` via `Arc` so it can run fully
/// independently of any `&Supervisor` borrow.
pub struct Supervisor<C: Clock> {
    clock: C,
    sandbox: Arc<dyn Sandbox>,
    pipeline: Arc<Pipeline<C>>,
    policy: Mutex<HealthPolicy>,
    record: Arc<Mutex<ProcessRecord>>,
    running: Arc<Mutex<Option<RunningProcess>>>,
    background: Mutex<Option<Background>>,
    exited: Arc<Notify>,
}

impl<C: Clock> Supervisor<C> {
    pub fn new(clock: C, sandbox: Arc<dyn Sandbox>, pipeline: Arc<Pipeline<C>>, policy: HealthPolicy) -> Self {
        Self {
            clock,
            sandbox,
            pipeline,
            policy: Mutex::new(policy),
            record: Arc::new(Mutex::new(ProcessRecord::default())),
            running: Arc::new(Mutex::new(None)),
            background: Mutex::new(None),
            exited: Arc::new(Notify::new()),
        }
    }

    pub fn reconfigure(&self, policy: HealthPolicy) {
        *self.policy.lock() = policy;
    }

    pub fn status(&self) -> ProcessState {
        self.record.lock().state
    }

    pub fn record(&self) -> ProcessRecord {
        self.record.lock().clone()
    }

    /// `Start(config)` (spec.md §4.1): launches `spec` inside the Sandbox,
    /// attaches the Stream Pipeline to its stdout, and begins health
    /// probing. Fails with `AlreadyRunning` outside `Idle`/`Stopped`/`Failed`.
    pub async fn start(&self, spec: ProcessSpec, session_id: relay_core::SessionId) -> Result<(), SupervisorError> {
        {
            let record = self.record.lock();
            if !record.state.can_start() {
                return Err(SupervisorError::AlreadyRunning);
            }
        }
        self.record.lock().state = ProcessState::Starting;

        let mut process = match self.sandbox.spawn(&spec).await {
            Ok(process) => process,
            Err(e) => {
                self.record.lock().state = ProcessState::Failed;
                return Err(e.into());
            }
        };

        let pid = process.pid();
        let stdin = process.stdin();
        let stdout = process.stdout();

        if let Some(stdout) = stdout {
            self.pipeline.attach(TokioReadAdapter(stdout), session_id);
        } else {
            warn!("sandboxed process returned no stdout handle; stream pipeline not attached");
        }

        *self.running.lock() = Some(RunningProcess { process, stdin });
        {
            let mut record = self.record.lock();
            record.state = ProcessState::Running;
            record.pid = pid;
            record.spawned_at = Some(self.clock.now());
            record.consecutive_health_failures = 0;
        }

        self.spawn_health_loop();
        Ok(())
    }

    /// `Send(bytes)` (spec.md §4.1): writes to stdin, bounded by
    /// `write_timeout`.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), SupervisorError> {
        use tokio::io::AsyncWriteExt;

        if !self.status().is_running() {
            return Err(SupervisorError::NotRunning);
        }
        let write_timeout = self.policy.lock().write_timeout;
        let mut running = self.running.lock();
        let Some(running) = running.as_mut() else {
            return Err(SupervisorError::NotRunning);
        };
        let Some(stdin) = running.stdin.as_mut() else {
            return Err(SupervisorError::WriteFailed("stdin already closed".to_string()));
        };
        match tokio::time::timeout(write_timeout, stdin.write_all(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SupervisorError::WriteFailed(e.to_string())),
            Err(_) => Err(SupervisorError::WriteTimedOut),
        }
    }

    /// `Stop(graceful_deadline)` (spec.md §4.1): interrupt, wait half the
    /// deadline, terminate, wait half again, kill. Releases every
    /// descriptor and the background probe task before returning.
    pub async fn stop(&self, graceful_deadline: Duration) -> Result<(), SupervisorError> {
        self.stop_background();
        self.record.lock().state = ProcessState::Stopping;

        let running = self.running.lock().take();
        let Some(mut running) = running else {
            self.record.lock().state = ProcessState::Stopped;
            return Ok(());
        };
        running.stdin.take();

        let half = graceful_deadline / 2;
        escalate_to_exit(running.process.as_mut(), graceful_deadline, half).await;

        self.pipeline.detach();
        {
            let mut record = self.record.lock();
            record.state = ProcessState::Stopped;
            record.last_exit = Some(ExitStatus { success: true, code: Some(0) });
        }
        self.exited.notify_waiters();
        Ok(())
    }

    /// `Restart(config)`: `Stop` then `Start`, observable only as
    /// `Restarting` in between.
    pub async fn restart(
        &self,
        spec: ProcessSpec,
        session_id: relay_core::SessionId,
        graceful_deadline: Duration,
    ) -> Result<(), SupervisorError> {
        self.record.lock().state = ProcessState::Restarting;
        self.stop(graceful_deadline).await?;
        self.record.lock().restart_count += 1;
        self.start(spec, session_id).await
    }

    /// Fires once the currently running process exits, whether by crash or
    /// by a completed `Stop`.
    pub async fn exited(&self) {
        self.exited.notified().await;
    }

    fn stop_background(&self) {
        if let Some(background) = self.background.lock().take() {
            let _ = background.shutdown.send(());
            background.task.abort();
        }
    }

    fn spawn_health_loop(&self) {
        self.stop_background();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let clock = self.clock.clone();
        let policy = self.policy.lock().clone();
        let record = self.record.clone();
        let running = self.running.clone();
        let pipeline = self.pipeline.clone();
        let exited = self.exited.clone();

        let task = tokio::spawn(health_loop(clock, policy, record, running, pipeline, exited, shutdown_rx));
        *self.background.lock() = Some(Background { shutdown: shutdown_tx, task });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOutcome {
    Alive,
    Exited,
    Error,
}

/// Health policy (spec.md §4.1): a probe every `health_interval`; a probe
/// succeeds whenever the process is still alive, whether or not the
/// Pipeline has processed any new message since the previous probe (an
/// idle-but-alive session is healthy). A process confirmed exited fails
/// the record immediately; `health_failure_budget` consecutive probe
/// errors (the liveness check itself failing, not mere silence) also
/// transitions the record to `Failed`.
async fn health_loop<C: Clock>(
    clock: C,
    policy: HealthPolicy,
    record: Arc<Mutex<ProcessRecord>>,
    running: Arc<Mutex<Option<RunningProcess>>>,
    pipeline: Arc<Pipeline<C>>,
    exited: Arc<Notify>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                debug!("health probe loop stopping: supervisor detached");
                break;
            }
            _ = tokio::time::sleep(policy.health_interval) => {
                // Taken out rather than probed in place, so the mutex is
                // never held across the `.await` below.
                let mut taken = running.lock().take();
                let probe = match taken.as_mut() {
                    Some(rp) => match rp.process.try_wait().await {
                        Ok(None) => ProbeOutcome::Alive,
                        Ok(Some(_)) => ProbeOutcome::Exited,
                        Err(_) => ProbeOutcome::Error,
                    },
                    None => ProbeOutcome::Exited,
                };
                *running.lock() = taken;

                if probe == ProbeOutcome::Exited {
                    record.lock().state = ProcessState::Failed;
                    exited.notify_waiters();
                    break;
                }

                let mut record = record.lock();
                record.last_health_probe = Some(clock.now());
                if probe == ProbeOutcome::Alive {
                    debug!(processed = pipeline.metrics().processed, "health probe: process alive");
                    record.consecutive_health_failures = 0;
                } else {
                    warn!("health probe: try_wait errored, counting against failure budget");
                    record.consecutive_health_failures += 1;
                    if record.consecutive_health_failures >= policy.health_failure_budget {
                        warn!(failures = record.consecutive_health_failures, "health probe budget exhausted");
                        record.state = ProcessState::Failed;
                        drop(record);
                        exited.notify_waiters();
                        break;
                    }
                }
            }
        }
    }
}

/// Sends `signal`, waits up to `deadline`, returns whether the process had
/// already exited by then.
async fn wait_for_exit_or_timeout(process: &mut dyn SandboxedProcess, deadline: Duration) -> bool {
    tokio::time::timeout(deadline, process.wait()).await.is_ok()
}

async fn escalate_to_exit(process: &mut dyn SandboxedProcess, graceful_deadline: Duration, half: Duration) {
    if process.signal(Signal::Interrupt).await.is_err() {
        return;
    }
    if wait_for_exit_or_timeout(process, graceful_deadline).await {
        return;
    }
    info!("process ignored interrupt past the graceful deadline, escalating to terminate");
    if process.signal(Signal::Terminate).await.is_err() {
        return;
    }
    if wait_for_exit_or_timeout(process, half).await {
        return;
    }
    warn!("process ignored terminate, escalating to kill");
    if process.signal(Signal::Kill).await.is_ok() {
        let _ = wait_for_exit_or_timeout(process, half).await;
    }
}

/// Adapts a boxed `AsyncRead` trait object to a concrete, `Unpin`-bound type
/// so it satisfies `Pipeline::attach`'s generic bound.
struct TokioReadAdapter(BoxedStdout);

impl tokio::io::AsyncRead for TokioReadAdapter {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.0).poll_read(cx, buf)
    }
}
