// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory `Sandbox` double for Supervisor/Pool tests: no real process is
//! spawned, stdout is whatever bytes the test feeds in, and signal delivery
//! is observable rather than inferred from an OS exit code.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::task::Poll;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::spec::{ExitStatus, ProcessSpec, SandboxError, Signal};
use crate::trait_def::{BoxedStdin, BoxedStdout, Sandbox, SandboxedProcess};

#[derive(Debug, Clone, Default)]
struct FakeProcessState {
    signals_received: Vec<Signal>,
    exit_status: Option<ExitStatus>,
}

/// Shared handle a test holds onto a spawned `FakeProcess`, so it can push
/// stdout bytes or force an exit after `spawn` has handed the process to a
/// Supervisor.
#[derive(Clone)]
pub struct FakeProcessControl {
    state: Arc<Mutex<FakeProcessState>>,
    stdout_feed: Arc<Mutex<VecDeque<u8>>>,
    stdout_closed: Arc<Mutex<bool>>,
}

impl FakeProcessControl {
    pub fn push_stdout(&self, bytes: &[u8]) {
        self.stdout_feed.lock().extend(bytes.iter().copied());
    }

    pub fn close_stdout(&self) {
        *self.stdout_closed.lock() = true;
    }

    pub fn signals_received(&self) -> Vec<Signal> {
        self.state.lock().signals_received.clone()
    }

    pub fn force_exit(&self, status: ExitStatus) {
        self.state.lock().exit_status = Some(status);
    }
}

/// Spawns `FakeProcess`es, recording every `ProcessSpec` it was asked to
/// spawn (so tests can assert on restart arguments) and every resulting
/// `FakeProcessControl` (so tests can drive a process's stdout/exit after
/// handing it off behind `Arc<dyn Sandbox>`).
#[derive(Default)]
pub struct FakeSandbox {
    spawned: Mutex<Vec<ProcessSpec>>,
    controls: Mutex<Vec<FakeProcessControl>>,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawned_specs(&self) -> Vec<ProcessSpec> {
        self.spawned.lock().clone()
    }

    /// The control handle for the most recently spawned process.
    pub fn last_control(&self) -> Option<FakeProcessControl> {
        self.controls.lock().last().cloned()
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<Box<dyn SandboxedProcess>, SandboxError> {
        self.spawned.lock().push(spec.clone());
        let control = FakeProcessControl {
            state: Arc::new(Mutex::new(FakeProcessState::default())),
            stdout_feed: Arc::new(Mutex::new(VecDeque::new())),
            stdout_closed: Arc::new(Mutex::new(false)),
        };
        self.controls.lock().push(control.clone());
        Ok(Box::new(FakeProcess {
            control,
            stdin_taken: false,
            stdout_taken: false,
        }))
    }
}

struct FakeProcess {
    control: FakeProcessControl,
    stdin_taken: bool,
    stdout_taken: bool,
}

#[async_trait]
impl SandboxedProcess for FakeProcess {
    fn stdin(&mut self) -> Option<BoxedStdin> {
        if self.stdin_taken {
            return None;
        }
        self.stdin_taken = true;
        Some(Box::new(tokio::io::sink()) as BoxedStdin)
    }

    fn stdout(&mut self) -> Option<BoxedStdout> {
        if self.stdout_taken {
            return None;
        }
        self.stdout_taken = true;
        Some(Box::new(FakeStdout {
            feed: self.control.stdout_feed.clone(),
            closed: self.control.stdout_closed.clone(),
        }) as BoxedStdout)
    }

    fn pid(&self) -> Option<u32> {
        Some(1)
    }

    async fn signal(&self, signal: Signal) -> Result<(), SandboxError> {
        let mut state = self.control.state.lock();
        state.signals_received.push(signal);
        if matches!(signal, Signal::Kill) && state.exit_status.is_none() {
            state.exit_status = Some(ExitStatus { success: false, code: Some(137) });
        }
        Ok(())
    }

    async fn try_wait(&mut self) -> Result<Option<ExitStatus>, SandboxError> {
        Ok(self.control.state.lock().exit_status)
    }

    async fn wait(&mut self) -> Result<ExitStatus, SandboxError> {
        loop {
            if let Some(status) = self.control.state.lock().exit_status {
                return Ok(status);
            }
            tokio::task::yield_now().await;
        }
    }
}

struct FakeStdout {
    feed: Arc<Mutex<VecDeque<u8>>>,
    closed: Arc<Mutex<bool>>,
}

impl AsyncRead for FakeStdout {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let mut feed = self.feed.lock();
        if feed.is_empty() {
            if *self.closed.lock() {
                return Poll::Ready(Ok(()));
            }
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        let take = feed.len().min(buf.remaining());
        for _ in 0..take {
            if let Some(byte) = feed.pop_front() {
                buf.put_slice(&[byte]);
            }
        }
        Poll::Ready(Ok(()))
    }
}
