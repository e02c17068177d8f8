// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `Sandbox` capability (spec.md §4.1): everything a Process Supervisor
//! needs from "the thing that actually owns a subprocess", abstracted so a
//! `SubprocessSandbox` and an in-memory `FakeSandbox` are interchangeable
//! behind `Arc<dyn Sandbox>`.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::spec::{ExitStatus, ProcessSpec, SandboxError, Signal};

pub type BoxedStdin = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedStdout = Box<dyn AsyncRead + Send + Unpin>;

/// A single spawned child. `stdin`/`stdout` are take-once accessors, mirroring
/// `tokio::process::Child`'s `Option<ChildStdin>`/`Option<ChildStdout>`
/// fields: a Supervisor takes each handle exactly once when it attaches its
/// Stream Pipeline and input writer.
#[async_trait]
pub trait SandboxedProcess: Send + Sync {
    /// Takes ownership of the child's stdin, if it hasn't been taken already.
    fn stdin(&mut self) -> Option<BoxedStdin>;

    /// Takes ownership of the child's stdout, if it hasn't been taken already.
    fn stdout(&mut self) -> Option<BoxedStdout>;

    /// The OS process id, for `ProcessRecord` bookkeeping and logging.
    fn pid(&self) -> Option<u32>;

    /// Delivers `signal` to the process (and, for process-group-isolated
    /// implementations, every descendant it spawned).
    async fn signal(&self, signal: Signal) -> Result<(), SandboxError>;

    /// Non-blocking poll: `Some(status)` once the process has exited.
    async fn try_wait(&mut self) -> Result<Option<ExitStatus>, SandboxError>;

    /// Blocks until the process exits.
    async fn wait(&mut self) -> Result<ExitStatus, SandboxError>;
}

/// Spawns `SandboxedProcess`es. One `Sandbox` implementation is shared by
/// every Supervisor in the daemon.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<Box<dyn SandboxedProcess>, SandboxError>;
}
