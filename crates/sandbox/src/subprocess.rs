// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Real subprocess-backed `Sandbox`.
//!
//! Process-group isolation is grounded on
//! `other_examples/c6c6d505_..._interactive_session.rs.rs`'s `create_session`:
//! a `pre_exec` hook calls `libc::setpgid(0, 0)` so the child becomes the
//! leader of its own process group, and signal delivery targets `-pgid`
//! rather than the child's own pid, so a shell launched by the CLI (and
//! anything *that* shell spawns) dies with it. Signal escalation deadlines
//! mirror `crates/adapters/src/subprocess.rs`'s `run_with_timeout`
//! (`tokio::time::timeout` around the awaited operation).

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::spec::{ExitStatus, ProcessSpec, SandboxError, Signal};
use crate::trait_def::{BoxedStdin, BoxedStdout, Sandbox, SandboxedProcess};

#[derive(Debug, Default, Clone, Copy)]
pub struct SubprocessSandbox;

#[async_trait]
impl Sandbox for SubprocessSandbox {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<Box<dyn SandboxedProcess>, SandboxError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.environment)
            .current_dir(&spec.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        // New process group, so `signal` below can kill the whole tree a
        // shelled-out CLI might spawn (bash, find, sleep, ...).
        #[cfg(unix)]
        isolate_process_group(&mut cmd);

        let child = cmd.spawn().map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;
        Ok(Box::new(SubprocessHandle { child }))
    }
}

/// Puts the about-to-exec child into its own process group via `pre_exec`.
#[cfg(unix)]
#[allow(unsafe_code)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

struct SubprocessHandle {
    child: Child,
}

impl SubprocessHandle {
    #[cfg(unix)]
    fn process_group_id(&self) -> Option<i32> {
        self.child.id().map(|pid| pid as i32)
    }

    #[cfg(unix)]
    fn deliver(&self, signal: Signal) -> Result<(), SandboxError> {
        let Some(pid) = self.process_group_id() else {
            return Err(SandboxError::NotRunning);
        };
        let raw = match signal {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // Negative pid targets the whole process group `setpgid` placed the
        // child into above.
        if raw_kill(pid, raw) != 0 {
            return Err(SandboxError::Io(std::io::Error::last_os_error().to_string()));
        }
        Ok(())
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn raw_kill(pgid: i32, signal: i32) -> i32 {
    unsafe { libc::kill(-pgid, signal) }
}

#[async_trait]
impl SandboxedProcess for SubprocessHandle {
    fn stdin(&mut self) -> Option<BoxedStdin> {
        self.child.stdin.take().map(|s| Box::new(s) as BoxedStdin)
    }

    fn stdout(&mut self) -> Option<BoxedStdout> {
        self.child.stdout.take().map(|s| Box::new(s) as BoxedStdout)
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn signal(&self, signal: Signal) -> Result<(), SandboxError> {
        #[cfg(unix)]
        {
            self.deliver(signal)
        }
        #[cfg(not(unix))]
        {
            let _ = signal;
            Err(SandboxError::Io("signal delivery is only supported on unix".to_string()))
        }
    }

    async fn try_wait(&mut self) -> Result<Option<ExitStatus>, SandboxError> {
        match self.child.try_wait() {
            Ok(Some(status)) => Ok(Some(to_exit_status(status))),
            Ok(None) => Ok(None),
            Err(e) => Err(SandboxError::Io(e.to_string())),
        }
    }

    async fn wait(&mut self) -> Result<ExitStatus, SandboxError> {
        self.child.wait().await.map(to_exit_status).map_err(|e| SandboxError::Io(e.to_string()))
    }
}

fn to_exit_status(status: std::process::ExitStatus) -> ExitStatus {
    ExitStatus {
        success: status.success(),
        code: status.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn spec(command: &str, args: &[&str]) -> ProcessSpec {
        ProcessSpec {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            environment: BTreeMap::new(),
            working_directory: PathBuf::from("."),
        }
    }

    #[tokio::test]
    async fn spawns_and_waits_for_a_real_process() {
        let sandbox = SubprocessSandbox;
        let mut process = sandbox.spawn(&spec("true", &[])).await.expect("spawn");
        let status = process.wait().await.expect("wait");
        assert!(status.success);
    }

    #[tokio::test]
    async fn kill_signal_terminates_a_sleeping_process() {
        let sandbox = SubprocessSandbox;
        let mut process = sandbox.spawn(&spec("sleep", &["30"])).await.expect("spawn");
        process.signal(Signal::Kill).await.expect("signal");
        let status = process.wait().await.expect("wait");
        assert!(!status.success);
    }

    #[tokio::test]
    async fn spawn_of_a_missing_binary_fails() {
        let sandbox = SubprocessSandbox;
        let result = sandbox.spawn(&spec("relay-definitely-not-a-real-binary", &[])).await;
        assert!(matches!(result, Err(SandboxError::SpawnFailed(_))));
    }
}
