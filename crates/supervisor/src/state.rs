// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process state machine (spec.md §4.1).

/// One Supervisor's view of its current subprocess.
///
/// ```text
/// Idle --Start--> Starting --spawn ok--> Running
/// Starting --spawn fail--> Failed
/// Running --Stop--> Stopping --exit--> Stopped
/// Running --exit--> Failed              (unexpected)
/// Running --Restart--> Restarting --> Starting
/// Failed, Stopped --Start--> Starting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProcessState {
    Idle,
    Starting,
    Running,
    Restarting,
    Stopping,
    Stopped,
    Failed,
}

impl ProcessState {
    pub fn can_start(&self) -> bool {
        matches!(self, ProcessState::Idle | ProcessState::Failed | ProcessState::Stopped)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessState::Idle => "idle",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Restarting => "restarting",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
            ProcessState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The Supervisor's view of one subprocess (spec.md §3 `ProcessRecord`).
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub spawned_at: Option<std::time::Instant>,
    pub last_health_probe: Option<std::time::Instant>,
    pub restart_count: u32,
    pub last_exit: Option<relay_sandbox::ExitStatus>,
    pub consecutive_health_failures: u32,
}

impl Default for ProcessRecord {
    fn default() -> Self {
        Self {
            state: ProcessState::Idle,
            pid: None,
            spawned_at: None,
            last_health_probe: None,
            restart_count: 0,
            last_exit: None,
            consecutive_health_failures: 0,
        }
    }
}
