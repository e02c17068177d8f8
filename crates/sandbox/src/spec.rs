// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire types shared by every `Sandbox` implementation.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Everything a Sandbox needs to launch one subprocess (spec.md §4.1
/// `Start(config)`). Mirrors the hard-match fields of
/// `relay_core::SessionConfig`.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub working_directory: PathBuf,
}

/// The platform signal a Supervisor escalates through on `Stop`
/// (spec.md §4.1 graceful-shutdown ordering: interrupt → terminate → kill).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub success: bool,
    pub code: Option<i32>,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
    #[error("process is not running")]
    NotRunning,
    #[error("io error: {0}")]
    Io(String),
}
