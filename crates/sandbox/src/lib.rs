// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Sandbox capability (spec.md §4.1): the boundary between a Process
//! Supervisor and the operating system. `SubprocessSandbox` spawns real
//! `claude` CLI processes; `FakeSandbox` is an in-memory double for
//! Supervisor/Pool tests.

pub mod fake;
pub mod spec;
pub mod subprocess;
pub mod trait_def;

pub use fake::{FakeProcessControl, FakeSandbox};
pub use spec::{ExitStatus, ProcessSpec, SandboxError, Signal};
pub use subprocess::SubprocessSandbox;
pub use trait_def::{BoxedStdin, BoxedStdout, Sandbox, SandboxedProcess};
