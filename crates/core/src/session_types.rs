// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session lifecycle state and configuration, shared between `relay-session`
//! and `relay-pool` (which needs to read both without owning a Session).

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Session state machine (spec.md §4.8):
/// `Pending -> Active <-> Idle -> Ending -> Ended | Failed`.
///
/// Grounded on `crates/core/src/agent.rs`'s closed `AgentState` enum shape,
/// generalised to the richer session lifecycle spec.md requires.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SessionState {
    Pending,
    Active,
    Idle,
    Ending,
    Ended,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Pending => "pending",
            SessionState::Active => "active",
            SessionState::Idle => "idle",
            SessionState::Ending => "ending",
            SessionState::Ended => "ended",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Failed)
    }
}

/// The configuration fields that affect subprocess arguments and therefore
/// pool-compatibility (spec.md §4.9). `turn_budget` is a "soft-match" field:
/// it does not participate in compatibility, it is simply updated in place.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionConfig {
    pub system_prompt: String,
    pub turn_budget: u32,
    pub tool_allowlist: BTreeSet<String>,
    pub environment: BTreeMap<String, String>,
    pub working_directory: PathBuf,
    /// OAuth token is excluded from `Debug`/logging deliberately by callers
    /// that log this struct's other fields individually; kept here as plain
    /// data since the core has no "sensitive field" abstraction of its own.
    pub oauth_token: Option<String>,
    pub max_idle: std::time::Duration,
    pub max_lifetime: std::time::Duration,
}

impl SessionConfig {
    /// Normalises fields whose equality is otherwise construction-order
    /// dependent (DESIGN.md, Open Question 3: environment map, tool
    /// allowlist, and working directory). `tool_allowlist`/`environment` are
    /// already ordered collections, so normalisation here is limited to
    /// canonicalising the working directory.
    pub fn normalized_working_directory(&self) -> PathBuf {
        self.working_directory
            .canonicalize()
            .unwrap_or_else(|_| self.working_directory.clone())
    }

    /// Whether `self` is pool-compatible with `other`: the hard-match fields
    /// (everything but `turn_budget`) are exactly equal after normalisation.
    pub fn compatible_with(&self, other: &SessionConfig) -> bool {
        self.system_prompt == other.system_prompt
            && self.tool_allowlist == other.tool_allowlist
            && self.environment == other.environment
            && self.normalized_working_directory() == other.normalized_working_directory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(turn_budget: u32) -> SessionConfig {
        SessionConfig {
            system_prompt: "be helpful".into(),
            turn_budget,
            tool_allowlist: BTreeSet::from(["bash".to_string(), "read".to_string()]),
            environment: BTreeMap::from([("FOO".to_string(), "bar".to_string())]),
            working_directory: PathBuf::from("/tmp"),
            oauth_token: None,
            max_idle: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(3600),
        }
    }

    #[test]
    fn compatible_ignores_turn_budget() {
        let a = config(5);
        let b = config(50);
        assert!(a.compatible_with(&b));
    }

    #[test]
    fn incompatible_on_different_tool_allowlist() {
        let a = config(5);
        let mut b = config(5);
        b.tool_allowlist.insert("write".to_string());
        assert!(!a.compatible_with(&b));
    }

    #[test]
    fn session_state_terminal_classification() {
        assert!(SessionState::Ended.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Active.is_terminal());
    }
}
