// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The error taxonomy shared by every crate-specific `thiserror` enum.
//!
//! Each crate (`relay-supervisor`, `relay-stream`, `relay-pool`, ...) defines
//! its own fallible-operation error enum and implements `kind()` to map onto
//! one of these variants, so callers and the Recovery Orchestrator can reason
//! about failures without depending on every crate's concrete error type.

use std::fmt;
use std::time::Duration;

/// Closed set of error kinds a caller-facing failure can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    SpawnFailed,
    HealthFailed,
    ProcessExited,
    Timeout,
    Network,
    RateLimit,
    Permission,
    Oom,
    OverflowEvicted,
    OversizeLine,
    TrailingGarbage,
    ParseError,
    CircuitOpen,
    PoolFull,
    PoolCold,
    Cancelled,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::SpawnFailed => "spawn_failed",
            ErrorKind::HealthFailed => "health_failed",
            ErrorKind::ProcessExited => "process_exited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Permission => "permission",
            ErrorKind::Oom => "oom",
            ErrorKind::OverflowEvicted => "overflow_evicted",
            ErrorKind::OversizeLine => "oversize_line",
            ErrorKind::TrailingGarbage => "trailing_garbage",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::PoolFull => "pool_full",
            ErrorKind::PoolCold => "pool_cold",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl ErrorKind {
    /// Whether this kind is ever worth retrying. Matches the classifier's
    /// default retryable flag for a bare kind with no rule-table override.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::RateLimit
                | ErrorKind::ProcessExited
                | ErrorKind::HealthFailed
        )
    }
}

/// A caller-facing failure: a kind, a human message, and — where meaningful —
/// a retry-after duration. Every error surfaced across a core boundary
/// carries these three per spec.md §7 ("User-visible behaviour").
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RelayError {
    pub kind: ErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl RelayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retryable_matches_network_and_timeout() {
        assert!(ErrorKind::Network.default_retryable());
        assert!(ErrorKind::Timeout.default_retryable());
        assert!(!ErrorKind::Permission.default_retryable());
        assert!(!ErrorKind::Unknown.default_retryable());
    }

    #[test]
    fn relay_error_display_includes_kind_and_message() {
        let err = RelayError::new(ErrorKind::SpawnFailed, "sandbox rejected command");
        assert_eq!(err.to_string(), "spawn_failed: sandbox rejected command");
    }
}
