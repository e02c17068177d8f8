// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Data types shared between the classifier, breaker, and orchestrator
//! (`relay-recovery`) and anyone observing their state.

use crate::ErrorKind;
use std::time::Instant;

/// Circuit breaker state (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time snapshot of one breaker's state (spec.md §3).
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count_half_open: u64,
    pub last_transition: Instant,
    pub failure_threshold: u64,
    pub request_volume_threshold: u64,
    pub error_percentage_threshold: f64,
}

/// One of the four backoff families spec.md §4.6 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackoffFamily {
    Fixed,
    Linear,
    Exponential,
    DecorrelatedJitter,
}

/// What the Orchestrator should do in response to a classified error
/// (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RecoveryAction {
    Retry,
    Restart,
    Escalate,
    Ignore,
}

/// An immutable record produced by the Error Classifier and consumed by the
/// Recovery Orchestrator (spec.md §3).
#[derive(Debug, Clone)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    pub action: RecoveryAction,
    pub retryable: bool,
    pub backoff_family: BackoffFamily,
}

impl ErrorClassification {
    pub fn new(kind: ErrorKind, action: RecoveryAction, retryable: bool, backoff_family: BackoffFamily) -> Self {
        Self {
            kind,
            action,
            retryable,
            backoff_family,
        }
    }

    /// The tail-catch classification: unknown kind, escalate, not retryable
    /// (spec.md §4.7).
    pub fn unknown_fallback() -> Self {
        Self::new(
            ErrorKind::Unknown,
            RecoveryAction::Escalate,
            false,
            BackoffFamily::Fixed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fallback_is_non_retryable_escalate() {
        let c = ErrorClassification::unknown_fallback();
        assert_eq!(c.action, RecoveryAction::Escalate);
        assert!(!c.retryable);
        assert_eq!(c.kind, ErrorKind::Unknown);
    }
}
