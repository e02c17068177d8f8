// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error Classifier (spec.md §4.7): an ordered rule table mapping a raw
//! error to a taxonomy entry and recommended action.
//!
//! Grounded on `crates/core/src/agent.rs`'s closed `AgentError` enum and
//! `watcher.rs`'s `detect_error` substring classification, generalised from a
//! fixed match into a reconfigurable, ordered rule table.

use relay_core::{BackoffFamily, ErrorClassification, ErrorKind, RecoveryAction};

/// What's known about a raw failure at classification time. `message`
/// mirrors the substring the teacher's `detect_error` matches against;
/// `syscall_code` covers process-exit-status-style classification.
#[derive(Debug, Clone)]
pub struct RawError {
    pub kind_hint: Option<ErrorKind>,
    pub message: String,
    pub syscall_code: Option<i32>,
}

impl RawError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind_hint: None,
            message: message.into(),
            syscall_code: None,
        }
    }

    pub fn with_kind_hint(mut self, kind: ErrorKind) -> Self {
        self.kind_hint = Some(kind);
        self
    }

    pub fn with_syscall_code(mut self, code: i32) -> Self {
        self.syscall_code = Some(code);
        self
    }
}

/// One ordered rule: the first whose predicate matches wins.
pub struct Rule {
    pub name: &'static str,
    pub matches: Box<dyn Fn(&RawError) -> bool + Send + Sync>,
    pub classification: ErrorClassification,
}

/// Declared at construction; mutable only via `reconfigure` (spec.md §4.7).
pub struct Classifier {
    rules: Vec<Rule>,
}

impl Classifier {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn reconfigure(&mut self, rules: Vec<Rule>) {
        self.rules = rules;
    }

    /// First matching rule wins; the tail-catch is
    /// `{kind=Unknown, action=Escalate, retryable=false}`.
    pub fn classify(&self, err: &RawError) -> ErrorClassification {
        for rule in &self.rules {
            if (rule.matches)(err) {
                return rule.classification.clone();
            }
        }
        ErrorClassification::unknown_fallback()
    }

    /// The illustrative policy rule table from spec.md §4.7.
    pub fn default_rules() -> Vec<Rule> {
        vec![
            Rule {
                name: "network-connection-refused",
                matches: Box::new(|e| {
                    e.kind_hint == Some(ErrorKind::Network) && e.message.contains("connection refused")
                }),
                classification: ErrorClassification::new(
                    ErrorKind::Network,
                    RecoveryAction::Retry,
                    true,
                    BackoffFamily::Exponential,
                ),
            },
            Rule {
                name: "timeout",
                matches: Box::new(|e| e.kind_hint == Some(ErrorKind::Timeout)),
                classification: ErrorClassification::new(
                    ErrorKind::Timeout,
                    RecoveryAction::Retry,
                    true,
                    BackoffFamily::DecorrelatedJitter,
                ),
            },
            Rule {
                name: "process-exited-unexpectedly",
                matches: Box::new(|e| e.kind_hint == Some(ErrorKind::ProcessExited)),
                classification: ErrorClassification::new(
                    ErrorKind::ProcessExited,
                    RecoveryAction::Restart,
                    true,
                    BackoffFamily::Exponential,
                ),
            },
            Rule {
                name: "permission-denied",
                matches: Box::new(|e| {
                    e.kind_hint == Some(ErrorKind::Permission)
                        || e.message.to_lowercase().contains("unauthorized")
                        || e.message.to_lowercase().contains("permission denied")
                }),
                classification: ErrorClassification::new(
                    ErrorKind::Permission,
                    RecoveryAction::Escalate,
                    false,
                    BackoffFamily::Fixed,
                ),
            },
            Rule {
                name: "out-of-memory",
                matches: Box::new(|e| {
                    e.kind_hint == Some(ErrorKind::Oom)
                        || e.message.to_lowercase().contains("out of memory")
                }),
                classification: ErrorClassification::new(
                    ErrorKind::Oom,
                    RecoveryAction::Escalate,
                    false,
                    BackoffFamily::Fixed,
                ),
            },
            Rule {
                name: "rate-limit",
                matches: Box::new(|e| {
                    e.kind_hint == Some(ErrorKind::RateLimit)
                        || e.message.to_lowercase().contains("rate limit")
                        || e.message.to_lowercase().contains("out of credits")
                }),
                classification: ErrorClassification::new(
                    ErrorKind::RateLimit,
                    RecoveryAction::Retry,
                    true,
                    BackoffFamily::Fixed,
                ),
            },
            Rule {
                name: "no-internet",
                matches: Box::new(|e| e.message.to_lowercase().contains("no internet")),
                classification: ErrorClassification::new(
                    ErrorKind::Network,
                    RecoveryAction::Retry,
                    true,
                    BackoffFamily::DecorrelatedJitter,
                ),
            },
        ]
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(Self::default_rules())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    #[parameterized(
        connection_refused = { "connection refused by host", ErrorKind::Network, ErrorKind::Network, RecoveryAction::Retry },
        unauthorized = { "401 unauthorized", ErrorKind::Unknown, ErrorKind::Permission, RecoveryAction::Escalate },
        oom = { "process killed: out of memory", ErrorKind::Unknown, ErrorKind::Oom, RecoveryAction::Escalate },
        rate_limited = { "rate limit exceeded, slow down", ErrorKind::Unknown, ErrorKind::RateLimit, RecoveryAction::Retry },
    )]
    fn classifies_by_message_substring(
        message: &str,
        kind_hint: ErrorKind,
        expected_kind: ErrorKind,
        expected_action: RecoveryAction,
    ) {
        let classifier = Classifier::default();
        let err = RawError::new(message).with_kind_hint(kind_hint);
        let classification = classifier.classify(&err);
        assert_eq!(classification.kind, expected_kind);
        assert_eq!(classification.action, expected_action);
    }

    #[test]
    fn unmatched_error_falls_back_to_unknown_escalate() {
        let classifier = Classifier::default();
        let err = RawError::new("something bizarre happened");
        let classification = classifier.classify(&err);
        assert_eq!(classification.kind, ErrorKind::Unknown);
        assert_eq!(classification.action, RecoveryAction::Escalate);
        assert!(!classification.retryable);
    }

    #[test]
    fn first_matching_rule_wins() {
        let classifier = Classifier::default();
        let err = RawError::new("rate limit hit").with_kind_hint(ErrorKind::Timeout);
        // Timeout rule is declared before rate-limit; kind_hint drives the match.
        assert_eq!(classifier.classify(&err).kind, ErrorKind::Timeout);
    }

    #[test]
    fn reconfigure_replaces_rule_table_atomically() {
        let mut classifier = Classifier::default();
        classifier.reconfigure(vec![Rule {
            name: "everything-is-ignorable",
            matches: Box::new(|_| true),
            classification: ErrorClassification::new(
                ErrorKind::Unknown,
                RecoveryAction::Ignore,
                false,
                BackoffFamily::Fixed,
            ),
        }]);
        let classification = classifier.classify(&RawError::new("anything"));
        assert_eq!(classification.action, RecoveryAction::Ignore);
    }
}
