// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Recovery Orchestrator (spec.md §4.7): combines the Classifier, Backoff,
//! and Circuit Breaker to decide what happens after a failure, and tracks
//! the restart budget.
//!
//! The restart-budget windowed-reset bookkeeping is grounded on
//! `restart.rs`'s `RestartPolicy::should_retry`/`Backoff::should_backoff`.

use crate::backoff::{self, Backoff};
use crate::breaker::CircuitBreaker;
use crate::classifier::{Classifier, RawError};
use relay_core::{Clock, RecoveryAction};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// What the caller should do next, mirroring `HandleError`'s return values
/// (spec.md §4.7), plus the computed delay for `Retry`.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Retry { after: Duration },
    Restart,
    Escalate,
    Ignore,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    pub restart_count: u64,
    pub successful_runs: u64,
    pub error_histogram: HashMap<relay_core::ErrorKind, u64>,
}

struct SessionBookkeeping {
    backoff: Backoff,
    last_delay: Duration,
}

pub struct OrchestratorConfig {
    pub max_restarts: u32,
    pub restart_interval: Duration,
    pub base_delay: Duration,
    pub max_backoff: Duration,
}

/// Coordinates retries, restarts, and escalations for every session sharing
/// one Orchestrator instance. One Orchestrator typically gates one
/// operation family (e.g. "spawn a Claude subprocess").
pub struct Orchestrator<C: Clock> {
    clock: C,
    classifier: Mutex<Classifier>,
    breaker: Arc<CircuitBreaker>,
    config: Mutex<OrchestratorConfig>,
    per_session: Mutex<HashMap<String, SessionBookkeeping>>,
    stats: Mutex<RecoveryStats>,
}

impl<C: Clock> Orchestrator<C> {
    pub fn new(clock: C, classifier: Classifier, breaker: Arc<CircuitBreaker>, config: OrchestratorConfig) -> Self {
        Self {
            clock,
            classifier: Mutex::new(classifier),
            breaker,
            config: Mutex::new(config),
            per_session: Mutex::new(HashMap::new()),
            stats: Mutex::new(RecoveryStats::default()),
        }
    }

    pub fn reconfigure(&self, config: OrchestratorConfig) {
        *self.config.lock() = config;
    }

    /// Classify `err` for `session_key`, consult the breaker, possibly
    /// compute a backoff delay, and decide the next action. Restart budget
    /// exhaustion forces `Escalate` regardless of the classifier's rule
    /// (spec.md §4.7).
    pub fn handle_error(&self, session_key: &str, err: &RawError) -> Action {
        let classification = self.classifier.lock().classify(err);
        {
            let mut stats = self.stats.lock();
            *stats.error_histogram.entry(classification.kind).or_insert(0) += 1;
        }

        if classification.action != RecoveryAction::Restart {
            return match classification.action {
                RecoveryAction::Retry => self.retry_action(session_key, &classification),
                RecoveryAction::Escalate => Action::Escalate,
                RecoveryAction::Ignore => Action::Ignore,
                RecoveryAction::Restart => unreachable!("handled by the branch above"),
            };
        }

        // Restart is a multi-step, externally-driven operation (the caller
        // invokes Supervisor.Restart and reports back via `record_success`/
        // `record_failure`), so it is gated on breaker state rather than
        // acquiring and immediately dropping a permit.
        if self.breaker.state(self.clock.now()).state == relay_core::CircuitState::Open {
            return Action::Escalate;
        }

        let now = self.clock.now();
        let config = self.config.lock();
        let mut sessions = self.per_session.lock();
        let entry = sessions.entry(session_key.to_string()).or_insert_with(|| SessionBookkeeping {
            backoff: Backoff::new(now)
                .with_max_retries(config.max_restarts)
                .with_last_retry_interval(config.restart_interval),
            last_delay: config.base_delay,
        });

        if !entry.backoff.should_backoff(now) {
            return Action::Escalate;
        }

        self.stats.lock().restart_count += 1;
        Action::Restart
    }

    fn retry_action(&self, session_key: &str, classification: &relay_core::ErrorClassification) -> Action {
        let now = self.clock.now();
        let config = self.config.lock();
        let mut sessions = self.per_session.lock();
        let entry = sessions.entry(session_key.to_string()).or_insert_with(|| SessionBookkeeping {
            backoff: Backoff::new(now)
                .with_max_retries(config.max_restarts)
                .with_last_retry_interval(config.restart_interval),
            last_delay: config.base_delay,
        });

        let attempt = entry.backoff.tries() + 1;
        let delay = backoff::delay(
            attempt,
            classification.backoff_family,
            config.base_delay,
            config.max_backoff,
            entry.last_delay,
            jitter_sample(attempt),
        );
        entry.last_delay = delay;
        Action::Retry { after: delay }
    }

    /// Call when a session completed a full run without error, so its
    /// bookkeeping starts fresh and the success histogram advances.
    pub fn record_success(&self, session_key: &str) {
        self.per_session.lock().remove(session_key);
        self.stats.lock().successful_runs += 1;
    }

    pub fn recovery_stats(&self) -> RecoveryStats {
        self.stats.lock().clone()
    }

    /// The breaker gating this orchestrator's operation family, so callers
    /// can record the outcome of a restart they drove to completion.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

/// Deterministic-enough jitter source: derived from the attempt number
/// rather than real randomness, so tests stay reproducible without needing
/// to inject a jitter source through every call.
fn jitter_sample(attempt: u32) -> f64 {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(u64::from(attempt));
    rng.gen_range(0.0..1.0)
}
