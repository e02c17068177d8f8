// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Backoff Calculator (spec.md §4.6): a pure function from attempt count and
//! policy to a delay, plus the `Backoff` bookkeeping struct that decides
//! whether another retry is still within budget.
//!
//! The `fixed`/`linear`/`exponential` families and the `Backoff` struct shape
//! are grounded on `src/supervisor/restart.rs`. `decorrelated_jitter` has no
//! teacher counterpart and is built from the same
//! `backoff(delay_func, sleep_func)` dispatch idiom.

use relay_core::BackoffFamily;
use std::time::{Duration, Instant};

/// How long to reuse the last interval before resetting the attempt counter.
const LAST_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// `base`, unmodified.
pub fn fixed(base: Duration, max: Duration) -> Duration {
    base.min(max)
}

/// `base * attempt`.
pub fn linear(attempt: u32, base: Duration, max: Duration) -> Duration {
    let attempt = attempt.max(1);
    base.saturating_mul(attempt).min(max)
}

/// `base * 2^(attempt-1)`, clamped to `max`.
pub fn exponential(attempt: u32, base: Duration, max: Duration) -> Duration {
    let attempt = attempt.max(1);
    let shift = (attempt - 1).min(31);
    base.saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX))
        .min(max)
}

/// Previous delay and base combined with uniform jitter, clamped to `max`.
/// Recommended default for network-style faults (spec.md §4.6). Jitter is
/// mandatory for this family to avoid thundering-herd restarts.
pub fn decorrelated_jitter(previous: Duration, base: Duration, max: Duration, jitter: f64) -> Duration {
    debug_assert!((0.0..=1.0).contains(&jitter));
    let floor = base.as_secs_f64();
    let ceiling = (previous.as_secs_f64() * 3.0).max(floor);
    let span = ceiling - floor;
    let picked = floor + span * jitter;
    Duration::from_secs_f64(picked).min(max)
}

/// Compute the delay for `attempt` under `family`, given the previous delay
/// (used only by `decorrelated_jitter`) and a `[0, 1)` jitter sample. Callers
/// that don't need jitter for a non-jittered family may pass `0.0`.
pub fn delay(
    attempt: u32,
    family: BackoffFamily,
    base: Duration,
    max: Duration,
    previous: Duration,
    jitter: f64,
) -> Duration {
    match family {
        BackoffFamily::Fixed => fixed(base, max),
        BackoffFamily::Linear => linear(attempt, base, max),
        BackoffFamily::Exponential => exponential(attempt, base, max),
        BackoffFamily::DecorrelatedJitter => decorrelated_jitter(previous, base, max, jitter),
    }
}

/// Tracks attempts for one retrying operation and decides whether another
/// attempt is still within the configured budget. Grounded on
/// `restart.rs`'s `Backoff` struct.
#[derive(Debug, Clone)]
pub struct Backoff {
    tries: u32,
    last_retry: Instant,
    last_retry_interval: Duration,
    max_retries: u32,
}

impl Backoff {
    pub fn new(now: Instant) -> Self {
        Self {
            tries: 0,
            last_retry: now,
            last_retry_interval: LAST_RETRY_INTERVAL,
            max_retries: 0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_last_retry_interval(mut self, interval: Duration) -> Self {
        self.last_retry_interval = interval;
        self
    }

    /// Records an attempt at `now`, resetting the counter if the last retry
    /// was long enough ago. Returns whether another retry is within budget.
    pub fn should_backoff(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last_retry) > self.last_retry_interval {
            self.tries = 0;
        }
        self.tries += 1;
        self.last_retry = now;
        self.max_retries == 0 || self.tries <= self.max_retries
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_is_always_base_clamped() {
        assert_eq!(fixed(Duration::from_secs(5), Duration::from_secs(60)), Duration::from_secs(5));
        assert_eq!(fixed(Duration::from_secs(500), Duration::from_secs(60)), Duration::from_secs(60));
    }

    #[test]
    fn linear_scales_with_attempt() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(100);
        assert_eq!(linear(1, base, max), Duration::from_secs(2));
        assert_eq!(linear(3, base, max), Duration::from_secs(6));
    }

    #[test]
    fn exponential_doubles_each_attempt() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(60);
        assert_eq!(exponential(1, base, max), Duration::from_millis(100));
        assert_eq!(exponential(2, base, max), Duration::from_millis(200));
        assert_eq!(exponential(3, base, max), Duration::from_millis(400));
    }

    #[test]
    fn exponential_is_capped_at_max() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(10);
        assert_eq!(exponential(20, base, max), max);
    }

    #[test]
    fn decorrelated_jitter_is_bounded_by_floor_and_max() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        let previous = Duration::from_secs(5);
        let low = decorrelated_jitter(previous, base, max, 0.0);
        let high = decorrelated_jitter(previous, base, max, 1.0);
        assert!(low >= base);
        assert!(high <= max);
        assert!(low <= high);
    }

    #[test]
    fn should_backoff_respects_max_retries() {
        let now = Instant::now();
        let mut backoff = Backoff::new(now).with_max_retries(2);
        assert!(backoff.should_backoff(now));
        assert!(backoff.should_backoff(now));
        assert!(!backoff.should_backoff(now));
    }

    #[test]
    fn should_backoff_resets_after_interval_elapses() {
        let now = Instant::now();
        let mut backoff = Backoff::new(now)
            .with_max_retries(1)
            .with_last_retry_interval(Duration::from_secs(10));
        assert!(backoff.should_backoff(now));
        assert!(!backoff.should_backoff(now));
        let later = now + Duration::from_secs(11);
        assert!(backoff.should_backoff(later));
    }

    #[test]
    fn zero_max_retries_means_unbounded() {
        let now = Instant::now();
        let mut backoff = Backoff::new(now);
        for _ in 0..1000 {
            assert!(backoff.should_backoff(now));
        }
    }
}
