// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Injectable time source, so components that sleep, probe on an interval, or
//! stamp events can be driven deterministically in tests.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A source of monotonic instants and wall-clock milliseconds.
///
/// Every component that would otherwise call `Instant::now()` or
/// `SystemTime::now()` directly takes a `Clock` at construction instead, so
/// health probes, backoff delays, and idle/lifetime timeouts can be exercised
/// with a `FakeClock` rather than real sleeps.
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    fn epoch_ms(&self) -> u64;
}

/// Real wall-clock implementation used in production.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn epoch_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Deterministic clock for tests: advances only when told to.
#[derive(Clone)]
pub struct FakeClock {
    current: Arc<Mutex<Instant>>,
    epoch_ms: Arc<Mutex<u64>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(Instant::now())),
            epoch_ms: Arc::new(Mutex::new(0)),
        }
    }

    /// Advance the clock by `duration`, also advancing `epoch_ms` by the same
    /// amount so the two stay consistent.
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock();
        *current += duration;
        let mut epoch = self.epoch_ms.lock();
        *epoch += duration.as_millis() as u64;
    }

    pub fn set(&self, instant: Instant) {
        let mut current = self.current.lock();
        *current = instant;
    }

    pub fn set_epoch_ms(&self, ms: u64) {
        let mut epoch = self.epoch_ms.lock();
        *epoch = ms;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.current.lock()
    }

    fn epoch_ms(&self) -> u64 {
        *self.epoch_ms.lock()
    }
}
