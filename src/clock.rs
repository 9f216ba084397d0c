//! A monotonic clock abstraction, isolated so the stuck detector can be fed
//! an injected clock in tests instead of real wall-clock time.

use std::cell::Cell;
use std::fmt;
use std::time::{Duration, Instant};

/// A source of monotonically non-decreasing timestamps.
pub trait Clock: fmt::Debug {
    /// Time elapsed since some arbitrary reference point fixed at
    /// construction. Only differences between two calls are meaningful.
    fn now(&self) -> Duration;
}

/// The real wall clock, anchored at construction time.
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// A clock tests can advance by hand.
#[derive(Debug, Default)]
pub struct FakeClock {
    now: Cell<Duration>,
}

impl FakeClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, now: Duration) {
        self.now.set(now);
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}
