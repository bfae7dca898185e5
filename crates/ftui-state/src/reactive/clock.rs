#![forbid(unsafe_code)]

//! Time source for paced (debounced/throttled) deliveries.
//!
//! A runtime asks its [`Clock`] for "now" in two places only: when a paced
//! subscription parks a value, and when `flush_timers` decides which parked
//! values are due. Swapping in a [`ManualClock`] makes both decisions depend
//! on nothing but the test's own `advance` calls.

use std::cell::Cell;
use std::rc::Rc;

use web_time::{Duration, Instant};

/// Where a runtime reads the current instant from.
#[derive(Debug, Clone, Default)]
pub enum Clock {
    #[default]
    System,
    /// Stepped by hand; shared by every runtime holding a clone.
    Manual(ManualClock),
}

impl Clock {
    #[must_use]
    pub fn now(&self) -> Instant {
        match self {
            Self::System => Instant::now(),
            Self::Manual(clock) => clock.now(),
        }
    }
}

/// Stepped time for debounce and throttle tests.
///
/// The clock is pinned to the instant it was created and only moves by the
/// amounts passed to [`advance`](Self::advance). Clones share the elapsed
/// time, so a test can keep one clone and hand another to the runtime.
#[derive(Clone)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Rc<Cell<Duration>>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Rc::new(Cell::new(Duration::ZERO)),
        }
    }

    /// Move time forward. Saturates instead of overflowing.
    pub fn advance(&self, step: Duration) {
        self.elapsed.set(self.elapsed.get().saturating_add(step));
    }

    /// Time stepped so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }

    #[must_use]
    pub fn now(&self) -> Instant {
        self.origin
            .checked_add(self.elapsed.get())
            .unwrap_or(self.origin)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualClock")
            .field("elapsed", &self.elapsed.get())
            .finish()
    }
}
