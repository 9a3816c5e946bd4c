//! Time sources for bucket arithmetic.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

/// Clock abstraction so refill timing can be faked in tests.
///
/// Times are fractional seconds. The shared store receives `now` from the
/// caller rather than reading its own clock, so every participating process
/// must use a clock on the same (wall-clock) timeline.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> f64;
}

/// Wall-clock time since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    /// Create a clock frozen at `start` seconds.
    pub fn new(start: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward (or backward, for clock-anomaly tests) by `secs`.
    pub fn advance(&self, secs: f64) {
        *self.now.lock() += secs;
    }

    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}
