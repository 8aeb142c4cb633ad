//! Time sources read by the synchronizer.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// A clock in microseconds since an arbitrary epoch, plus the matching way to
/// wait on it.
pub trait TimeSource: Send + Sync {
    fn now_usecs(&self) -> i64;

    /// Blocks the calling thread for `usecs`. Non-positive values return at once.
    fn sleep_usecs(&self, usecs: i64) {
        if usecs > 0 {
            std::thread::sleep(Duration::from_micros(usecs as u64));
        }
    }
}

/// OS monotonic clock.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::with_epoch(Instant::now())
    }

    /// Shares an epoch with other clocks, e.g. a [`SimulatedClock`](super::SimulatedClock).
    pub fn with_epoch(epoch: Instant) -> Self {
        Self { epoch }
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now_usecs(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }
}

/// Virtual clock that only moves when told to. Sleeping advances it, so a
/// scheduling loop runs deterministically and instantly against it.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_usecs: i64) -> Self {
        Self {
            now: AtomicI64::new(start_usecs),
        }
    }

    pub fn advance(&self, usecs: i64) {
        self.now.fetch_add(usecs, Ordering::AcqRel);
    }

    pub fn set(&self, usecs: i64) {
        self.now.store(usecs, Ordering::Release);
    }
}

impl TimeSource for ManualClock {
    fn now_usecs(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }

    fn sleep_usecs(&self, usecs: i64) {
        if usecs > 0 {
            self.advance(usecs);
        }
    }
}
