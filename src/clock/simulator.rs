//! Simulated remote clock with configurable drift and read uncertainty.
//!
//! ## Units
//!
//! | Parameter    | Unit           | Description                                  |
//! |--------------|----------------|----------------------------------------------|
//! | Offset       | μs             | Constant offset from the reference clock     |
//! | Drift rate   | μs per second  | Clock gains (+) or loses (−) this many μs/s  |
//! | Uncertainty  | μs             | Each read lands uniformly in [t−ε, t+ε]      |
//! | now_usecs()  | μs             | Simulated timestamp in microseconds          |
//!
//! Used to stand in for a master node when no transport is available.

use super::source::TimeSource;
use rand::Rng;
use std::sync::Arc;

/// A clock derived from a reference clock, running off by a fixed offset and a
/// constant drift, with noisy reads.
pub struct SimulatedClock {
    /// Reference clock the simulation is derived from
    reference: Arc<dyn TimeSource>,
    /// Constant offset in μs
    offset: i64,
    /// Drift rate in μs per second (positive = fast, negative = slow)
    drift_rate: f64,
    /// Read uncertainty ±ε in μs
    uncertainty_bound: f64,
}

impl SimulatedClock {
    /// Creates a new simulated clock.
    ///
    /// # Arguments
    /// * `reference` - Clock the simulation runs against
    /// * `offset` - Constant offset from the reference in μs
    /// * `drift` - Drift rate in μs per second
    /// * `epsilon` - Read uncertainty ±ε in μs
    pub fn new(reference: Arc<dyn TimeSource>, offset: i64, drift: f64, epsilon: f64) -> Self {
        assert!(epsilon >= 0.0, "epsilon must be >= 0.0");
        Self {
            reference,
            offset,
            drift_rate: drift,
            uncertainty_bound: epsilon,
        }
    }

    /// Returns the read uncertainty ±ε in microseconds (μs).
    pub fn uncertainty(&self) -> f64 {
        self.uncertainty_bound
    }

    pub fn drift_rate(&self) -> f64 {
        self.drift_rate
    }

    /// Simulated time without read noise.
    pub fn true_usecs(&self) -> i64 {
        let reference = self.reference.now_usecs();
        // Drift: drift_rate μs per reference second
        let drift = (reference as f64 / 1_000_000.0) * self.drift_rate;
        reference + self.offset + drift.round() as i64
    }
}

impl TimeSource for SimulatedClock {
    fn now_usecs(&self) -> i64 {
        let noise = if self.uncertainty_bound > 0.0 {
            rand::thread_rng().gen_range(-self.uncertainty_bound..=self.uncertainty_bound)
        } else {
            0.0
        };
        self.true_usecs() + noise.round() as i64
    }

    fn sleep_usecs(&self, usecs: i64) {
        self.reference.sleep_usecs(usecs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn drift_accumulates_per_second() {
        let reference = Arc::new(ManualClock::new(0));
        let clock = SimulatedClock::new(reference.clone(), 500, 50.0, 0.0);
        assert_eq!(clock.now_usecs(), 500);
        reference.advance(2_000_000);
        assert_eq!(clock.now_usecs(), 2_000_000 + 500 + 100);
    }

    #[test]
    fn reads_stay_within_uncertainty() {
        let reference = Arc::new(ManualClock::new(1_000_000));
        let clock = SimulatedClock::new(reference, 0, 0.0, 25.0);
        for _ in 0..200 {
            let read = clock.now_usecs();
            assert!((read - 1_000_000).abs() <= 25);
        }
    }
}
