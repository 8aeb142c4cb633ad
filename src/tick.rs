//! Process-wide tick counter and tick arithmetic.
//!
//! Ticks are `u32` and wrap at the width boundary. Every comparison between
//! two ticks goes through [`tick_delta`] so that ordering survives the wrap.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// Discrete simulation step counter value.
pub type Tick = u32;

/// Signed distance `to - from`, tolerant of wrap-around.
#[inline]
pub fn tick_delta(from: Tick, to: Tick) -> i64 {
    to.wrapping_sub(from) as i32 as i64
}

/// True once `now` has reached or passed `target`.
#[inline]
pub fn tick_reached(target: Tick, now: Tick) -> bool {
    tick_delta(target, now) >= 0
}

/// Span of ticks from `start` to `end`.
///
/// `end` is the tick just reached and counts as covered: a trigger boundary
/// equal to `end` fires for this span. A boundary equal to `start` fired for
/// the previous span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpec {
    pub start: Tick,
    pub end: Tick,
}

impl TimeSpec {
    pub fn new(start: Tick, end: Tick) -> Self {
        Self { start, end }
    }

    /// Number of ticks covered by the span.
    pub fn len(&self) -> u32 {
        self.end.wrapping_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Atomic step counter.
///
/// Written by exactly one scheduling thread, read by everyone. No validation
/// is performed: the owner is trusted to advance monotonically.
#[derive(Debug, Default)]
pub struct TickCounter {
    tick: AtomicU32,
}

impl TickCounter {
    pub fn new(start: Tick) -> Self {
        Self {
            tick: AtomicU32::new(start),
        }
    }

    /// Adds `increment` and returns the new tick.
    #[inline]
    pub fn advance(&self, increment: u32) -> Tick {
        self.tick
            .fetch_add(increment, Ordering::AcqRel)
            .wrapping_add(increment)
    }

    #[inline]
    pub fn current(&self) -> Tick {
        self.tick.load(Ordering::Acquire)
    }

    /// Force-sets the counter. Startup and resync only.
    pub fn set(&self, tick: Tick) {
        self.tick.store(tick, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn advance_returns_new_value() {
        let counter = TickCounter::new(10);
        assert_eq!(counter.advance(5), 15);
        assert_eq!(counter.current(), 15);
        counter.set(3);
        assert_eq!(counter.current(), 3);
    }

    #[test]
    fn delta_survives_wrap() {
        let before = u32::MAX - 2;
        let after = before.wrapping_add(5);
        assert_eq!(tick_delta(before, after), 5);
        assert_eq!(tick_delta(after, before), -5);
        assert!(tick_reached(before, after));
        assert!(!tick_reached(after, before));
    }

    #[test]
    fn span_length_wraps() {
        let span = TimeSpec::new(u32::MAX - 1, 3);
        assert_eq!(span.len(), 5);
        assert!(!span.is_empty());
        assert!(TimeSpec::new(7, 7).is_empty());
    }

    proptest! {
        #[test]
        fn current_tick_never_decreases(increments in prop::collection::vec(0u32..10_000, 1..500)) {
            let counter = TickCounter::new(0);
            let mut last = counter.current();
            for increment in increments {
                counter.advance(increment);
                let now = counter.current();
                prop_assert!(now >= last);
                last = now;
            }
        }
    }
}
