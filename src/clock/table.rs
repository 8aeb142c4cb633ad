//! Rotating table from recent ticks to the ideal time they occurred.
//!
//! One writer (the scheduling thread), any number of readers. Each slot is a
//! small seqlock so a reader never observes a tick paired with another tick's
//! time; a reader that keeps colliding with the writer gives up with
//! [`LookupError::Torn`] after a bounded number of retries.

use crate::tick::{tick_delta, Tick};
use std::sync::atomic::{fence, AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use thiserror::Error;

const MAX_RETRIES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("no tick has been recorded yet")]
    Empty,
    #[error("tick is older than the recorded history")]
    Expired,
    #[error("table entry kept changing while being read")]
    Torn,
}

#[derive(Debug, Default)]
struct Slot {
    seq: AtomicU64,
    tick: AtomicU32,
    time: AtomicI64,
}

#[derive(Debug)]
pub struct TickTimeTable {
    slots: Box<[Slot]>,
    base_increment: u32,
    usecs_per_tick: f64,
    latest: AtomicU32,
    /// First tick recorded since the last reset; anything before it is history
    /// the table no longer vouches for.
    oldest: AtomicU32,
    populated: AtomicBool,
}

impl TickTimeTable {
    pub fn new(size: usize, base_increment: u32, usecs_per_tick: f64) -> Self {
        Self {
            slots: (0..size).map(|_| Slot::default()).collect(),
            base_increment: base_increment.max(1),
            usecs_per_tick,
            latest: AtomicU32::new(0),
            oldest: AtomicU32::new(0),
            populated: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.populated.load(Ordering::Acquire)
    }

    /// Age in ticks beyond which entries are no longer guaranteed.
    pub fn window(&self) -> i64 {
        (self.slots.len() as i64 - 1) * self.base_increment as i64
    }

    /// Newest recorded tick, if any.
    pub fn latest(&self) -> Option<Tick> {
        if self.populated.load(Ordering::Acquire) {
            Some(self.latest.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Newest entry as `(tick, ideal time)`, unless a concurrent write got in
    /// the way.
    pub fn newest(&self) -> Option<(Tick, i64)> {
        let latest = self.latest()?;
        self.read(self.index(latest))
            .filter(|(recorded, _)| *recorded == latest)
    }

    #[inline]
    fn index(&self, tick: Tick) -> usize {
        let index = (tick / self.base_increment) as usize % self.slots.len();
        debug_assert!(index < self.slots.len());
        index
    }

    fn write(&self, tick: Tick, time: i64) {
        let slot = &self.slots[self.index(tick)];
        let seq = slot.seq.load(Ordering::Relaxed);
        slot.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        slot.tick.store(tick, Ordering::Relaxed);
        slot.time.store(time, Ordering::Relaxed);
        slot.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    fn read(&self, index: usize) -> Option<(Tick, i64)> {
        let slot = &self.slots[index];
        for _ in 0..MAX_RETRIES {
            let before = slot.seq.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let tick = slot.tick.load(Ordering::Relaxed);
            let time = slot.time.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            if slot.seq.load(Ordering::Relaxed) == before {
                return Some((tick, time));
            }
        }
        None
    }

    /// Records the ideal time of `tick`. When `previous` lies more than one
    /// step back, the skipped steps are filled by linear interpolation so the
    /// table stays dense; only the steps that still fit in the table, the
    /// newest ones, are written. `previous == None` starts a new history.
    pub fn record(&self, previous: Option<(Tick, i64)>, tick: Tick, time: i64) {
        match previous {
            Some((prev_tick, prev_time)) => {
                let span = tick_delta(prev_tick, tick);
                let base = self.base_increment as i64;
                if span > base {
                    let skipped = (span - 1) / base;
                    let first = skipped - skipped.min(self.slots.len() as i64 - 1) + 1;
                    for k in first..=skipped {
                        let offset = k * base;
                        let fill = prev_tick.wrapping_add(offset as u32);
                        let fill_time = prev_time + (time - prev_time) * offset / span;
                        self.write(fill, fill_time);
                    }
                }
                // Keep `oldest` within the window so wrap-around cannot flip it.
                let oldest = self.oldest.load(Ordering::Relaxed);
                if tick_delta(oldest, tick) > self.window() {
                    self.oldest
                        .store(tick.wrapping_sub(self.window() as u32), Ordering::Release);
                }
            }
            None => self.oldest.store(tick, Ordering::Release),
        }
        self.write(tick, time);
        self.latest.store(tick, Ordering::Release);
        self.populated.store(true, Ordering::Release);
    }

    /// Forgets all history, e.g. after the tick counter was force-set.
    pub fn reset(&self) {
        self.populated.store(false, Ordering::Release);
    }

    /// Ideal time at which `tick` occurred. Ticks after the newest entry are
    /// extrapolated from it; ticks within a step are interpolated from the
    /// step's entry.
    pub fn lookup(&self, tick: Tick) -> Result<i64, LookupError> {
        if !self.populated.load(Ordering::Acquire) {
            return Err(LookupError::Empty);
        }
        for _ in 0..MAX_RETRIES {
            let latest = self.latest.load(Ordering::Acquire);
            let age = tick_delta(tick, latest);

            if age < 0 {
                match self.read(self.index(latest)) {
                    Some((recorded, time)) if recorded == latest => {
                        return Ok(time + self.span_usecs(latest, tick));
                    }
                    _ => continue,
                }
            }
            let oldest = self.oldest.load(Ordering::Acquire);
            if age >= self.window() || tick_delta(oldest, tick) < 0 {
                return Err(LookupError::Expired);
            }

            match self.read(self.index(tick)) {
                Some((recorded, time))
                    if recorded / self.base_increment == tick / self.base_increment =>
                {
                    return Ok(time + self.span_usecs(recorded, tick));
                }
                // Slot rewritten for a newer step, or not yet written: re-check
                // the window against a fresh `latest`.
                _ => continue,
            }
        }
        Err(LookupError::Torn)
    }

    /// Real time between two ticks at the nominal rate.
    pub fn span_usecs(&self, from: Tick, to: Tick) -> i64 {
        (tick_delta(from, to) as f64 * self.usecs_per_tick).round() as i64
    }
}
