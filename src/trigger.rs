//! Periodic triggers driven by tick advances.
//!
//! A trigger fires its callback once for every period boundary the tick has
//! reached, including boundaries that were passed while the scheduler was
//! blocked. Period changes may be requested from any thread; they are queued
//! and take effect at the next boundary, never mid-period.

use crate::queue::HandoffQueue;
use crate::tick::{tick_reached, Tick, TimeSpec};
use log::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

const CHANGE_QUEUE_SOFT_LIMIT: usize = 16;

static NEXT_TRIGGER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TriggerError {
    #[error("trigger period must be > 0")]
    ZeroPeriod,
    #[error("trigger {0} has been detached")]
    Detached(u64),
}

/// Boundaries at `offset + k * period`, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicSpec {
    offset: Tick,
    period: u32,
}

impl PeriodicSpec {
    pub fn new(offset: Tick, period: u32) -> Result<Self, TriggerError> {
        if period == 0 {
            return Err(TriggerError::ZeroPeriod);
        }
        Ok(Self {
            offset: offset % period,
            period,
        })
    }

    pub fn offset(&self) -> Tick {
        self.offset
    }

    pub fn period(&self) -> u32 {
        self.period
    }

    /// First boundary at or after `tick`.
    pub fn first_boundary_from(&self, tick: Tick) -> Tick {
        let phase = tick.wrapping_sub(self.offset) % self.period;
        if phase == 0 {
            tick
        } else {
            tick.wrapping_add(self.period - phase)
        }
    }

    /// First boundary strictly after `tick`.
    pub fn first_boundary_after(&self, tick: Tick) -> Tick {
        self.first_boundary_from(tick.wrapping_add(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingChange {
    Period(u32),
    Spec(PeriodicSpec),
}

struct TriggerShared {
    id: u64,
    changes: HandoffQueue<PendingChange>,
    detached: AtomicBool,
}

/// Thread-safe handle for rebinding or detaching a trigger.
#[derive(Clone)]
pub struct TriggerHandle {
    shared: Arc<TriggerShared>,
}

impl TriggerHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Requests a new period, keeping the phase of the boundary where the
    /// change lands.
    pub fn change_period(&self, period: u32) -> Result<(), TriggerError> {
        if period == 0 {
            return Err(TriggerError::ZeroPeriod);
        }
        self.request(PendingChange::Period(period))
    }

    /// Requests a new boundary grid. The first new boundary is the first
    /// grid point after the boundary where the change lands.
    pub fn change_period_and_offset(&self, offset: Tick, period: u32) -> Result<(), TriggerError> {
        let spec = PeriodicSpec::new(offset, period)?;
        self.request(PendingChange::Spec(spec))
    }

    fn request(&self, change: PendingChange) -> Result<(), TriggerError> {
        if self.is_detached() {
            return Err(TriggerError::Detached(self.shared.id));
        }
        self.shared.changes.push(change);
        Ok(())
    }

    /// Stops the trigger permanently. It is dropped at its next evaluation.
    pub fn detach(&self) {
        self.shared.detached.store(true, Ordering::Release);
    }

    pub fn is_detached(&self) -> bool {
        self.shared.detached.load(Ordering::Acquire)
    }
}

type Callback = Box<dyn FnMut(TimeSpec) + Send>;

/// One periodic subscription. Evaluated by the scheduling thread only.
pub struct PeriodicTrigger {
    shared: Arc<TriggerShared>,
    spec: PeriodicSpec,
    pending: Option<PendingChange>,
    next: Tick,
    callback: Callback,
}

impl PeriodicTrigger {
    /// Creates a trigger whose first boundary is the first one at or after
    /// `start`.
    pub fn new<F>(spec: PeriodicSpec, start: Tick, callback: F) -> (Self, TriggerHandle)
    where
        F: FnMut(TimeSpec) + Send + 'static,
    {
        let shared = Arc::new(TriggerShared {
            id: NEXT_TRIGGER_ID.fetch_add(1, Ordering::Relaxed),
            changes: HandoffQueue::new("periodic trigger changes", CHANGE_QUEUE_SOFT_LIMIT),
            detached: AtomicBool::new(false),
        });
        let trigger = Self {
            shared: Arc::clone(&shared),
            spec,
            pending: None,
            next: spec.first_boundary_from(start),
            callback: Box::new(callback),
        };
        (trigger, TriggerHandle { shared })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn spec(&self) -> PeriodicSpec {
        self.spec
    }

    pub fn next_boundary(&self) -> Tick {
        self.next
    }

    pub fn is_detached(&self) -> bool {
        self.shared.detached.load(Ordering::Acquire)
    }

    /// Fires once for every boundary up to and including
    /// `current_interval.end`, oldest first. The callback receives the span
    /// from the boundary to the following one. Returns the number of firings.
    pub fn on_tick_advance(&mut self, current_interval: TimeSpec) -> usize {
        if self.is_detached() {
            return 0;
        }
        // Only the newest request counts.
        if let Some(change) = self.shared.changes.drain().last() {
            self.pending = Some(change);
        }

        let mut fired = 0;
        while tick_reached(self.next, current_interval.end) {
            let boundary = self.next;
            let following = match self.pending.take() {
                Some(change) => self.swap_at(boundary, change),
                None => boundary.wrapping_add(self.spec.period),
            };
            (self.callback)(TimeSpec::new(boundary, following));
            self.next = following;
            fired += 1;
        }
        fired
    }

    /// Moves the next boundary to the first one at or after `tick`, for when
    /// the tick was force-set. Boundaries skipped by a forward jump do not
    /// fire and a backward jump does not wait out the old boundary.
    pub fn rebase(&mut self, tick: Tick) {
        let next = self.spec.first_boundary_from(tick);
        if next != self.next {
            debug!(
                "Trigger {}: next boundary {} -> {next} after tick jump",
                self.shared.id, self.next
            );
            self.next = next;
        }
    }

    /// Installs `change` at `boundary` and returns the next boundary.
    fn swap_at(&mut self, boundary: Tick, change: PendingChange) -> Tick {
        let (spec, following) = match change {
            PendingChange::Period(period) => {
                let spec = PeriodicSpec {
                    offset: boundary % period,
                    period,
                };
                (spec, boundary.wrapping_add(period))
            }
            PendingChange::Spec(spec) => (spec, spec.first_boundary_after(boundary)),
        };
        debug!(
            "Trigger {}: period {} -> {} at tick {boundary}, next boundary {following}",
            self.shared.id, self.spec.period, spec.period
        );
        self.spec = spec;
        following
    }
}

/// The triggers evaluated by one scheduling loop.
#[derive(Default)]
pub struct TriggerSet {
    triggers: Vec<PeriodicTrigger>,
}

impl TriggerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, spec: PeriodicSpec, start: Tick, callback: F) -> TriggerHandle
    where
        F: FnMut(TimeSpec) + Send + 'static,
    {
        let (trigger, handle) = PeriodicTrigger::new(spec, start, callback);
        self.triggers.push(trigger);
        handle
    }

    /// Detaches and removes a trigger at once.
    pub fn unsubscribe(&mut self, handle: &TriggerHandle) {
        handle.detach();
        self.triggers.retain(|trigger| trigger.id() != handle.id());
    }

    pub fn change_period(&self, handle: &TriggerHandle, period: u32) -> Result<(), TriggerError> {
        handle.change_period(period)
    }

    pub fn change_period_and_offset(
        &self,
        handle: &TriggerHandle,
        offset: Tick,
        period: u32,
    ) -> Result<(), TriggerError> {
        handle.change_period_and_offset(offset, period)
    }

    /// Evaluates every live trigger; detached ones are dropped first.
    pub fn on_tick_advance(&mut self, current_interval: TimeSpec) -> usize {
        self.triggers.retain(|trigger| !trigger.is_detached());
        self.triggers
            .iter_mut()
            .map(|trigger| trigger.on_tick_advance(current_interval))
            .sum()
    }

    /// Re-anchors every trigger on `tick` after a force-set.
    pub fn rebase(&mut self, tick: Tick) {
        for trigger in &mut self.triggers {
            trigger.rebase(tick);
        }
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording(spec: PeriodicSpec, start: Tick) -> (PeriodicTrigger, TriggerHandle, Arc<Mutex<Vec<TimeSpec>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let (trigger, handle) = PeriodicTrigger::new(spec, start, move |span| {
            sink.lock().unwrap().push(span);
        });
        (trigger, handle, fired)
    }

    fn starts(fired: &Mutex<Vec<TimeSpec>>) -> Vec<Tick> {
        fired.lock().unwrap().iter().map(|span| span.start).collect()
    }

    #[test]
    fn zero_period_is_rejected() {
        assert_eq!(PeriodicSpec::new(0, 0), Err(TriggerError::ZeroPeriod));
    }

    #[test]
    fn boundaries_respect_offset() {
        let spec = PeriodicSpec::new(3, 10).unwrap();
        assert_eq!(spec.first_boundary_from(0), 3);
        assert_eq!(spec.first_boundary_from(3), 3);
        assert_eq!(spec.first_boundary_after(3), 13);
        assert_eq!(spec.first_boundary_from(14), 23);
    }

    #[test]
    fn fires_on_each_boundary_reached() {
        let (mut trigger, _handle, fired) = recording(PeriodicSpec::new(0, 10).unwrap(), 0);
        for tick in (0..=30u32).step_by(5) {
            trigger.on_tick_advance(TimeSpec::new(tick.saturating_sub(5), tick));
        }
        assert_eq!(starts(&fired), vec![0, 10, 20, 30]);
        assert_eq!(fired.lock().unwrap()[1], TimeSpec::new(10, 20));
    }

    #[test]
    fn catch_up_fires_with_historical_ticks() {
        let (mut trigger, _handle, fired) = recording(PeriodicSpec::new(0, 10).unwrap(), 0);
        trigger.on_tick_advance(TimeSpec::new(0, 0));
        assert_eq!(trigger.on_tick_advance(TimeSpec::new(0, 35)), 3);
        assert_eq!(starts(&fired), vec![0, 10, 20, 30]);
    }

    #[test]
    fn period_change_lands_on_next_boundary() {
        let (mut trigger, handle, fired) = recording(PeriodicSpec::new(0, 10).unwrap(), 0);
        trigger.on_tick_advance(TimeSpec::new(0, 25));
        handle.change_period(7).unwrap();
        trigger.on_tick_advance(TimeSpec::new(25, 60));
        assert_eq!(starts(&fired), vec![0, 10, 20, 30, 37, 44, 51, 58]);
        assert_eq!(trigger.spec().period(), 7);
    }

    #[test]
    fn period_and_offset_change_picks_next_grid_point() {
        let (mut trigger, handle, fired) = recording(PeriodicSpec::new(0, 10).unwrap(), 0);
        trigger.on_tick_advance(TimeSpec::new(0, 15));
        handle.change_period_and_offset(3, 8).unwrap();
        trigger.on_tick_advance(TimeSpec::new(15, 45));
        assert_eq!(starts(&fired), vec![0, 10, 20, 27, 35, 43]);
        assert_eq!(fired.lock().unwrap()[2], TimeSpec::new(20, 27));
    }

    #[test]
    fn latest_change_request_wins() {
        let (mut trigger, handle, fired) = recording(PeriodicSpec::new(0, 10).unwrap(), 0);
        trigger.on_tick_advance(TimeSpec::new(0, 5));
        handle.change_period(3).unwrap();
        handle.change_period(5).unwrap();
        trigger.on_tick_advance(TimeSpec::new(5, 25));
        assert_eq!(starts(&fired), vec![0, 10, 15, 20, 25]);
    }

    #[test]
    fn detached_trigger_stops_and_rejects_changes() {
        let mut set = TriggerSet::new();
        let fired = Arc::new(Mutex::new(0));
        let count = Arc::clone(&fired);
        let handle = set.subscribe(PeriodicSpec::new(0, 10).unwrap(), 0, move |_| {
            *count.lock().unwrap() += 1;
        });
        assert_eq!(set.on_tick_advance(TimeSpec::new(0, 10)), 2);
        handle.detach();
        assert_eq!(set.on_tick_advance(TimeSpec::new(10, 40)), 0);
        assert!(set.is_empty());
        assert_eq!(*fired.lock().unwrap(), 2);
        assert_eq!(handle.change_period(5), Err(TriggerError::Detached(handle.id())));
    }

    #[test]
    fn unsubscribe_removes_only_that_trigger() {
        let mut set = TriggerSet::new();
        let first = set.subscribe(PeriodicSpec::new(0, 10).unwrap(), 0, |_| {});
        let _second = set.subscribe(PeriodicSpec::new(0, 5).unwrap(), 0, |_| {});
        set.unsubscribe(&first);
        assert_eq!(set.len(), 1);
        assert_eq!(set.on_tick_advance(TimeSpec::new(0, 10)), 3);
    }

    #[test]
    fn rebase_after_forward_jump_skips_old_boundaries() {
        let (mut trigger, _handle, fired) = recording(PeriodicSpec::new(0, 10).unwrap(), 0);
        trigger.on_tick_advance(TimeSpec::new(0, 5));
        trigger.rebase(1_003);
        assert_eq!(trigger.next_boundary(), 1_010);
        assert_eq!(trigger.on_tick_advance(TimeSpec::new(1_003, 1_010)), 1);
        assert_eq!(starts(&fired), vec![0, 1_010]);
    }

    #[test]
    fn rebase_after_backward_jump_keeps_firing() {
        let mut set = TriggerSet::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        set.subscribe(PeriodicSpec::new(0, 10).unwrap(), 0, move |span: TimeSpec| {
            sink.lock().unwrap().push(span.start);
        });
        set.on_tick_advance(TimeSpec::new(0, 500));
        fired.lock().unwrap().clear();

        set.rebase(100);
        assert_eq!(set.on_tick_advance(TimeSpec::new(100, 120)), 3);
        assert_eq!(*fired.lock().unwrap(), vec![100, 110, 120]);
    }

    #[test]
    fn boundaries_survive_tick_wrap() {
        let start = u32::MAX - 14;
        let spec = PeriodicSpec::new(start % 10, 10).unwrap();
        let (mut trigger, _handle, fired) = recording(spec, start);
        trigger.on_tick_advance(TimeSpec::new(start, start.wrapping_add(20)));
        assert_eq!(
            starts(&fired),
            vec![start, start.wrapping_add(10), start.wrapping_add(20)]
        );
    }
}
