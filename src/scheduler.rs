//! The node's scheduling loop: wait, advance the tick, synchronize, fire
//! triggers. This is the only place that sleeps.

use crate::clock::{ClockContext, Synchronizer};
use crate::tick::{Tick, TimeSpec};
use crate::trigger::{PeriodicSpec, TriggerError, TriggerHandle, TriggerSet};
use log::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How the loop turns the synchronizer's advice into a wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Sleep for the advised number of microseconds.
    #[default]
    Precise,
    /// Wait whole steps (0, 1 or 2), as with a fixed-rate OS timer.
    FixedRate,
}

/// Outcome of one scheduler cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub span: TimeSpec,
    pub waited_usecs: i64,
    pub fired: usize,
}

pub struct Scheduler {
    synchronizer: Synchronizer,
    triggers: TriggerSet,
    strategy: WaitStrategy,
    increment: u32,
    granularity_correction: i64,
    running_realtime: bool,
    started: bool,
    /// Tick the triggers were last evaluated at.
    last_tick: Tick,
}

impl Scheduler {
    pub fn new(synchronizer: Synchronizer, strategy: WaitStrategy) -> Self {
        let increment = synchronizer.context().config().base_increment;
        let last_tick = synchronizer.current_tick();
        Self {
            synchronizer,
            triggers: TriggerSet::new(),
            strategy,
            increment,
            granularity_correction: 0,
            running_realtime: true,
            started: false,
            last_tick,
        }
    }

    /// Added to every precise wait, e.g. to compensate a known wake-up latency.
    pub fn with_granularity_correction(mut self, usecs: i64) -> Self {
        self.granularity_correction = usecs;
        self
    }

    pub fn set_running_realtime(&mut self, running_realtime: bool) {
        self.running_realtime = running_realtime;
    }

    pub fn context(&self) -> &Arc<ClockContext> {
        self.synchronizer.context()
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }

    pub fn synchronizer_mut(&mut self) -> &mut Synchronizer {
        &mut self.synchronizer
    }

    pub fn triggers_mut(&mut self) -> &mut TriggerSet {
        &mut self.triggers
    }

    pub fn current_tick(&self) -> Tick {
        self.synchronizer.current_tick()
    }

    /// Force-sets the tick and re-anchors every trigger on it.
    pub fn set_tick(&mut self, tick: Tick) {
        self.synchronizer.set_tick(tick);
        self.triggers.rebase(tick);
        self.last_tick = tick;
    }

    /// Re-anchors the triggers if the tick was force-set behind the loop's
    /// back, e.g. through [`synchronizer_mut`](Self::synchronizer_mut).
    fn follow_tick_jump(&mut self) {
        let tick = self.current_tick();
        if tick != self.last_tick {
            debug!("Tick jumped {} -> {tick}, rebasing triggers", self.last_tick);
            self.triggers.rebase(tick);
            self.last_tick = tick;
        }
    }

    /// Registers a periodic callback starting from the current tick.
    pub fn subscribe<F>(&mut self, spec: PeriodicSpec, callback: F) -> TriggerHandle
    where
        F: FnMut(TimeSpec) + Send + 'static,
    {
        let start = self.current_tick();
        self.triggers.subscribe(spec, start, callback)
    }

    pub fn unsubscribe(&mut self, handle: &TriggerHandle) {
        self.triggers.unsubscribe(handle);
    }

    pub fn change_period(&self, handle: &TriggerHandle, period: u32) -> Result<(), TriggerError> {
        self.triggers.change_period(handle, period)
    }

    pub fn change_period_and_offset(
        &self,
        handle: &TriggerHandle,
        offset: Tick,
        period: u32,
    ) -> Result<(), TriggerError> {
        self.triggers.change_period_and_offset(handle, offset, period)
    }

    /// Anchors the schedule on the current tick and fires boundaries that
    /// fall on it. Called implicitly by the first [`cycle`](Self::cycle).
    pub fn start(&mut self) -> usize {
        self.follow_tick_jump();
        let tick = self.current_tick();
        self.synchronizer.sync_to_tick(tick, self.running_realtime);
        self.started = true;
        info!(
            "Scheduler started at tick {tick}, {:?} waits, {} ticks per cycle",
            self.strategy, self.increment
        );
        self.triggers.on_tick_advance(TimeSpec::new(tick, tick))
    }

    /// Runs one wait/advance/sync/fire cycle.
    ///
    /// When synchronizing resyncs the tick, the reported span is the empty
    /// span at the new tick and only boundaries on that tick fire.
    pub fn cycle(&mut self) -> CycleReport {
        if !self.started {
            self.start();
        }
        self.follow_tick_jump();
        let waited_usecs = match self.strategy {
            WaitStrategy::Precise => self
                .synchronizer
                .usecs_to_next_tick(self.granularity_correction),
            WaitStrategy::FixedRate => {
                let step = self.context().config().step_usecs as i64;
                self.synchronizer.ticks_to_wait() as i64 * step
            }
        };
        self.context().source().sleep_usecs(waited_usecs);

        let mut span = self.synchronizer.advance_tick(self.increment);
        self.synchronizer.sync_to_tick(span.end, self.running_realtime);
        let reached = self.current_tick();
        if reached != span.end {
            info!("Tick resynchronized {} -> {reached}, rebasing triggers", span.end);
            self.triggers.rebase(reached);
            span = TimeSpec::new(reached, reached);
        }
        let fired = self.triggers.on_tick_advance(span);
        self.last_tick = span.end;
        trace!("Cycle {span:?}: waited {waited_usecs} μs, {fired} firings");
        CycleReport {
            span,
            waited_usecs,
            fired,
        }
    }

    /// Runs `cycles` cycles, handing each report to `observe`.
    pub fn run<F>(&mut self, cycles: usize, mut observe: F)
    where
        F: FnMut(&Scheduler, &CycleReport),
    {
        for _ in 0..cycles {
            let report = self.cycle();
            observe(self, &report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ClockConfig, ManualClock, SyncMode, TimeSource};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scheduler(strategy: WaitStrategy) -> (Scheduler, Arc<ManualClock>) {
        scheduler_with(ClockConfig::default(), strategy)
    }

    fn scheduler_with(config: ClockConfig, strategy: WaitStrategy) -> (Scheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let (_, synchronizer) = ClockContext::standalone(config, clock.clone()).unwrap();
        (Scheduler::new(synchronizer, strategy), clock)
    }

    fn counting(scheduler: &mut Scheduler, spec: PeriodicSpec) -> (TriggerHandle, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let handle = scheduler.subscribe(spec, move |_| {
            sink.fetch_add(1, Ordering::Relaxed);
        });
        (handle, count)
    }

    #[test]
    fn precise_loop_keeps_nominal_rate() {
        let (mut scheduler, clock) = scheduler(WaitStrategy::Precise);
        let mut waits = Vec::new();
        scheduler.run(100, |_, report| waits.push(report.waited_usecs));
        assert!(waits.iter().all(|wait| *wait == 10_000));
        assert_eq!(scheduler.current_tick(), 10_000);
        assert_eq!(clock.now_usecs(), 1_000_000);
        assert_eq!(scheduler.context().usecs_since_tick(5_000), 500_000);
    }

    #[test]
    fn fixed_rate_loop_waits_whole_steps() {
        let (mut scheduler, clock) = scheduler(WaitStrategy::FixedRate);
        scheduler.run(10, |_, report| assert_eq!(report.waited_usecs, 10_000));
        assert_eq!(clock.now_usecs(), 100_000);
    }

    #[test]
    fn triggers_fire_from_the_loop() {
        let (mut scheduler, _clock) = scheduler(WaitStrategy::Precise);
        let (handle, count) = counting(&mut scheduler, PeriodicSpec::new(0, 300).unwrap());
        // Boundaries 0, 300, ..., 3000
        scheduler.run(30, |_, _| {});
        assert_eq!(count.load(Ordering::Relaxed), 11);

        scheduler.change_period(&handle, 1_000).unwrap();
        // Next natural boundary 3300, then 4300, 5300
        scheduler.run(30, |_, _| {});
        assert_eq!(count.load(Ordering::Relaxed), 14);

        scheduler.unsubscribe(&handle);
        scheduler.run(30, |_, _| {});
        assert_eq!(count.load(Ordering::Relaxed), 14);
    }

    #[test]
    fn stalled_loop_catches_up() {
        let (mut scheduler, clock) = scheduler(WaitStrategy::Precise);
        scheduler.start();
        clock.advance(35_000);
        // Overdue: no waits until the schedule is reached again.
        let report = scheduler.cycle();
        assert_eq!(report.waited_usecs, 0);
        assert_eq!(scheduler.context().diagnostics().times_late, 1);
    }

    #[test]
    fn forward_tick_jump_does_not_burst_triggers() {
        let (mut scheduler, _clock) = scheduler(WaitStrategy::Precise);
        let (_handle, count) = counting(&mut scheduler, PeriodicSpec::new(0, 300).unwrap());
        // Boundaries 0 and 300
        scheduler.run(3, |_, _| {});
        assert_eq!(count.load(Ordering::Relaxed), 2);

        scheduler.set_tick(1_000_000);
        // Only 1_000_200 lies in the next three cycles.
        scheduler.run(3, |_, _| {});
        assert_eq!(count.load(Ordering::Relaxed), 3);
        assert_eq!(scheduler.current_tick(), 1_000_300);
    }

    #[test]
    fn backward_tick_jump_keeps_triggers_firing() {
        let (mut scheduler, _clock) = scheduler(WaitStrategy::Precise);
        let (_handle, count) = counting(&mut scheduler, PeriodicSpec::new(0, 300).unwrap());
        scheduler.run(30, |_, _| {});
        assert_eq!(count.load(Ordering::Relaxed), 11);

        scheduler.synchronizer_mut().set_tick(0);
        // Boundaries 0 and 300 again
        scheduler.run(3, |_, _| {});
        assert_eq!(count.load(Ordering::Relaxed), 13);
    }

    #[test]
    fn resync_rebases_triggers_onto_the_new_tick() {
        let config = ClockConfig {
            mode: SyncMode::FollowMaster,
            ..ClockConfig::default()
        };
        let (mut scheduler, _clock) = scheduler_with(config, WaitStrategy::Precise);
        scheduler.set_tick(10_000);
        let (_handle, count) = counting(&mut scheduler, PeriodicSpec::new(0, 100).unwrap());
        assert_eq!(scheduler.start(), 1);

        // The master reaches tick 10000 six steps after this node did.
        scheduler.context().sync_to_master(10_000, -60_000);
        let report = scheduler.cycle();
        assert_eq!(report.span, TimeSpec::new(9_500, 9_500));
        assert_eq!(report.fired, 1);

        let report = scheduler.cycle();
        assert_eq!(report.span, TimeSpec::new(9_500, 9_600));
        assert_eq!(report.fired, 1);
        assert_eq!(count.load(Ordering::Relaxed), 3);
        assert_eq!(scheduler.context().diagnostics().resyncs, 1);
    }
}
