//! Scheduler-side clock synchronization.
//!
//! Once per tick the scheduling loop reports the tick it just reached
//! ([`Synchronizer::sync_to_tick`]); in between it asks how long to wait
//! ([`Synchronizer::usecs_to_next_tick`] or [`Synchronizer::ticks_to_wait`]).
//! All outputs are advisory: nothing here blocks or fails.

use super::config::SyncMode;
use super::context::{ClockContext, DiagnosticCounters};
use crate::tick::{tick_delta, Tick, TimeSpec};
use log::*;
use std::sync::Arc;

enum MasterCorrection {
    /// μs added to the next tick time
    Slew(f64),
    /// Ticks this node is ahead of the master, rounded to whole steps
    Resync(i64),
}

/// The single writer of a [`ClockContext`]: owns the tick, the step estimate
/// and the ideal schedule. Not `Clone`; one per context.
pub struct Synchronizer {
    context: Arc<ClockContext>,
    mode: SyncMode,
    /// Filtered estimate of the real duration of one step, μs
    measured_step: f64,
    /// Ideal time of the last tick, μs
    last_tick_time: f64,
    /// Ideal time of the next tick, μs
    ideal_time: f64,
    /// Tick and observed time of the last `sync_to_tick`
    previous: Option<(Tick, i64)>,
    /// Last entry written to the tick-time table
    last_recorded: Option<(Tick, i64)>,
    /// Correction derived from this node's own wake time on the last tick;
    /// excluded from the next step observation
    local_correction: f64,
    master_gain: f64,
    reanchor: bool,
    hold_back: u32,
    consecutive_skips: u32,
}

impl Synchronizer {
    pub(crate) fn new(context: Arc<ClockContext>) -> Self {
        let config = context.config();
        Self {
            mode: config.mode,
            measured_step: config.step(),
            last_tick_time: 0.0,
            ideal_time: 0.0,
            previous: None,
            last_recorded: None,
            local_correction: 0.0,
            master_gain: config.master_gain_initial,
            reanchor: false,
            hold_back: 0,
            consecutive_skips: 0,
            context,
        }
    }

    pub fn context(&self) -> &Arc<ClockContext> {
        &self.context
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Switches the correction branch. Filter history is kept; leaving
    /// `FollowLogicalTime` re-anchors the schedule on the next tick because
    /// logical time carries no wall-clock anchor.
    pub fn set_mode(&mut self, mode: SyncMode) {
        if mode == self.mode {
            return;
        }
        info!("Synchronization mode {:?} -> {:?}", self.mode, mode);
        if self.mode == SyncMode::FollowLogicalTime {
            self.reanchor = true;
        }
        self.mode = mode;
    }

    pub fn measured_step(&self) -> f64 {
        self.measured_step
    }

    /// Target time of the next tick boundary, μs on the context's time source.
    pub fn ideal_time(&self) -> f64 {
        self.ideal_time
    }

    pub fn current_tick(&self) -> Tick {
        self.context.current_tick()
    }

    /// Advances the tick counter and returns the span just covered.
    pub fn advance_tick(&mut self, increment: u32) -> TimeSpec {
        let ticks = self.context.ticks();
        let start = ticks.current();
        let end = ticks.advance(increment);
        TimeSpec::new(start, end)
    }

    /// Force-sets the tick, at startup or when resynchronizing with a master.
    /// Tick-time history and pending master samples are discarded and the
    /// next tick re-anchors.
    pub fn set_tick(&mut self, tick: Tick) {
        self.context.ticks().set(tick);
        self.context.table().reset();
        self.context.realign();
        self.previous = None;
        self.last_recorded = None;
        self.local_correction = 0.0;
    }

    /// Records that `tick` was reached now and updates the schedule.
    ///
    /// With `running_realtime == false` the schedule is re-anchored on the
    /// observed time and neither the step estimate nor the corrections move.
    ///
    /// In `FollowMaster` mode a master difference of `resync_threshold_steps`
    /// or more is not slewed away: the tick is force-set onto the master's
    /// step grid instead, so [`current_tick`](Self::current_tick) may differ
    /// from `tick` afterwards.
    pub fn sync_to_tick(&mut self, tick: Tick, running_realtime: bool) {
        let context = Arc::clone(&self.context);
        let config = context.config();
        let now = context.source().now_usecs();
        let previous = self.previous.replace((tick, now));

        let steps = previous
            .map(|(prev_tick, _)| tick_delta(prev_tick, tick) as f64 / config.base_increment as f64)
            .unwrap_or(0.0);

        let tick_time = match previous {
            Some((_, prev_time)) if running_realtime && !self.reanchor && steps > 0.0 => {
                let expected = self.last_tick_time + steps * self.measured_step;
                let observed_step = ((now - prev_time) as f64 - self.local_correction) / steps;
                self.measured_step += config.step_gain * (observed_step - self.measured_step);

                let miss = now as f64 - expected;
                self.count_miss(tick, miss);

                let correction = match self.mode {
                    SyncMode::FollowFixedClock => miss * config.self_gain,
                    SyncMode::FollowLogicalTime => miss,
                    SyncMode::FollowMaster => match self.process_master_syncs() {
                        MasterCorrection::Slew(delta) => delta,
                        MasterCorrection::Resync(ticks_ahead) => {
                            self.resync(tick, ticks_ahead, now);
                            return;
                        }
                    },
                };
                self.local_correction = match self.mode {
                    SyncMode::FollowMaster => 0.0,
                    _ => correction,
                };
                expected + correction
            }
            _ => {
                self.reanchor = false;
                self.local_correction = 0.0;
                now as f64
            }
        };
        self.publish(tick, tick_time);
    }

    /// Records `tick_time` for `tick` and schedules the next tick from it.
    fn publish(&mut self, tick: Tick, tick_time: f64) {
        let recorded = tick_time.round() as i64;
        self.context.table().record(self.last_recorded, tick, recorded);
        self.last_recorded = Some((tick, recorded));
        self.last_tick_time = tick_time;
        self.ideal_time = tick_time + self.measured_step;
    }

    /// Moves the tick `ticks_ahead` back (forward when negative) and
    /// restarts the schedule at `now`. The step estimate is kept.
    fn resync(&mut self, reached: Tick, ticks_ahead: i64, now: i64) {
        let tick = reached.wrapping_sub(ticks_ahead as u32);
        warn!(
            "{} ticks off the master at tick {reached}, resynchronizing to tick {tick}",
            ticks_ahead
        );
        self.set_tick(tick);
        self.previous = Some((tick, now));
        self.publish(tick, now as f64);
        DiagnosticCounters::bump(&self.context.counters().resyncs);
    }

    fn count_miss(&self, tick: Tick, miss: f64) {
        let half_step = self.context.config().step() / 2.0;
        let counters = self.context.counters();
        if miss > half_step {
            DiagnosticCounters::bump(&counters.times_late);
            debug!("Tick {tick} late by {miss:.0} μs");
        } else if miss < -half_step {
            DiagnosticCounters::bump(&counters.times_early);
            debug!("Tick {tick} early by {:.0} μs", -miss);
        }
    }

    /// Drains pending master samples in arrival order and derives the
    /// correction from the newest one. Samples measured before the last
    /// resync are discarded.
    fn process_master_syncs(&mut self) -> MasterCorrection {
        let config = self.context.config();
        let gain = if self.context.ever_synced() {
            config.master_gain_converged
        } else {
            config.master_gain_initial
        };
        if gain != self.master_gain {
            info!("Master correction gain {} -> {}", self.master_gain, gain);
            self.master_gain = gain;
        }

        let counters = self.context.counters();
        let alignment = self.context.alignment();
        let mut newest = None;
        for sample in self.context.samples().drain() {
            if sample.alignment != alignment {
                DiagnosticCounters::bump(&counters.samples_dropped);
                continue;
            }
            DiagnosticCounters::bump(&counters.samples_processed);
            trace!(
                "Master sample tick {} difference {} μs",
                sample.tick,
                sample.raw_difference
            );
            newest = Some(sample.raw_difference);
        }

        let Some(raw) = newest else {
            return MasterCorrection::Slew(0.0);
        };
        let step = config.step();
        if raw.abs() as f64 >= config.resync_threshold_steps * step {
            let steps = (raw as f64 / step).round() as i64;
            return MasterCorrection::Resync(steps * config.base_increment as i64);
        }
        MasterCorrection::Slew(gain * raw as f64)
    }

    /// Microseconds the scheduling loop should sleep before the next tick.
    ///
    /// Returns 0 when the next tick is already due, except that every
    /// `max_consecutive_skips`-th consecutive skip is turned into a short
    /// forced wait. Never advises more than two steps.
    pub fn usecs_to_next_tick(&mut self, granularity_correction: i64) -> i64 {
        let config = self.context.config();
        let now = self.context.source().now_usecs();
        let wait = (self.ideal_time - now as f64).round() as i64 + granularity_correction;
        let counters = self.context.counters();

        if wait <= 0 {
            self.consecutive_skips += 1;
            if self.consecutive_skips >= config.max_consecutive_skips {
                self.consecutive_skips = 0;
                debug!("Forcing a {} μs wait after repeated skips", config.forced_wait_usecs);
                return config.forced_wait_usecs;
            }
            DiagnosticCounters::bump(&counters.waits_cancelled);
            return 0;
        }
        self.consecutive_skips = 0;

        let limit = 2 * config.step_usecs as i64;
        if wait > limit {
            DiagnosticCounters::bump(&counters.double_waits);
            return limit;
        }
        wait
    }

    /// Whole number of timer periods (0, 1 or 2) to wait before the next tick,
    /// for loops driven by a fixed-rate timer.
    ///
    /// After advising 0 or 2, the advice is held at 1 for the next
    /// `hold_back_synced` (or, before first sync, `hold_back_unsynced`) calls.
    pub fn ticks_to_wait(&mut self) -> u32 {
        let config = self.context.config();
        let now = self.context.source().now_usecs();
        let lead = (self.ideal_time - now as f64) / config.step();
        let advice = if lead < 0.5 {
            0
        } else if lead > 1.5 {
            2
        } else {
            1
        };

        if self.hold_back > 0 {
            self.hold_back -= 1;
            return 1;
        }
        if advice != 1 {
            self.hold_back = if self.context.ever_synced() {
                config.hold_back_synced
            } else {
                config.hold_back_unsynced
            };
            let counters = self.context.counters();
            if advice == 0 {
                DiagnosticCounters::bump(&counters.waits_cancelled);
            } else {
                DiagnosticCounters::bump(&counters.double_waits);
            }
        }
        advice
    }
}
