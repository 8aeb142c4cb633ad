//! Shared per-node clock state.
//!
//! [`ClockContext`] is the read side handed to every thread: current tick,
//! time since a tick, sync status, and the entry point for master samples.
//! The write side, [`Synchronizer`], exists exactly once per context and is
//! owned by the scheduling loop.

use super::config::ClockConfig;
use super::source::TimeSource;
use super::sync::Synchronizer;
use super::table::{LookupError, TickTimeTable};
use crate::queue::HandoffQueue;
use crate::tick::{Tick, TickCounter};
use config::ConfigError;
use log::*;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

static INSTALLED: OnceLock<Arc<ClockContext>> = OnceLock::new();

const NEVER: i64 = i64::MIN;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("a clock context is already installed in this process")]
    AlreadyInstalled,
    #[error("invalid clock configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

/// One measured offset between this node and the master, in μs. Positive
/// means this node reached `tick` before the master did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSample {
    pub tick: Tick,
    pub raw_difference: i64,
    /// Tick alignment the sample was measured against; samples from before a
    /// resync are discarded.
    pub alignment: u32,
}

/// Snapshot of the diagnostic counters. Monitoring only; nothing in the
/// control path reads these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncDiagnostics {
    pub times_late: u64,
    pub times_early: u64,
    pub waits_cancelled: u64,
    pub double_waits: u64,
    pub samples_processed: u64,
    pub samples_dropped: u64,
    pub resyncs: u64,
}

#[derive(Debug, Default)]
pub(crate) struct DiagnosticCounters {
    pub times_late: AtomicU64,
    pub times_early: AtomicU64,
    pub waits_cancelled: AtomicU64,
    pub double_waits: AtomicU64,
    pub samples_processed: AtomicU64,
    pub samples_dropped: AtomicU64,
    pub resyncs: AtomicU64,
}

impl DiagnosticCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SyncDiagnostics {
        SyncDiagnostics {
            times_late: self.times_late.load(Ordering::Relaxed),
            times_early: self.times_early.load(Ordering::Relaxed),
            waits_cancelled: self.waits_cancelled.load(Ordering::Relaxed),
            double_waits: self.double_waits.load(Ordering::Relaxed),
            samples_processed: self.samples_processed.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
        }
    }
}

/// Producer side of master synchronization, written from network threads.
struct MasterLink {
    samples: HandoffQueue<SyncSample>,
    /// f64 bits of the filtered difference
    filtered_difference: AtomicU64,
    last_raw_difference: AtomicI64,
    in_sync: AtomicBool,
    ever_synced: AtomicBool,
    in_range_streak: AtomicU32,
    /// Bumped whenever the tick is force-set
    alignment: AtomicU32,
    out_of_sync_since: AtomicI64,
    last_report: AtomicI64,
}

impl MasterLink {
    fn new(soft_limit: usize) -> Self {
        Self {
            samples: HandoffQueue::new("master sync samples", soft_limit),
            filtered_difference: AtomicU64::new(0f64.to_bits()),
            last_raw_difference: AtomicI64::new(0),
            in_sync: AtomicBool::new(false),
            ever_synced: AtomicBool::new(false),
            in_range_streak: AtomicU32::new(0),
            alignment: AtomicU32::new(0),
            out_of_sync_since: AtomicI64::new(NEVER),
            last_report: AtomicI64::new(NEVER),
        }
    }

    fn filter_difference(&self, raw: i64, gain: f64) -> f64 {
        let update = |bits: u64| {
            let filtered = f64::from_bits(bits);
            Some((filtered + gain * (raw as f64 - filtered)).to_bits())
        };
        let previous = self
            .filtered_difference
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, update)
            .unwrap_or_else(|bits| bits);
        let previous = f64::from_bits(previous);
        previous + gain * (raw as f64 - previous)
    }
}

pub struct ClockContext {
    config: ClockConfig,
    source: Arc<dyn TimeSource>,
    ticks: TickCounter,
    table: TickTimeTable,
    master: MasterLink,
    counters: DiagnosticCounters,
}

impl ClockContext {
    /// Creates this process's clock context. Fails if one is already
    /// installed; use [`ClockContext::installed`] to share it instead.
    pub fn install(
        config: ClockConfig,
        source: Arc<dyn TimeSource>,
    ) -> Result<(Arc<Self>, Synchronizer), ContextError> {
        config.validate()?;
        if INSTALLED.get().is_some() {
            return Err(ContextError::AlreadyInstalled);
        }
        let (context, synchronizer) = Self::build(config, source);
        INSTALLED
            .set(Arc::clone(&context))
            .map_err(|_| ContextError::AlreadyInstalled)?;
        info!(
            "Clock context installed: step {} μs, {} ticks per step, mode {:?}",
            context.config.step_usecs, context.config.base_increment, context.config.mode
        );
        Ok((context, synchronizer))
    }

    /// The context registered by [`ClockContext::install`], if any.
    pub fn installed() -> Option<Arc<Self>> {
        INSTALLED.get().cloned()
    }

    /// Builds a context that is not registered process-wide, for hosting
    /// several simulated nodes in one process.
    pub fn standalone(
        config: ClockConfig,
        source: Arc<dyn TimeSource>,
    ) -> Result<(Arc<Self>, Synchronizer), ContextError> {
        config.validate()?;
        Ok(Self::build(config, source))
    }

    fn build(config: ClockConfig, source: Arc<dyn TimeSource>) -> (Arc<Self>, Synchronizer) {
        let table = TickTimeTable::new(
            config.table_size,
            config.base_increment,
            config.real_usecs_per_tick(),
        );
        let context = Arc::new(Self {
            master: MasterLink::new(config.sample_queue_soft_limit),
            ticks: TickCounter::default(),
            counters: DiagnosticCounters::default(),
            table,
            source,
            config,
        });
        let synchronizer = Synchronizer::new(Arc::clone(&context));
        (context, synchronizer)
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<dyn TimeSource> {
        &self.source
    }

    pub fn current_tick(&self) -> Tick {
        self.ticks.current()
    }

    /// Microseconds elapsed since `tick` occurred, negative for a future tick.
    pub fn try_usecs_since_tick(&self, tick: Tick) -> Result<i64, LookupError> {
        let tick_time = self.table.lookup(tick)?;
        Ok(self.source.now_usecs() - tick_time)
    }

    /// Best-effort form of [`try_usecs_since_tick`](Self::try_usecs_since_tick):
    /// ticks that fell out of the table are extrapolated from the newest
    /// entry at the nominal rate. Returns 0 before the first tick.
    pub fn usecs_since_tick(&self, tick: Tick) -> i64 {
        self.estimate_usecs_since_tick(tick).unwrap_or(0)
    }

    fn estimate_usecs_since_tick(&self, tick: Tick) -> Option<i64> {
        match self.try_usecs_since_tick(tick) {
            Ok(usecs) => Some(usecs),
            Err(LookupError::Empty) => None,
            Err(e) => {
                let (newest, time) = self.table.newest()?;
                debug!("usecs_since_tick({tick}): {e}, extrapolating from {newest}");
                Some(self.source.now_usecs() - (time + self.table.span_usecs(newest, tick)))
            }
        }
    }

    /// Feeds one master report: at the master, `master_offset` μs had passed
    /// since `master_tick`. Never blocks. Returns whether this node is in sync.
    ///
    /// A `master_tick` outside the tick-time table is measured by
    /// extrapolation; the sample is dropped only when this node has no tick
    /// history at all.
    pub fn sync_to_master(&self, master_tick: Tick, master_offset: i64) -> bool {
        let link = &self.master;
        // Read before the lookup: a resync bumps it after rebuilding the table.
        let alignment = link.alignment.load(Ordering::Acquire);
        let Some(since) = self.estimate_usecs_since_tick(master_tick) else {
            debug!("Dropping master sample for tick {master_tick}: no local tick history");
            DiagnosticCounters::bump(&self.counters.samples_dropped);
            return self.in_sync();
        };
        let raw = since - master_offset;
        link.samples.push(SyncSample {
            tick: master_tick,
            raw_difference: raw,
            alignment,
        });
        link.last_raw_difference.store(raw, Ordering::Relaxed);
        let filtered = link.filter_difference(raw, self.config.master_filter_gain);

        let step = self.config.step();
        if filtered.abs() < step && (raw.abs() as f64) < 2.0 * step {
            self.mark_in_range()
        } else {
            self.mark_out_of_range(filtered);
            false
        }
    }

    fn mark_in_range(&self) -> bool {
        let link = &self.master;
        link.out_of_sync_since.store(NEVER, Ordering::Relaxed);
        if !link.ever_synced.load(Ordering::Acquire) {
            let streak = link.in_range_streak.fetch_add(1, Ordering::AcqRel) + 1;
            if streak < self.config.convergence_samples {
                return false;
            }
            if !link.ever_synced.swap(true, Ordering::AcqRel) {
                info!(
                    "In sync with master at tick {} after {streak} in-range samples",
                    self.current_tick()
                );
            }
        }
        link.in_sync.store(true, Ordering::Release);
        true
    }

    fn mark_out_of_range(&self, filtered: f64) {
        let link = &self.master;
        link.in_range_streak.store(0, Ordering::Relaxed);
        if link.in_sync.swap(false, Ordering::AcqRel) {
            info!(
                "Lost sync with master at tick {}, difference {:.0} μs",
                self.current_tick(),
                filtered
            );
        }

        let now = self.source.now_usecs();
        let since = match link.out_of_sync_since.compare_exchange(
            NEVER,
            now,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => now,
            Err(start) => start,
        };
        let interval = self.config.sync_report_interval_usecs;
        let last = link.last_report.load(Ordering::Acquire);
        if now.saturating_sub(since) >= interval
            && now.saturating_sub(last) >= interval
            && link
                .last_report
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            warn!(
                "Out of sync with master for {} ms, difference {:.0} μs (step {} μs)",
                now.saturating_sub(since) / 1000,
                filtered,
                self.config.step_usecs
            );
        }
    }

    /// Filtered master difference in μs, for status reporting.
    pub fn current_sync_difference(&self) -> i64 {
        f64::from_bits(self.master.filtered_difference.load(Ordering::Acquire)).round() as i64
    }

    pub fn last_raw_difference(&self) -> i64 {
        self.master.last_raw_difference.load(Ordering::Relaxed)
    }

    pub fn in_sync(&self) -> bool {
        self.master.in_sync.load(Ordering::Acquire)
    }

    pub fn ever_synced(&self) -> bool {
        self.master.ever_synced.load(Ordering::Acquire)
    }

    pub fn pending_samples(&self) -> usize {
        self.master.samples.len()
    }

    pub fn diagnostics(&self) -> SyncDiagnostics {
        self.counters.snapshot()
    }

    pub(crate) fn ticks(&self) -> &TickCounter {
        &self.ticks
    }

    pub(crate) fn table(&self) -> &TickTimeTable {
        &self.table
    }

    pub(crate) fn samples(&self) -> &HandoffQueue<SyncSample> {
        &self.master.samples
    }

    pub(crate) fn counters(&self) -> &DiagnosticCounters {
        &self.counters
    }

    pub(crate) fn alignment(&self) -> u32 {
        self.master.alignment.load(Ordering::Acquire)
    }

    /// Marks samples measured so far as stale and restarts the difference
    /// filter. Called by the synchronizer after the table was rebuilt for a
    /// force-set tick.
    pub(crate) fn realign(&self) {
        let link = &self.master;
        link.filtered_difference.store(0f64.to_bits(), Ordering::Release);
        link.in_range_streak.store(0, Ordering::Relaxed);
        link.alignment.fetch_add(1, Ordering::AcqRel);
    }
}
