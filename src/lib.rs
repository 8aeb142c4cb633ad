//! Timing backbone for distributed real-time simulation nodes.
//!
//! A node owns one [`ClockContext`] (shared tick counter, tick-time table and
//! master link) and one [`Synchronizer`] driven by its scheduling loop. The
//! loop asks the synchronizer how long to wait, advances the tick, and lets the
//! registered [`PeriodicTrigger`]s fire their dependents.

pub mod clock;
pub mod queue;
pub mod scheduler;
pub mod tick;
pub mod trigger;

pub use clock::{
    ClockConfig, ClockContext, ContextError, LookupError, ManualClock, MonotonicClock,
    SimulatedClock, SyncDiagnostics, SyncMode, Synchronizer, TimeSource,
};
pub use queue::HandoffQueue;
pub use scheduler::{CycleReport, Scheduler, WaitStrategy};
pub use tick::{Tick, TickCounter, TimeSpec};
pub use trigger::{PeriodicSpec, PeriodicTrigger, TriggerError, TriggerHandle, TriggerSet};
