//! Clock synchronization: time sources, configuration, the shared clock
//! context and the scheduler-owned synchronizer.

pub mod config;
pub mod context;
pub mod simulator;
pub mod source;
pub mod sync;
pub mod table;

pub use config::{ClockConfig, SyncMode};
pub use context::{ClockContext, ContextError, SyncDiagnostics, SyncSample};
pub use simulator::SimulatedClock;
pub use source::{ManualClock, MonotonicClock, TimeSource};
pub use sync::Synchronizer;
pub use table::{LookupError, TickTimeTable};
