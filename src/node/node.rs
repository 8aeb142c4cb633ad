use crate::{configs::NodeConfig, data_collection::NodeData};
use log::*;
use std::sync::Arc;
use std::time::Duration;
use tick_sync::clock::{
    ClockConfig, ClockContext, ContextError, MonotonicClock, SimulatedClock, SyncMode, TimeSource,
};
use tick_sync::{PeriodicSpec, Scheduler, Tick, TimeSpec};
use tokio::task::JoinHandle;
use tokio::time::interval;

pub struct Node {
    config: NodeConfig,
    context: Arc<ClockContext>,
    scheduler: Scheduler,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Self, ContextError> {
        let source: Arc<dyn TimeSource> = Arc::new(MonotonicClock::new());
        let (context, synchronizer) = ClockContext::install(config.clock.clone(), source)?;
        let scheduler = Scheduler::new(synchronizer, config.node.wait_strategy)
            .with_granularity_correction(config.node.granularity_correction_usecs);
        Ok(Node {
            config,
            context,
            scheduler,
        })
    }

    pub async fn run(mut self) {
        let id = self.config.node.id.clone();
        let master_feed = match self.config.clock.mode {
            SyncMode::FollowMaster => Some(self.start_master_feed()),
            _ => None,
        };
        self.subscribe_status();

        info!("{id}: Running {} cycles", self.config.node.cycles);
        let cycles = self.config.node.cycles;
        let mut scheduler = self.scheduler;
        let scheduling_loop = tokio::task::spawn_blocking(move || {
            let mut data = NodeData::new();
            scheduler.run(cycles, |scheduler, report| {
                data.new_cycle(scheduler.context(), report)
            });
            data
        });
        let data = scheduling_loop.await.expect("Scheduling loop panicked");
        if let Some(feed) = master_feed {
            feed.abort();
        }

        let diagnostics = self.context.diagnostics();
        info!(
            "{id}: Node finished at tick {}: {} of {} cycles in sync, {diagnostics:?}",
            self.context.current_tick(),
            data.in_sync_count(),
            data.cycle_count(),
        );
        if let Err(e) = data.save_summary(&self.config, diagnostics) {
            error!("{id}: Failed to save summary: {e}");
        }
        if let Err(e) = data.to_csv(&self.config.node.output_filepath) {
            error!("{id}: Failed to save cycle data: {e}");
        }
    }

    fn subscribe_status(&mut self) {
        let spec = match PeriodicSpec::new(0, self.config.node.status_period_ticks) {
            Ok(spec) => spec,
            Err(e) => {
                warn!("Status reports disabled: {e}");
                return;
            }
        };
        let context = Arc::clone(&self.context);
        let id = self.config.node.id.clone();
        self.scheduler.subscribe(spec, move |span: TimeSpec| {
            info!(
                "{id}: tick {} sync difference {} μs (last {} μs), in sync: {}",
                span.start,
                context.current_sync_difference(),
                context.last_raw_difference(),
                context.in_sync(),
            );
        });
    }

    /// Emulates the remote master: a drifting clock over the local one,
    /// reporting its tick every `sample_interval_ms`. The local tick starts
    /// from the master's.
    fn start_master_feed(&mut self) -> JoinHandle<()> {
        let node = &self.config.node;
        let master = SimulatedClock::new(
            Arc::clone(self.context.source()),
            node.master_offset_usecs,
            node.master_drift,
            node.master_uncertainty_usecs,
        );
        let (start_tick, _) = master_report(&master, &self.config.clock);
        self.scheduler.set_tick(start_tick);
        info!("{}: Following master from tick {start_tick}", node.id);

        let context = Arc::clone(&self.context);
        let clock = self.config.clock.clone();
        let mut sample_interval = interval(Duration::from_millis(node.sample_interval_ms));
        tokio::spawn(async move {
            loop {
                sample_interval.tick().await;
                let (tick, offset) = master_report(&master, &clock);
                context.sync_to_master(tick, offset);
            }
        })
    }
}

/// The master's last tick boundary and the μs elapsed since it, read from
/// the master clock.
fn master_report(master: &SimulatedClock, clock: &ClockConfig) -> (Tick, i64) {
    let now = master.now_usecs();
    let step = clock.step_usecs as i64;
    let steps = now.div_euclid(step);
    let tick = steps.wrapping_mul(clock.base_increment as i64) as Tick;
    (tick, now - steps * step)
}
