use std::{fs::File, io::Write};

use chrono::Utc;
use csv::Writer;
use serde::Serialize;
use tick_sync::clock::{ClockContext, SyncDiagnostics};
use tick_sync::scheduler::CycleReport;
use tick_sync::Tick;

use crate::configs::NodeConfig;

/// Wall-clock milliseconds since the Unix epoch.
type Timestamp = i64;

#[derive(Debug, Serialize, Clone, Copy)]
struct CycleData {
    time: Timestamp,
    tick: Tick,
    waited_usecs: i64,
    fired: usize,
    sync_difference: i64,
    raw_difference: i64,
    in_sync: bool,
}

#[derive(Debug, Serialize)]
struct Summary<'a> {
    config: &'a NodeConfig,
    diagnostics: SyncDiagnostics,
    cycles: usize,
    in_sync_cycles: usize,
    final_tick: Option<Tick>,
}

pub struct NodeData {
    cycle_data: Vec<CycleData>,
}

impl NodeData {
    pub fn new() -> Self {
        NodeData {
            cycle_data: Vec::new(),
        }
    }

    pub fn new_cycle(&mut self, context: &ClockContext, report: &CycleReport) {
        let data = CycleData {
            time: Utc::now().timestamp_millis(),
            tick: report.span.end,
            waited_usecs: report.waited_usecs,
            fired: report.fired,
            sync_difference: context.current_sync_difference(),
            raw_difference: context.last_raw_difference(),
            in_sync: context.in_sync(),
        };
        self.cycle_data.push(data);
    }

    pub fn cycle_count(&self) -> usize {
        self.cycle_data.len()
    }

    pub fn in_sync_count(&self) -> usize {
        self.cycle_data.iter().filter(|data| data.in_sync).count()
    }

    pub fn save_summary(
        &self,
        config: &NodeConfig,
        diagnostics: SyncDiagnostics,
    ) -> Result<(), std::io::Error> {
        let summary = Summary {
            config,
            diagnostics,
            cycles: self.cycle_count(),
            in_sync_cycles: self.in_sync_count(),
            final_tick: self.cycle_data.last().map(|data| data.tick),
        };
        let summary_json = serde_json::to_string_pretty(&summary)?;
        let mut summary_file = File::create(&config.node.summary_filepath)?;
        summary_file.write_all(summary_json.as_bytes())?;
        summary_file.flush()?;
        Ok(())
    }

    pub fn to_csv(&self, file_path: &str) -> Result<(), std::io::Error> {
        let file = File::create(file_path)?;
        let mut writer = Writer::from_writer(file);
        for data in &self.cycle_data {
            writer.serialize(data)?;
        }
        writer.flush()?;
        Ok(())
    }
}
