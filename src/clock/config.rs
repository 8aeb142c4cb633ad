//! Clock configuration for the tick synchronizer.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Which correction branch the synchronizer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Timing master: pull the ideal schedule toward the free-running clock.
    FollowFixedClock,
    /// No wall-clock correction; ticks follow whenever the loop gets there.
    FollowLogicalTime,
    /// Slave: converge on the samples reported by a remote master.
    FollowMaster,
}

/// Process-wide timing parameters, set once at startup.
///
/// | Field                    | Unit        | Description                                     | Default   |
/// |--------------------------|-------------|-------------------------------------------------|-----------|
/// | usecs_per_tick           | μs          | Logical time represented by one tick            | 100       |
/// | base_increment           | ticks       | Ticks advanced per nominal step                 | 100       |
/// | step_usecs               | μs          | Real duration of one nominal step               | 10 000    |
/// | step_gain                | -           | Low-pass gain of the step duration estimate     | 0.002     |
/// | self_gain                | -           | Correction gain toward the local fixed clock    | 0.01      |
/// | master_gain_initial      | -           | Correction gain toward master, before sync      | 0.3       |
/// | master_gain_converged    | -           | Correction gain toward master, once synced      | 0.03      |
/// | master_filter_gain       | -           | Gain of the reported sync difference filter     | 0.01      |
/// | hold_back_synced         | calls       | Cooldown after 0/2 tick advice, once synced     | 20        |
/// | hold_back_unsynced       | calls       | Cooldown after 0/2 tick advice, before sync     | 4         |
/// | table_size               | steps       | Depth of the rotating tick-time table           | 64        |
/// | sample_queue_soft_limit  | samples     | Pending master samples before complaining       | 200       |
/// | max_consecutive_skips    | calls       | Cancelled waits before one wait is forced       | 10        |
/// | forced_wait_usecs        | μs          | Length of the forced anti-starvation wait       | 1 000     |
/// | convergence_samples      | samples     | In-range samples needed for the first sync      | 5         |
/// | resync_threshold_steps   | steps       | Master difference that force-sets the tick      | 5         |
/// | sync_report_interval_usecs | μs        | Minimum spacing of out-of-sync warnings         | 5 000 000 |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockConfig {
    #[serde(default = "ClockConfig::default_usecs_per_tick")]
    pub usecs_per_tick: u32,
    #[serde(default = "ClockConfig::default_base_increment")]
    pub base_increment: u32,
    #[serde(default = "ClockConfig::default_step_usecs")]
    pub step_usecs: u32,
    #[serde(default = "ClockConfig::default_mode")]
    pub mode: SyncMode,
    #[serde(default = "ClockConfig::default_step_gain")]
    pub step_gain: f64,
    #[serde(default = "ClockConfig::default_self_gain")]
    pub self_gain: f64,
    #[serde(default = "ClockConfig::default_master_gain_initial")]
    pub master_gain_initial: f64,
    #[serde(default = "ClockConfig::default_master_gain_converged")]
    pub master_gain_converged: f64,
    #[serde(default = "ClockConfig::default_master_filter_gain")]
    pub master_filter_gain: f64,
    #[serde(default = "ClockConfig::default_hold_back_synced")]
    pub hold_back_synced: u32,
    #[serde(default = "ClockConfig::default_hold_back_unsynced")]
    pub hold_back_unsynced: u32,
    #[serde(default = "ClockConfig::default_table_size")]
    pub table_size: usize,
    #[serde(default = "ClockConfig::default_sample_queue_soft_limit")]
    pub sample_queue_soft_limit: usize,
    #[serde(default = "ClockConfig::default_max_consecutive_skips")]
    pub max_consecutive_skips: u32,
    #[serde(default = "ClockConfig::default_forced_wait_usecs")]
    pub forced_wait_usecs: i64,
    #[serde(default = "ClockConfig::default_convergence_samples")]
    pub convergence_samples: u32,
    #[serde(default = "ClockConfig::default_resync_threshold_steps")]
    pub resync_threshold_steps: f64,
    #[serde(default = "ClockConfig::default_sync_report_interval_usecs")]
    pub sync_report_interval_usecs: i64,
}

impl ClockConfig {
    /// Load clock config from the file path in `CONFIG_FILE` env var.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("CONFIG_FILE")
            .map_err(|_| ConfigError::Message("CONFIG_FILE environment variable not set".into()))?;
        Self::from_file(&path)
    }

    /// Load clock config from a file. Supports:
    /// - Files with a `[clock]` section (e.g. node configs)
    /// - Flat files with the clock fields at root
    ///
    /// Environment variables prefixed `TICK_SYNC_CLOCK_` (e.g.
    /// `TICK_SYNC_CLOCK_STEP_USECS`) override file values.
    pub fn from_file(config_file: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(config_file))
            .add_source(Environment::with_prefix("TICK_SYNC_CLOCK").try_parsing(true))
            .build()?;
        let clock: Self = config.get("clock").or_else(|_| config.try_deserialize())?;
        clock.validate()?;
        Ok(clock)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.usecs_per_tick == 0 || self.base_increment == 0 || self.step_usecs == 0 {
            return Err(ConfigError::Message(
                "usecs_per_tick, base_increment and step_usecs must be > 0".into(),
            ));
        }
        if self.table_size < 2 {
            return Err(ConfigError::Message("table_size must be >= 2".into()));
        }
        let gains = [
            ("step_gain", self.step_gain),
            ("self_gain", self.self_gain),
            ("master_gain_initial", self.master_gain_initial),
            ("master_gain_converged", self.master_gain_converged),
            ("master_filter_gain", self.master_filter_gain),
        ];
        for (name, gain) in gains {
            if !(gain > 0.0 && gain <= 1.0) {
                return Err(ConfigError::Message(format!(
                    "{name} must be in (0, 1], got {gain}"
                )));
            }
        }
        if !(self.resync_threshold_steps >= 2.0) {
            return Err(ConfigError::Message(format!(
                "resync_threshold_steps must be >= 2, got {}",
                self.resync_threshold_steps
            )));
        }
        if self.forced_wait_usecs < 0 || self.sync_report_interval_usecs < 0 {
            return Err(ConfigError::Message(
                "forced_wait_usecs and sync_report_interval_usecs must be >= 0".into(),
            ));
        }
        Ok(())
    }

    /// Nominal step duration in μs.
    pub fn step(&self) -> f64 {
        self.step_usecs as f64
    }

    /// Real time per single tick, which differs from `usecs_per_tick` when
    /// running slower or faster than real time.
    pub fn real_usecs_per_tick(&self) -> f64 {
        self.step_usecs as f64 / self.base_increment as f64
    }

    /// Real-time scaling factor; 1.0 means logical time runs at wall speed.
    pub fn time_scale(&self) -> f64 {
        (self.usecs_per_tick as f64 * self.base_increment as f64) / self.step_usecs as f64
    }

    fn default_usecs_per_tick() -> u32 {
        100
    }
    fn default_base_increment() -> u32 {
        100
    }
    fn default_step_usecs() -> u32 {
        10_000 // 100 Hz
    }
    fn default_mode() -> SyncMode {
        SyncMode::FollowFixedClock
    }
    fn default_step_gain() -> f64 {
        0.002
    }
    fn default_self_gain() -> f64 {
        0.01
    }
    fn default_master_gain_initial() -> f64 {
        0.3
    }
    fn default_master_gain_converged() -> f64 {
        0.03
    }
    fn default_master_filter_gain() -> f64 {
        0.01
    }
    fn default_hold_back_synced() -> u32 {
        20
    }
    fn default_hold_back_unsynced() -> u32 {
        4
    }
    fn default_table_size() -> usize {
        64
    }
    fn default_sample_queue_soft_limit() -> usize {
        200
    }
    fn default_max_consecutive_skips() -> u32 {
        10
    }
    fn default_forced_wait_usecs() -> i64 {
        1_000
    }
    fn default_convergence_samples() -> u32 {
        5
    }
    fn default_resync_threshold_steps() -> f64 {
        5.0
    }
    fn default_sync_report_interval_usecs() -> i64 {
        5_000_000
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            usecs_per_tick: Self::default_usecs_per_tick(),
            base_increment: Self::default_base_increment(),
            step_usecs: Self::default_step_usecs(),
            mode: Self::default_mode(),
            step_gain: Self::default_step_gain(),
            self_gain: Self::default_self_gain(),
            master_gain_initial: Self::default_master_gain_initial(),
            master_gain_converged: Self::default_master_gain_converged(),
            master_filter_gain: Self::default_master_filter_gain(),
            hold_back_synced: Self::default_hold_back_synced(),
            hold_back_unsynced: Self::default_hold_back_unsynced(),
            table_size: Self::default_table_size(),
            sample_queue_soft_limit: Self::default_sample_queue_soft_limit(),
            max_consecutive_skips: Self::default_max_consecutive_skips(),
            forced_wait_usecs: Self::default_forced_wait_usecs(),
            convergence_samples: Self::default_convergence_samples(),
            resync_threshold_steps: Self::default_resync_threshold_steps(),
            sync_report_interval_usecs: Self::default_sync_report_interval_usecs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ClockConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.step(), 10_000.0);
        assert_eq!(config.real_usecs_per_tick(), 100.0);
        assert_eq!(config.time_scale(), 1.0);
    }

    #[test]
    fn rejects_zero_step() {
        let config = ClockConfig {
            step_usecs: 0,
            ..ClockConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_gain_out_of_range() {
        let config = ClockConfig {
            master_gain_initial: 1.5,
            ..ClockConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_resync_inside_the_sync_range() {
        let config = ClockConfig {
            resync_threshold_steps: 1.5,
            ..ClockConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn half_speed_scaling() {
        let config = ClockConfig {
            step_usecs: 20_000,
            ..ClockConfig::default()
        };
        assert_eq!(config.real_usecs_per_tick(), 200.0);
        assert_eq!(config.time_scale(), 0.5);
    }
}
