use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tick_sync::clock::ClockConfig;
use tick_sync::WaitStrategy;

/// Settings of the demo node itself. Timing parameters live in the
/// `[clock]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    #[serde(default = "NodeSettings::default_id")]
    pub id: String,
    /// Scheduler cycles to run before exiting
    #[serde(default = "NodeSettings::default_cycles")]
    pub cycles: usize,
    #[serde(default)]
    pub wait_strategy: WaitStrategy,
    #[serde(default)]
    pub granularity_correction_usecs: i64,
    #[serde(default = "NodeSettings::default_status_period_ticks")]
    pub status_period_ticks: u32,
    /// How often the emulated master reports its tick
    #[serde(default = "NodeSettings::default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default)]
    pub master_offset_usecs: i64,
    /// μs per second
    #[serde(default)]
    pub master_drift: f64,
    #[serde(default)]
    pub master_uncertainty_usecs: f64,
    pub output_filepath: String,
    pub summary_filepath: String,
}

impl NodeSettings {
    fn default_id() -> String {
        "node".to_string()
    }
    fn default_cycles() -> usize {
        1_000
    }
    fn default_status_period_ticks() -> u32 {
        10_000
    }
    fn default_sample_interval_ms() -> u64 {
        10
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSettings,
    #[serde(default)]
    pub clock: ClockConfig,
}

impl NodeConfig {
    /// Loads the config from the file named by `CONFIG_FILE`. Variables like
    /// `TICK_SYNC_NODE__CYCLES` override file values.
    pub fn new() -> Result<Self, ConfigError> {
        let config_file = std::env::var("CONFIG_FILE")
            .map_err(|_| ConfigError::Message("CONFIG_FILE environment variable not set".into()))?;
        Self::from_file(&config_file)
    }

    pub fn from_file(config_file: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = Config::builder()
            .add_source(File::with_name(config_file))
            .add_source(
                Environment::with_prefix("TICK_SYNC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.clock.validate()?;
        if self.node.status_period_ticks == 0 || self.node.sample_interval_ms == 0 {
            return Err(ConfigError::Message(
                "status_period_ticks and sample_interval_ms must be > 0".into(),
            ));
        }
        if self.node.master_uncertainty_usecs < 0.0 {
            return Err(ConfigError::Message(
                "master_uncertainty_usecs must be >= 0".into(),
            ));
        }
        Ok(())
    }
}
