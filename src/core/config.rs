use std::path::Path;
use std::time::Duration;
use serde::{Serialize, Deserialize};
use tracing::Level;

use crate::core::errors::{GenError, Result};

/// Run configuration for a generation pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Seed of the master random stream; every unit seed is drawn from it
    pub seed: u64,

    // Worker configuration
    /// Upper bound on concurrently running dedicated workers.
    /// `None` sizes the pool to the number of dedicated units in the run.
    pub max_dedicated_workers: Option<usize>,

    // Driver configuration
    /// How long the driver waits for the run to finish before giving up (milliseconds)
    pub completion_timeout_ms: Option<u64>,

    /// Capacity of the pipeline event channel; oldest events are dropped when full
    pub event_capacity: usize,

    /// Log level used by `init_tracing`: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            max_dedicated_workers: None,
            completion_timeout_ms: None,
            event_capacity: 256,
            log_level: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for PipelineConfig
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }

    /// Parse a configuration from YAML text
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a YAML file
    pub fn load_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| GenError::io(format!("read {}", path.display()), e))?;
        Self::from_yaml_str(&contents)
    }

    /// Serialize the configuration back to YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_dedicated_workers == Some(0) {
            return Err(GenError::configuration_field(
                "max_dedicated_workers must be greater than 0",
                "max_dedicated_workers",
            ));
        }
        if self.completion_timeout_ms == Some(0) {
            return Err(GenError::configuration_field(
                "completion_timeout_ms must be greater than 0",
                "completion_timeout_ms",
            ));
        }
        if self.event_capacity == 0 {
            return Err(GenError::configuration_field(
                "event_capacity must be greater than 0",
                "event_capacity",
            ));
        }
        self.tracing_level()?;
        Ok(())
    }

    /// Completion timeout as a duration
    pub fn completion_timeout(&self) -> Option<Duration> {
        self.completion_timeout_ms.map(Duration::from_millis)
    }

    /// Parsed log level
    pub fn tracing_level(&self) -> Result<Level> {
        self.log_level.parse::<Level>().map_err(|_| {
            GenError::configuration_field(
                format!("unknown log level '{}'", self.log_level),
                "log_level",
            )
        })
    }
}

/// Builder for PipelineConfig
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
        }
    }

    /// Set the run seed
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Cap the dedicated worker pool
    pub fn max_dedicated_workers(mut self, workers: usize) -> Self {
        self.config.max_dedicated_workers = Some(workers);
        self
    }

    /// Set the driver's completion timeout
    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.config.completion_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<PipelineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for PipelineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
