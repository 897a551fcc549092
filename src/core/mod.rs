// Infrastructure shared by every part of the pipeline

pub mod config;
pub mod errors;
pub mod logging;

// Re-export commonly used types
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use errors::{GenError, Result};
pub use logging::init_tracing;
