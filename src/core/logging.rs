use tracing_subscriber::FmtSubscriber;

use crate::core::config::PipelineConfig;
use crate::core::errors::{GenError, Result};

/// Install a global fmt subscriber at the configured log level.
///
/// Libraries embedding the pipeline usually install their own subscriber;
/// this is for binaries and demos that just want readable output.
pub fn init_tracing(config: &PipelineConfig) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.tracing_level()?)
        .with_target(false)
        .with_thread_names(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| GenError::configuration(format!("tracing subscriber already set: {}", e)))
}
