// Core infrastructure: configuration, errors, logging
pub mod core;

// Blackboard-driven generation pipeline
pub mod pipeline;

// Re-exports for convenience
pub use crate::core::{init_tracing, GenError, PipelineConfig, PipelineConfigBuilder, Result};
pub use pipeline::*;

pub use genboard_macros::generation_unit;

#[doc(hidden)]
pub use linkme;

/// Units self-registered with `#[generation_unit]`, see [`UnitCatalog::linked`]
#[linkme::distributed_slice]
pub static UNITS: [LinkedUnit] = [..];
