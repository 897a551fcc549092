//! Generation pipeline: units, blackboard, registry, scheduler and tracker

pub mod blackboard;
pub mod diagnostics;
pub mod events;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod scheduler;
pub(crate) mod signal;
pub mod tracker;
pub mod unit;

pub use blackboard::{Artifact, Blackboard};
pub use diagnostics::{diagnose, DependencyIssue};
pub use events::{EventBus, PipelineEvent};
pub use pipeline::{Pipeline, RunPhase};
pub use registry::{LinkedUnit, RegistrationRecord, Registry, UnitCatalog};
pub use report::{RunReport, UnitOutcome};
pub use scheduler::{is_ready, Scheduler};
pub use tracker::{CompletionTracker, EndCallback, UnitState};
pub use unit::{
    DataRequirement, GenerationContext, GenerationUnit, UnitDeclaration, UnitId, UnitSpec,
};
