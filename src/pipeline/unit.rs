//! The contract every generation unit implements.
//!
//! A unit declares *when* it may run through a [`UnitSpec`] and does its
//! work in [`GenerationUnit::on_generate`]. Units talk to each other only
//! through the blackboard and through completion of their predecessors.

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::blackboard::Blackboard;
use super::tracker::CompletionTracker;
use crate::core::errors::Result;

/// Stable identity of a unit for the lifetime of a run
pub type UnitId = &'static str;

/// What a unit needs from the blackboard before it may start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataRequirement {
    /// Explicitly needs nothing; the unit is always ready, predecessors included
    Nothing,
    /// Every listed key must be present
    Keys(BTreeSet<String>),
}

/// Declared scheduling metadata of a unit.
///
/// Leaving both `required_data` and `required_predecessors` undeclared means
/// the unit is never ready. A unit with no dependencies must say so with
/// [`UnitSpec::no_requirement`], which also makes it ready regardless of
/// any declared predecessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitSpec {
    /// Dispatch tier; lower tiers are dispatched first but never block higher ones
    pub priority: i32,
    pub required_data: Option<DataRequirement>,
    pub required_predecessors: Option<BTreeSet<UnitId>>,
    /// Run `on_generate` on a dedicated blocking worker instead of the dispatch task
    pub dedicated_worker: bool,
}

impl UnitSpec {
    /// A spec with the given priority and nothing declared
    pub fn new(priority: i32) -> Self {
        Self {
            priority,
            required_data: None,
            required_predecessors: None,
            dedicated_worker: false,
        }
    }

    /// Declare the `Nothing` sentinel; the unit becomes always ready
    pub fn no_requirement(mut self) -> Self {
        self.required_data = Some(DataRequirement::Nothing);
        self
    }

    /// Require blackboard keys. Replaces a previous `Nothing` declaration.
    pub fn requires<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut required = match self.required_data.take() {
            Some(DataRequirement::Keys(existing)) => existing,
            _ => BTreeSet::new(),
        };
        required.extend(keys.into_iter().map(Into::into));
        self.required_data = Some(DataRequirement::Keys(required));
        self
    }

    /// Require other units to have reported completion
    pub fn after<I>(mut self, units: I) -> Self
    where
        I: IntoIterator<Item = UnitId>,
    {
        self.required_predecessors
            .get_or_insert_with(BTreeSet::new)
            .extend(units);
        self
    }

    /// Run on a dedicated worker
    pub fn dedicated(mut self) -> Self {
        self.dedicated_worker = true;
        self
    }

    /// Whether anything at all was declared; units that declare nothing never run
    pub fn declares_requirement(&self) -> bool {
        self.required_data.is_some() || self.required_predecessors.is_some()
    }

    /// Blackboard keys the unit waits for
    pub fn required_keys(&self) -> impl Iterator<Item = &str> {
        let keys = match &self.required_data {
            Some(DataRequirement::Keys(keys)) => Some(keys),
            _ => None,
        };
        keys.into_iter().flatten().map(String::as_str)
    }

    /// Units the unit waits for
    pub fn predecessors(&self) -> impl Iterator<Item = UnitId> + '_ {
        self.required_predecessors.iter().flatten().copied()
    }
}

/// Identity and scheduling metadata of a unit.
///
/// `#[generation_unit(...)]` implements this for a struct; hand-written
/// units implement it directly.
pub trait UnitDeclaration {
    fn unit_id(&self) -> UnitId;
    fn unit_spec(&self) -> UnitSpec;
}

/// A pluggable generation step
pub trait GenerationUnit: UnitDeclaration + Send + 'static {
    /// Called once, synchronously, during registration with the unit's own
    /// seeded generator.
    fn on_registrate(&mut self, _rng: fastrand::Rng) {}

    /// Does the work. Invoked at most once per run, after the unit became ready.
    ///
    /// Must publish outputs to the blackboard and call
    /// [`GenerationContext::mark_complete`] before returning. Returning `Ok`
    /// without marking completion leaves the run unfinished.
    fn on_generate(&mut self, ctx: &GenerationContext) -> anyhow::Result<()>;
}

/// What a running unit sees of the pipeline
pub struct GenerationContext {
    unit: UnitId,
    seed: u64,
    blackboard: Blackboard,
    tracker: CompletionTracker,
}

impl GenerationContext {
    pub(crate) fn new(
        unit: UnitId,
        seed: u64,
        blackboard: Blackboard,
        tracker: CompletionTracker,
    ) -> Self {
        Self {
            unit,
            seed,
            blackboard,
            tracker,
        }
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit
    }

    /// The unit's child seed, as passed to `on_registrate`
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// A fresh generator on the unit's child seed
    pub fn rng(&self) -> fastrand::Rng {
        fastrand::Rng::with_seed(self.seed)
    }

    pub fn blackboard(&self) -> &Blackboard {
        &self.blackboard
    }

    /// Publish an artifact under this unit's name
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.blackboard.set_by(key.into(), Arc::new(value), Some(self.unit));
    }

    /// Publish an already shared artifact under this unit's name
    pub fn set_shared<T: Any + Send + Sync>(&self, key: impl Into<String>, value: Arc<T>) {
        self.blackboard.set_by(key.into(), value, Some(self.unit));
    }

    pub fn has(&self, key: &str) -> bool {
        self.blackboard.has(key)
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>> {
        self.blackboard.get(key)
    }

    pub fn try_get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.blackboard.try_get(key)
    }

    /// Report this unit as complete. Idempotent.
    pub fn mark_complete(&self) {
        self.tracker.mark_complete(self.unit);
    }
}
