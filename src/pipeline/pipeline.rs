use std::fmt;
use std::time::Duration;

use async_broadcast::Receiver;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::blackboard::Blackboard;
use super::diagnostics::{diagnose, DependencyIssue};
use super::events::{EventBus, PipelineEvent};
use super::registry::{RegistrationRecord, Registry, UnitCatalog};
use super::report::RunReport;
use super::scheduler::{self, Scheduler};
use super::signal::ChangeSignal;
use super::tracker::{CompletionTracker, UnitState};
use super::unit::UnitId;
use crate::core::config::PipelineConfig;
use crate::core::errors::{GenError, Result};

/// Where a pipeline is in its register, start, finish cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    Idle,
    Registered,
    Running,
    Finished,
    /// At least one unit failed; `clear` before the next run
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::Registered => "registered",
            RunPhase::Running => "running",
            RunPhase::Finished => "finished",
            RunPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Orchestrates one generation run at a time.
///
/// Owns the registry, the blackboard, the completion tracker and the
/// scheduler of the current run. Typical use:
///
/// ```ignore
/// let mut pipeline = Pipeline::new(UnitCatalog::linked());
/// pipeline.register(1337)?;
/// pipeline.start()?;
/// let report = pipeline.wait_for_completion().await?;
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    catalog: UnitCatalog,
    registry: Registry,
    blackboard: Blackboard,
    tracker: CompletionTracker,
    scheduler: Scheduler,
    events: EventBus,
    started: bool,
}

impl Pipeline {
    pub fn new(catalog: UnitCatalog) -> Self {
        Self::build(catalog, PipelineConfig::default())
    }

    pub fn with_config(catalog: UnitCatalog, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(catalog, config))
    }

    fn build(catalog: UnitCatalog, config: PipelineConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        let signal = ChangeSignal::new();
        Self {
            blackboard: Blackboard::with_signal(signal.clone()),
            tracker: CompletionTracker::new(signal, events.clone()),
            config,
            catalog,
            registry: Registry::new(),
            scheduler: Scheduler::new(),
            events,
            started: false,
        }
    }

    pub fn phase(&self) -> RunPhase {
        if !self.registry.is_registered() {
            RunPhase::Idle
        } else if !self.started {
            RunPhase::Registered
        } else if !self.tracker.failed_units().is_empty() {
            RunPhase::Failed
        } else if self.tracker.all_complete() {
            RunPhase::Finished
        } else {
            RunPhase::Running
        }
    }

    /// Discover and register every catalog unit not registered yet.
    /// Returns how many units were added.
    pub fn register(&mut self, seed: u64) -> Result<usize> {
        match self.phase() {
            RunPhase::Idle | RunPhase::Registered => {}
            phase => {
                return Err(GenError::lifecycle(
                    "register",
                    format!("pipeline is {}; clear it before registering a new run", phase),
                ))
            }
        }

        let added = self.registry.register(seed, self.catalog.discover());
        for record in &added {
            self.tracker.track(record);
            self.events.emit(PipelineEvent::UnitRegistered {
                unit: record.unit.to_string(),
                priority: record.spec.priority,
                seed: record.seed,
            });
        }
        self.tracker.set_registered(seed);
        Ok(added.len())
    }

    /// Register with the seed from the configuration
    pub fn register_configured(&mut self) -> Result<usize> {
        self.register(self.config.seed)
    }

    /// Drop every record, artifact and completion state so a new run can be registered.
    /// The end callback is kept.
    pub fn clear(&mut self) -> Result<()> {
        if self.phase() == RunPhase::Running {
            return Err(GenError::lifecycle("clear", "a run is in progress"));
        }

        self.scheduler.abort_pending();
        self.registry.clear();

        let callback = self.tracker.end_callback();
        let signal = ChangeSignal::new();
        self.blackboard = Blackboard::with_signal(signal.clone());
        self.tracker = CompletionTracker::new(signal, self.events.clone());
        self.tracker.set_end_callback(callback);
        self.started = false;

        info!("Pipeline cleared");
        Ok(())
    }

    /// Dispatch every registered unit. Returns immediately; see
    /// [`wait_for_completion`](Self::wait_for_completion).
    pub fn start(&mut self) -> Result<usize> {
        match self.phase() {
            RunPhase::Registered => {}
            RunPhase::Idle => {
                return Err(GenError::lifecycle("start", "register units before starting"))
            }
            phase => {
                return Err(GenError::lifecycle(
                    "start",
                    format!("pipeline is already {}", phase),
                ))
            }
        }

        for issue in self.diagnostics() {
            warn!(issue = %issue, "Dependency problem");
        }

        self.tracker.begin_run();
        let dispatched = self.scheduler.start(
            &mut self.registry,
            &self.blackboard,
            &self.tracker,
            &self.events,
            self.config.max_dedicated_workers,
        )?;
        self.started = true;

        info!(run_id = %self.tracker.run_id(), units = dispatched, "Generation started");
        // A run without units is complete right away
        self.tracker.poll_end();
        Ok(dispatched)
    }

    pub fn is_ready(&self, unit: &str) -> bool {
        self.registry
            .record(unit)
            .map(|record| scheduler::is_ready(&record.spec, &self.blackboard, &self.tracker))
            .unwrap_or(false)
    }

    pub fn mark_complete(&self, unit: &str) -> bool {
        self.tracker.mark_complete(unit)
    }

    pub fn is_complete(&self, unit: &str) -> bool {
        self.tracker.is_complete(unit)
    }

    pub fn all_complete(&self) -> bool {
        self.tracker.all_complete()
    }

    pub fn state(&self, unit: &str) -> Option<UnitState> {
        self.tracker.state(unit)
    }

    /// Tick-style end detection, see [`CompletionTracker::poll_end`]
    pub fn poll_end(&self) -> bool {
        self.started && self.tracker.poll_end()
    }

    /// Wait for the run to end, bounded by `completion_timeout_ms` when configured
    pub async fn wait_for_completion(&self) -> Result<RunReport> {
        if !self.started {
            return Err(GenError::lifecycle("wait_for_completion", "the run has not been started"));
        }
        match self.config.completion_timeout() {
            Some(timeout) => self.tracker.wait_for_completion_timeout(timeout).await,
            None => self.tracker.wait_for_completion().await,
        }
    }

    pub async fn wait_for_completion_timeout(&self, timeout: Duration) -> Result<RunReport> {
        if !self.started {
            return Err(GenError::lifecycle("wait_for_completion", "the run has not been started"));
        }
        self.tracker.wait_for_completion_timeout(timeout).await
    }

    /// Install the callback fired once at the end of every run
    pub fn on_end<F>(&self, callback: F)
    where
        F: Fn(&RunReport) + Send + Sync + 'static,
    {
        self.tracker.on_end(callback);
    }

    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn report(&self) -> RunReport {
        self.tracker.report()
    }

    pub fn tiers(&self) -> Vec<(i32, Vec<UnitId>)> {
        self.registry.tiers()
    }

    pub fn records(&self) -> impl Iterator<Item = &RegistrationRecord> {
        self.registry.records()
    }

    pub fn child_seed(&self, unit: &str) -> Option<u64> {
        self.registry.child_seed(unit)
    }

    pub fn diagnostics(&self) -> Vec<DependencyIssue> {
        diagnose(self.registry.records())
    }

    pub fn blackboard(&self) -> &Blackboard {
        &self.blackboard
    }

    pub fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("phase", &self.phase())
            .field("registry", &self.registry)
            .field("blackboard", &self.blackboard)
            .field("active_dispatches", &self.scheduler.active())
            .finish()
    }
}
