//! Per-unit state, aggregate completion and end-of-run detection.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{EventBus, PipelineEvent};
use super::registry::RegistrationRecord;
use super::report::{RunReport, UnitOutcome};
use super::signal::ChangeSignal;
use super::unit::UnitId;
use crate::core::errors::{GenError, Result};

/// Lifecycle state of a registered unit. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UnitState {
    Registered,
    /// Dispatched and waiting for its readiness predicate
    Pending,
    Running,
    Completed,
    /// `on_generate` returned an error or panicked
    Failed,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Completed | UnitState::Failed)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitState::Registered => "registered",
            UnitState::Pending => "pending",
            UnitState::Running => "running",
            UnitState::Completed => "completed",
            UnitState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
struct UnitProgress {
    state: UnitState,
    priority: i32,
    dedicated_worker: bool,
    seed: u64,
    started: Option<Instant>,
    finished: Option<Instant>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct RunClock {
    run_id: Uuid,
    seed: u64,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    elapsed: Option<Duration>,
}

impl RunClock {
    fn new(seed: u64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            seed,
            started_at: None,
            started: None,
            elapsed: None,
        }
    }
}

/// Callback fired once per run when every unit has completed
pub type EndCallback = Arc<dyn Fn(&RunReport) + Send + Sync>;

struct TrackerInner {
    units: DashMap<UnitId, UnitProgress>,
    registered: AtomicBool,
    ended: AtomicBool,
    clock: Mutex<RunClock>,
    on_end: Mutex<Option<EndCallback>>,
    signal: ChangeSignal,
    events: EventBus,
}

/// Tracks completion of every registered unit.
///
/// Cheap to clone; clones share state. Units report their own completion
/// through [`GenerationContext::mark_complete`](super::unit::GenerationContext::mark_complete).
#[derive(Clone)]
pub struct CompletionTracker {
    inner: Arc<TrackerInner>,
}

impl CompletionTracker {
    pub(crate) fn new(signal: ChangeSignal, events: EventBus) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                units: DashMap::new(),
                registered: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                clock: Mutex::new(RunClock::new(0)),
                on_end: Mutex::new(None),
                signal,
                events,
            }),
        }
    }

    /// Start tracking a freshly registered unit
    pub(crate) fn track(&self, record: &RegistrationRecord) {
        self.inner.units.insert(
            record.unit,
            UnitProgress {
                state: UnitState::Registered,
                priority: record.spec.priority,
                dedicated_worker: record.spec.dedicated_worker,
                seed: record.seed,
                started: None,
                finished: None,
                error: None,
            },
        );
    }

    /// Flip the registered flag once a registration pass is done
    pub(crate) fn set_registered(&self, seed: u64) {
        if !self.inner.registered.swap(true, Ordering::SeqCst) {
            *self.lock_clock() = RunClock::new(seed);
        }
        self.inner.signal.notify();
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::SeqCst)
    }

    /// Record the start of the run; elapsed time is measured from here
    pub(crate) fn begin_run(&self) {
        let mut clock = self.lock_clock();
        clock.started_at = Some(Utc::now());
        clock.started = Some(Instant::now());
        clock.elapsed = None;
    }

    pub fn run_id(&self) -> Uuid {
        self.lock_clock().run_id
    }

    pub(crate) fn mark_pending(&self, unit: UnitId) {
        self.advance(unit, UnitState::Pending, None);
    }

    pub(crate) fn mark_running(&self, unit: UnitId) {
        self.advance(unit, UnitState::Running, None);
    }

    pub(crate) fn mark_failed(&self, unit: UnitId, message: String) {
        error!(unit = unit, error = %message, "Unit generation failed");
        if self.advance(unit, UnitState::Failed, Some(message.clone())) {
            self.inner.events.emit(PipelineEvent::UnitFailed {
                unit: unit.to_string(),
                error: message,
            });
        }
    }

    /// Mark `unit` as completed.
    ///
    /// Before registration, or for a unit this tracker does not know, this
    /// logs a warning and does nothing. Repeated calls are no-ops.
    /// Returns whether the unit is complete afterwards.
    pub fn mark_complete(&self, unit: &str) -> bool {
        if !self.is_registered() {
            warn!(unit = unit, "Attempt to change the state of a unit before registering it");
            return false;
        }
        let Some(id) = self.inner.units.get(unit).map(|entry| *entry.key()) else {
            warn!(unit = unit, "Attempt to complete a unit that is not registered");
            return false;
        };

        match self.state(id) {
            Some(UnitState::Completed) => return true,
            Some(UnitState::Failed) => {
                warn!(unit = id, "Unit already failed, ignoring completion");
                return false;
            }
            _ => {}
        }

        if self.advance(id, UnitState::Completed, None) {
            info!(unit = id, "Unit generation completed");
            self.inner.events.emit(PipelineEvent::UnitCompleted {
                unit: id.to_string(),
            });
        }
        true
    }

    /// Move a unit forward; never backwards. Returns whether the state changed.
    fn advance(&self, unit: UnitId, next: UnitState, error: Option<String>) -> bool {
        let changed = match self.inner.units.get_mut(unit) {
            Some(mut progress) if progress.state < next && !progress.state.is_terminal() => {
                debug!(unit = unit, from = %progress.state, to = %next, "Unit state changed");
                progress.state = next;
                match next {
                    UnitState::Running => progress.started = Some(Instant::now()),
                    UnitState::Completed | UnitState::Failed => {
                        progress.finished = Some(Instant::now());
                        progress.error = error;
                    }
                    _ => {}
                }
                true
            }
            _ => false,
        };
        if changed {
            self.inner.signal.notify();
        }
        changed
    }

    pub fn state(&self, unit: &str) -> Option<UnitState> {
        self.inner.units.get(unit).map(|progress| progress.state)
    }

    /// Every tracked unit with its state, sorted by unit id
    pub fn states(&self) -> Vec<(UnitId, UnitState)> {
        let mut states: Vec<(UnitId, UnitState)> = self
            .inner
            .units
            .iter()
            .map(|entry| (*entry.key(), entry.value().state))
            .collect();
        states.sort_by_key(|(unit, _)| *unit);
        states
    }

    pub fn is_complete(&self, unit: &str) -> bool {
        self.state(unit) == Some(UnitState::Completed)
    }

    /// True once registration happened and every registered unit completed
    pub fn all_complete(&self) -> bool {
        self.is_registered()
            && self
                .inner
                .units
                .iter()
                .all(|progress| progress.state == UnitState::Completed)
    }

    pub fn completed_count(&self) -> usize {
        self.inner
            .units
            .iter()
            .filter(|progress| progress.state == UnitState::Completed)
            .count()
    }

    /// Failed units with their error messages, sorted by unit id
    pub fn failed_units(&self) -> Vec<(UnitId, String)> {
        let mut failed: Vec<(UnitId, String)> = self
            .inner
            .units
            .iter()
            .filter(|progress| progress.state == UnitState::Failed)
            .map(|entry| (*entry.key(), entry.error.clone().unwrap_or_default()))
            .collect();
        failed.sort();
        failed
    }

    pub fn len(&self) -> usize {
        self.inner.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.units.is_empty()
    }

    /// Install the end-of-run callback. It fires at most once per run.
    pub fn on_end<F>(&self, callback: F)
    where
        F: Fn(&RunReport) + Send + Sync + 'static,
    {
        *self.lock_on_end() = Some(Arc::new(callback));
    }

    pub(crate) fn end_callback(&self) -> Option<EndCallback> {
        self.lock_on_end().clone()
    }

    pub(crate) fn set_end_callback(&self, callback: Option<EndCallback>) {
        *self.lock_on_end() = callback;
    }

    /// Whether the end of the run has been detected
    pub fn has_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    /// Tick-style end detection.
    ///
    /// Returns true once the run has ended. The first call that observes
    /// aggregate completion records the elapsed time, fires the end callback
    /// and emits `RunFinished`; later calls only report.
    pub fn poll_end(&self) -> bool {
        if self.has_ended() {
            return true;
        }
        if !self.all_complete() || self.lock_clock().started.is_none() {
            return false;
        }
        if self
            .inner
            .ended
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return true;
        }

        let elapsed = {
            let mut clock = self.lock_clock();
            let elapsed = clock.started.map(|started| started.elapsed()).unwrap_or_default();
            clock.elapsed = Some(elapsed);
            elapsed
        };
        let report = self.report();
        info!(
            run_id = %report.run_id,
            elapsed_ms = elapsed.as_millis() as u64,
            units = report.units.len(),
            "Generation finished"
        );

        self.inner.events.emit(PipelineEvent::RunFinished {
            run_id: report.run_id.to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
        });
        if let Some(callback) = self.end_callback() {
            callback(&report);
        }
        true
    }

    /// Wait until every unit completed, without polling.
    ///
    /// Resolves with the run report once the run ended, or with
    /// [`GenError::UnitFailed`] as soon as any unit failed. A unit whose
    /// predicate never holds keeps this pending forever; see
    /// [`wait_for_completion_timeout`](Self::wait_for_completion_timeout).
    pub async fn wait_for_completion(&self) -> Result<RunReport> {
        let mut changes = self.inner.signal.subscribe();
        loop {
            if let Some((unit, message)) = self.failed_units().into_iter().next() {
                return Err(GenError::unit_failed(unit, message));
            }
            if self.poll_end() {
                return Ok(self.report());
            }
            if changes.changed().await.is_err() {
                return Err(GenError::internal("completion signal closed"));
            }
        }
    }

    /// Like [`wait_for_completion`](Self::wait_for_completion) with a deadline.
    /// Expiry only stops waiting; the run itself keeps going.
    pub async fn wait_for_completion_timeout(&self, timeout: Duration) -> Result<RunReport> {
        match tokio::time::timeout(timeout, self.wait_for_completion()).await {
            Ok(result) => result,
            Err(_) => {
                let pending: Vec<UnitId> = self
                    .states()
                    .into_iter()
                    .filter(|(_, state)| !state.is_terminal())
                    .map(|(unit, _)| unit)
                    .collect();
                warn!(?pending, timeout_ms = timeout.as_millis() as u64, "Run did not finish in time");
                Err(GenError::timeout("wait_for_completion", timeout.as_millis() as u64))
            }
        }
    }

    /// Snapshot of the run so far
    pub fn report(&self) -> RunReport {
        let clock = self.lock_clock().clone();
        let mut units: Vec<UnitOutcome> = self
            .inner
            .units
            .iter()
            .map(|entry| {
                let progress = entry.value();
                let duration_ms = match (progress.started, progress.finished) {
                    (Some(started), Some(finished)) => {
                        Some(finished.saturating_duration_since(started).as_millis() as u64)
                    }
                    _ => None,
                };
                UnitOutcome {
                    unit: entry.key().to_string(),
                    priority: progress.priority,
                    dedicated_worker: progress.dedicated_worker,
                    seed: progress.seed,
                    state: progress.state,
                    duration_ms,
                    error: progress.error.clone(),
                }
            })
            .collect();
        units.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.unit.cmp(&b.unit)));

        RunReport::new(
            clock.run_id,
            clock.seed,
            clock.started_at,
            clock.elapsed.map(|elapsed| elapsed.as_millis() as u64),
            units,
        )
    }

    fn lock_clock(&self) -> std::sync::MutexGuard<'_, RunClock> {
        // A poisoned clock only means a callback panicked mid-update; the data is still usable
        self.inner
            .clock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_on_end(&self) -> std::sync::MutexGuard<'_, Option<EndCallback>> {
        self.inner
            .on_end
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for CompletionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionTracker")
            .field("registered", &self.is_registered())
            .field("ended", &self.has_ended())
            .field("states", &self.states())
            .finish()
    }
}
