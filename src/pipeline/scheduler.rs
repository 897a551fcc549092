//! Dispatch of registered units and readiness gating.
//!
//! Every unit gets its own dispatch task. The task parks until the unit's
//! readiness predicate holds, re-checking only when the blackboard or a unit
//! state changes, then runs `on_generate` either inline or on a dedicated
//! blocking worker.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::blackboard::Blackboard;
use super::events::{EventBus, PipelineEvent};
use super::registry::{RegistrationRecord, Registry};
use super::tracker::CompletionTracker;
use super::unit::{DataRequirement, GenerationContext, GenerationUnit, UnitSpec};
use crate::core::errors::{GenError, Result};

/// Whether a unit may start now.
///
/// A unit that declares neither data nor predecessors is never ready, and a
/// unit that declares `Nothing` is always ready, whatever its predecessors.
/// Otherwise both clauses must hold: every required key is on the blackboard
/// (trivially true when undeclared) and every required predecessor has
/// completed (trivially true when undeclared).
pub fn is_ready(spec: &UnitSpec, blackboard: &Blackboard, tracker: &CompletionTracker) -> bool {
    if !spec.declares_requirement() {
        return false;
    }

    let data_ready = match &spec.required_data {
        Some(DataRequirement::Nothing) => return true,
        None => true,
        Some(DataRequirement::Keys(keys)) => keys.iter().all(|key| blackboard.has(key)),
    };

    data_ready && spec.predecessors().all(|unit| tracker.is_complete(unit))
}

/// Shared handles a dispatch task needs
#[derive(Clone)]
struct DispatchContext {
    blackboard: Blackboard,
    tracker: CompletionTracker,
    events: EventBus,
    workers: Arc<Semaphore>,
}

/// Owns the dispatch tasks of one run
#[derive(Debug, Default)]
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn one dispatch task per registered unit, tier by tier in ascending
    /// priority. Returns the number of dispatched units.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn start(
        &mut self,
        registry: &mut Registry,
        blackboard: &Blackboard,
        tracker: &CompletionTracker,
        events: &EventBus,
        max_dedicated_workers: Option<usize>,
    ) -> Result<usize> {
        let runtime = Handle::try_current()
            .map_err(|_| GenError::lifecycle("start", "no Tokio runtime is running"))?;

        let dedicated = registry.dedicated_count();
        let worker_count = max_dedicated_workers
            .map_or(dedicated, |cap| dedicated.min(cap))
            .max(1);
        let ctx = DispatchContext {
            blackboard: blackboard.clone(),
            tracker: tracker.clone(),
            events: events.clone(),
            workers: Arc::new(Semaphore::new(worker_count)),
        };
        debug!(dedicated, worker_count, "Dedicated worker pool sized");

        let mut dispatched = 0;
        for (priority, units) in registry.tiers() {
            debug!(priority, units = ?units, "Dispatching tier");
            for id in units {
                let (Some(unit), Some(record)) = (registry.take_unit(id), registry.record(id).cloned())
                else {
                    continue;
                };

                ctx.events.emit(PipelineEvent::UnitDispatched {
                    unit: id.to_string(),
                    priority,
                });
                let span = info_span!("unit", unit = id, priority);
                let handle = runtime.spawn(dispatch(unit, record, ctx.clone()).instrument(span));
                self.handles.push(handle);
                dispatched += 1;
            }
        }

        info!(dispatched, "Run started");
        Ok(dispatched)
    }

    /// Number of dispatch tasks that have not finished yet
    pub fn active(&self) -> usize {
        self.handles.iter().filter(|handle| !handle.is_finished()).count()
    }

    /// Abort every dispatch task that is still waiting or running inline.
    /// Work already handed to a dedicated worker runs to its end.
    pub fn abort_pending(&mut self) {
        let mut aborted = 0;
        for handle in self.handles.drain(..) {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            debug!(aborted, "Aborted pending dispatches");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.abort_pending();
    }
}

async fn dispatch(mut unit: Box<dyn GenerationUnit>, record: RegistrationRecord, ctx: DispatchContext) {
    let id = record.unit;
    // Subscribe before the first check so no change is missed
    let mut changes = ctx.blackboard.subscribe();
    ctx.tracker.mark_pending(id);

    if !record.spec.declares_requirement() {
        warn!("Unit declares neither required data nor predecessors and will never run");
    }

    while !is_ready(&record.spec, &ctx.blackboard, &ctx.tracker) {
        if changes.changed().await.is_err() {
            debug!("Change signal closed before the unit became ready");
            return;
        }
    }

    if ctx.tracker.state(id).is_some_and(|state| state.is_terminal()) {
        debug!("Unit already finished before dispatch, skipping generation");
        ctx.tracker.poll_end();
        return;
    }

    ctx.tracker.mark_running(id);
    ctx.events.emit(PipelineEvent::UnitStarted {
        unit: id.to_string(),
        dedicated_worker: record.spec.dedicated_worker,
    });
    info!(dedicated_worker = record.spec.dedicated_worker, "Unit generation started");

    let generation = GenerationContext::new(id, record.seed, ctx.blackboard.clone(), ctx.tracker.clone());
    let outcome = if record.spec.dedicated_worker {
        let permit = match Arc::clone(&ctx.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                ctx.tracker.mark_failed(id, "dedicated worker pool closed".to_string());
                return;
            }
        };
        let span = Span::current();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let _entered = span.enter();
            unit.on_generate(&generation)
        })
        .await
        .map_err(|join_error| {
            if join_error.is_panic() {
                panic_message(join_error.into_panic().as_ref())
            } else {
                "dedicated worker was cancelled".to_string()
            }
        })
    } else {
        panic::catch_unwind(AssertUnwindSafe(|| unit.on_generate(&generation)))
            .map_err(|payload| panic_message(payload.as_ref()))
    };

    match outcome {
        Ok(Ok(())) => {
            if !ctx.tracker.is_complete(id) {
                warn!("Unit returned without marking completion; the run cannot finish");
            }
        }
        Ok(Err(err)) => ctx.tracker.mark_failed(id, format!("{:#}", err)),
        Err(message) => ctx.tracker.mark_failed(id, format!("panicked: {}", message)),
    }

    ctx.tracker.poll_end();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
