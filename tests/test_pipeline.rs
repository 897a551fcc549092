//! Test suite for the generation pipeline

use futures::StreamExt;
use genboard::{
    DependencyIssue, GenError, GenerationContext, GenerationUnit, Pipeline, PipelineConfig,
    PipelineEvent, RunPhase, UnitCatalog, UnitDeclaration, UnitId, UnitSpec, UnitState,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEADLINE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
enum Behavior {
    /// Publish outputs and mark complete
    Complete,
    /// Return an error
    Fail,
    /// Return Ok without marking complete
    Forget,
    /// Sleep before publishing
    Slow(Duration),
}

/// Configurable unit that writes its child seed under each output key
#[derive(Clone)]
struct TestUnit {
    id: UnitId,
    spec: UnitSpec,
    outputs: Vec<&'static str>,
    behavior: Behavior,
}

impl TestUnit {
    fn new(id: UnitId, spec: UnitSpec) -> Self {
        Self {
            id,
            spec,
            outputs: Vec::new(),
            behavior: Behavior::Complete,
        }
    }

    fn writes(mut self, key: &'static str) -> Self {
        self.outputs.push(key);
        self
    }

    fn behaving(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }
}

impl UnitDeclaration for TestUnit {
    fn unit_id(&self) -> UnitId {
        self.id
    }

    fn unit_spec(&self) -> UnitSpec {
        self.spec.clone()
    }
}

impl GenerationUnit for TestUnit {
    fn on_generate(&mut self, ctx: &GenerationContext) -> anyhow::Result<()> {
        // Every required key must be readable once the unit runs
        for key in self.spec.required_keys() {
            ctx.get::<u64>(key)?;
        }

        match &self.behavior {
            Behavior::Fail => anyhow::bail!("{} cannot generate", self.id),
            Behavior::Slow(delay) => std::thread::sleep(*delay),
            Behavior::Complete | Behavior::Forget => {}
        }

        for key in &self.outputs {
            ctx.set(*key, ctx.seed());
        }
        if !matches!(self.behavior, Behavior::Forget) {
            ctx.mark_complete();
        }
        Ok(())
    }
}

fn catalog_of(units: Vec<TestUnit>) -> UnitCatalog {
    units
        .into_iter()
        .fold(UnitCatalog::new(), |catalog, unit| catalog.with_unit(unit))
}

fn pipeline_of(units: Vec<TestUnit>) -> Pipeline {
    Pipeline::new(catalog_of(units))
}

/// A (p1, no requirement) writes x; B (p1) needs x; C (p2) runs after A
fn abc() -> Vec<TestUnit> {
    vec![
        TestUnit::new("a", UnitSpec::new(1).no_requirement()).writes("x"),
        TestUnit::new("b", UnitSpec::new(1).requires(["x"])),
        TestUnit::new("c", UnitSpec::new(2).after(["a"])),
    ]
}

#[test]
fn test_clear_and_reregister_reproduces_seeds() {
    let mut pipeline = pipeline_of(abc());
    pipeline.register(2024).unwrap();
    let first: Vec<(UnitId, u64)> = pipeline.records().map(|r| (r.unit, r.seed)).collect();

    pipeline.clear().unwrap();
    assert_eq!(pipeline.phase(), RunPhase::Idle);
    assert!(pipeline.records().next().is_none());

    pipeline.register(2024).unwrap();
    let second: Vec<(UnitId, u64)> = pipeline.records().map(|r| (r.unit, r.seed)).collect();
    assert_eq!(first, second);
}

#[test]
fn test_no_requirement_unit_is_ready_after_registration() {
    let mut pipeline = pipeline_of(abc());
    assert!(!pipeline.is_ready("a"));

    pipeline.register(1).unwrap();
    assert!(pipeline.is_ready("a"));
    assert!(!pipeline.is_ready("b"));
    assert!(!pipeline.is_ready("c"));
}

#[tokio::test]
async fn test_no_requirement_ignores_predecessors() {
    let mut pipeline = pipeline_of(vec![
        TestUnit::new("waiting", UnitSpec::new(1).requires(["never_written"])),
        TestUnit::new("eager", UnitSpec::new(2).no_requirement().after(["waiting"])),
    ]);
    pipeline.register(1).unwrap();
    assert!(pipeline.is_ready("eager"));
    assert!(!pipeline.is_ready("waiting"));

    pipeline.start().unwrap();
    let err = pipeline
        .wait_for_completion_timeout(Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, GenError::Timeout { .. }));
    assert_eq!(pipeline.state("eager"), Some(UnitState::Completed));
    assert_eq!(pipeline.state("waiting"), Some(UnitState::Pending));
}

#[test]
fn test_mark_complete_before_registration_is_ignored() {
    let mut pipeline = pipeline_of(abc());
    assert!(!pipeline.mark_complete("a"));
    assert!(!pipeline.all_complete());

    pipeline.register(1).unwrap();
    assert!(pipeline.mark_complete("a"));
    assert!(pipeline.mark_complete("a"));
    assert!(pipeline.is_complete("a"));
}

#[tokio::test]
async fn test_abc_scenario_completes() {
    let mut pipeline = pipeline_of(abc());
    pipeline.register(7).unwrap();
    assert_eq!(pipeline.tiers(), vec![(1, vec!["a", "b"]), (2, vec!["c"])]);
    assert!(pipeline.diagnostics().is_empty());

    assert_eq!(pipeline.start().unwrap(), 3);
    let report = pipeline.wait_for_completion_timeout(DEADLINE).await.unwrap();

    assert!(report.all_complete);
    assert!(report.elapsed_ms.is_some());
    assert_eq!(
        report.units.iter().map(|u| u.unit.as_str()).collect::<Vec<_>>(),
        vec!["a", "b", "c"]
    );
    assert_eq!(pipeline.phase(), RunPhase::Finished);
    assert_eq!(
        *pipeline.blackboard().get::<u64>("x").unwrap(),
        pipeline.child_seed("a").unwrap()
    );
    assert_eq!(pipeline.blackboard().writer_of("x"), Some("a"));
}

#[tokio::test]
async fn test_priority_is_not_a_barrier() {
    // The low tier depends on data produced by a higher tier
    let mut pipeline = pipeline_of(vec![
        TestUnit::new("consumer", UnitSpec::new(0).requires(["late"])),
        TestUnit::new("producer", UnitSpec::new(9).no_requirement()).writes("late"),
    ]);
    pipeline.register(3).unwrap();
    pipeline.start().unwrap();

    let report = pipeline.wait_for_completion_timeout(DEADLINE).await.unwrap();
    assert!(report.all_complete);
}

#[tokio::test]
async fn test_undeclared_unit_never_runs() {
    let mut pipeline = pipeline_of(vec![
        TestUnit::new("a", UnitSpec::new(1).no_requirement()),
        TestUnit::new("idle", UnitSpec::new(1)),
    ]);
    pipeline.register(1).unwrap();
    assert_eq!(
        pipeline.diagnostics(),
        vec![DependencyIssue::NeverReady { unit: "idle" }]
    );

    pipeline.start().unwrap();
    let err = pipeline
        .wait_for_completion_timeout(Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, GenError::Timeout { .. }));
    assert_eq!(pipeline.state("a"), Some(UnitState::Completed));
    assert_eq!(pipeline.state("idle"), Some(UnitState::Pending));
    assert!(!pipeline.all_complete());
    assert_eq!(pipeline.phase(), RunPhase::Running);
    assert!(matches!(pipeline.clear(), Err(GenError::Lifecycle { .. })));
}

#[tokio::test]
async fn test_unit_that_forgets_to_complete_stalls_the_run() {
    let mut pipeline = pipeline_of(vec![TestUnit::new("lazy", UnitSpec::new(1).no_requirement())
        .writes("out")
        .behaving(Behavior::Forget)]);
    pipeline.register(1).unwrap();
    pipeline.start().unwrap();

    let err = pipeline
        .wait_for_completion_timeout(Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, GenError::Timeout { .. }));
    assert!(pipeline.blackboard().has("out"));
    assert_eq!(pipeline.state("lazy"), Some(UnitState::Running));
}

#[tokio::test]
async fn test_failing_unit_is_isolated() {
    let mut pipeline = pipeline_of(vec![
        TestUnit::new("ok", UnitSpec::new(1).no_requirement()),
        TestUnit::new("broken", UnitSpec::new(1).no_requirement())
            .writes("never")
            .behaving(Behavior::Fail),
        TestUnit::new("dependent", UnitSpec::new(2).after(["broken"])),
    ]);
    pipeline.register(1).unwrap();
    pipeline.start().unwrap();

    let err = pipeline.wait_for_completion_timeout(DEADLINE).await.unwrap_err();
    match err {
        GenError::UnitFailed { unit, message, .. } => {
            assert_eq!(unit, "broken");
            assert_eq!(message, "broken cannot generate");
        }
        other => panic!("unexpected error: {other}"),
    }

    // Let the remaining dispatches settle
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(pipeline.state("broken"), Some(UnitState::Failed));
    assert_eq!(pipeline.state("dependent"), Some(UnitState::Pending));
    assert!(!pipeline.blackboard().has("never"));
    assert_eq!(pipeline.phase(), RunPhase::Failed);

    let report = pipeline.report();
    assert!(!report.all_complete);
    assert_eq!(report.error.as_deref(), Some("broken: broken cannot generate"));

    // A failed run can be cleared and run again
    pipeline.clear().unwrap();
    assert_eq!(pipeline.phase(), RunPhase::Idle);
}

#[tokio::test]
async fn test_dedicated_workers_write_concurrently() {
    const KEYS: [&str; 12] = [
        "k0", "k1", "k2", "k3", "k4", "k5", "k6", "k7", "k8", "k9", "k10", "k11",
    ];
    const IDS: [&str; 12] = [
        "w0", "w1", "w2", "w3", "w4", "w5", "w6", "w7", "w8", "w9", "w10", "w11",
    ];

    let units = IDS
        .into_iter()
        .zip(KEYS)
        .map(|(id, key)| {
            TestUnit::new(id, UnitSpec::new(1).no_requirement().dedicated())
                .writes(key)
                .behaving(Behavior::Slow(Duration::from_millis(10)))
        })
        .collect();
    let config = PipelineConfig::builder()
        .max_dedicated_workers(4)
        .build()
        .unwrap();
    let catalog = catalog_of(units);
    let mut pipeline = Pipeline::with_config(catalog, config).unwrap();
    pipeline.register(1).unwrap();
    pipeline.start().unwrap();

    let report = pipeline.wait_for_completion_timeout(DEADLINE).await.unwrap();
    assert!(report.all_complete);
    assert!(report.units.iter().all(|u| u.dedicated_worker));
    for key in KEYS {
        assert!(pipeline.blackboard().has(key), "missing {key}");
    }
    assert_eq!(pipeline.blackboard().len(), KEYS.len());
}

#[tokio::test]
async fn test_end_callback_fires_once_per_run() {
    let mut pipeline = pipeline_of(abc());
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    pipeline.on_end(move |report| {
        assert!(report.all_complete);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for run in 1..=2 {
        pipeline.register(run).unwrap();
        pipeline.start().unwrap();
        pipeline.wait_for_completion_timeout(DEADLINE).await.unwrap();
        assert!(pipeline.poll_end());
        assert!(pipeline.poll_end());
        assert_eq!(fired.load(Ordering::SeqCst), run as usize);
        pipeline.clear().unwrap();
    }
}

#[tokio::test]
async fn test_event_stream_follows_the_run() {
    let mut pipeline = pipeline_of(abc());
    let mut events = pipeline.subscribe();

    pipeline.register(5).unwrap();
    pipeline.start().unwrap();
    pipeline.wait_for_completion_timeout(DEADLINE).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), events.next()).await {
        let finished = matches!(event, PipelineEvent::RunFinished { .. });
        seen.push(event);
        if finished {
            break;
        }
    }

    let count = |pred: fn(&PipelineEvent) -> bool| seen.iter().filter(|e| pred(e)).count();
    assert_eq!(count(|e| matches!(e, PipelineEvent::UnitRegistered { .. })), 3);
    assert_eq!(count(|e| matches!(e, PipelineEvent::UnitDispatched { .. })), 3);
    assert_eq!(count(|e| matches!(e, PipelineEvent::UnitStarted { .. })), 3);
    assert_eq!(count(|e| matches!(e, PipelineEvent::UnitCompleted { .. })), 3);
    assert!(matches!(seen.last(), Some(PipelineEvent::RunFinished { .. })));

    // A unit starts only after its predecessor completed
    let position = |wanted: PipelineEvent| seen.iter().position(|e| *e == wanted).unwrap();
    assert!(
        position(PipelineEvent::UnitCompleted { unit: "a".into() })
            < position(PipelineEvent::UnitStarted {
                unit: "c".into(),
                dedicated_worker: false
            })
    );
}

#[tokio::test]
async fn test_dispatch_follows_ascending_priority() {
    let mut pipeline = pipeline_of(vec![
        TestUnit::new("ridge", UnitSpec::new(3).no_requirement()),
        TestUnit::new("ocean", UnitSpec::new(-2).no_requirement()),
        TestUnit::new("plains", UnitSpec::new(0).no_requirement()),
        TestUnit::new("river", UnitSpec::new(1).no_requirement()),
        TestUnit::new("delta", UnitSpec::new(0).no_requirement()),
    ]);
    let mut events = pipeline.subscribe();

    pipeline.register(8).unwrap();
    assert_eq!(
        pipeline.tiers(),
        vec![
            (-2, vec!["ocean"]),
            (0, vec!["plains", "delta"]),
            (1, vec!["river"]),
            (3, vec!["ridge"]),
        ]
    );
    assert_eq!(pipeline.start().unwrap(), 5);
    pipeline.wait_for_completion_timeout(DEADLINE).await.unwrap();

    let mut dispatched = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), events.next()).await {
        match event {
            PipelineEvent::UnitDispatched { unit, priority } => dispatched.push((unit, priority)),
            PipelineEvent::RunFinished { .. } => break,
            _ => {}
        }
    }

    assert_eq!(
        dispatched,
        vec![
            ("ocean".to_string(), -2),
            ("plains".to_string(), 0),
            ("delta".to_string(), 0),
            ("river".to_string(), 1),
            ("ridge".to_string(), 3),
        ]
    );
}

#[tokio::test]
async fn test_configured_timeout_bounds_the_wait() {
    let config = PipelineConfig::from_yaml_str("seed: 11\ncompletion_timeout_ms: 100\n").unwrap();
    let catalog = catalog_of(vec![TestUnit::new("idle", UnitSpec::new(1).after(["ghost"]))]);
    let mut pipeline = Pipeline::with_config(catalog, config).unwrap();

    pipeline.register_configured().unwrap();
    assert_eq!(
        pipeline.diagnostics(),
        vec![DependencyIssue::UnknownPredecessor {
            unit: "idle",
            predecessor: "ghost"
        }]
    );
    pipeline.start().unwrap();

    let err = pipeline.wait_for_completion().await.unwrap_err();
    assert!(matches!(err, GenError::Timeout { timeout_ms: 100, .. }));
}

#[tokio::test]
async fn test_lifecycle_misuse() {
    let mut pipeline = pipeline_of(abc());
    assert!(matches!(pipeline.start(), Err(GenError::Lifecycle { .. })));

    pipeline.register(1).unwrap();
    pipeline.start().unwrap();
    assert!(matches!(pipeline.start(), Err(GenError::Lifecycle { .. })));

    pipeline.wait_for_completion_timeout(DEADLINE).await.unwrap();
    assert!(matches!(pipeline.register(1), Err(GenError::Lifecycle { .. })));
    assert!(matches!(pipeline.start(), Err(GenError::Lifecycle { .. })));
}
