//! End-to-end scenarios exercising the engine as a whole: admission,
//! scheduling, retries, and cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use workflow_engine_core::{
    ActionDescriptor, Engine, EngineConfig, EngineError, EventSubscriber, EventType, RetryPolicy,
    StageDefinition, WorkflowDefinition, WorkflowEvent, WorkflowState,
};

async fn engine_with(worker_pool_capacity: usize, max_concurrent_workflows: usize) -> (Engine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        storage_dir: dir.path().to_path_buf(),
        worker_pool_capacity,
        max_concurrent_workflows,
        enable_metrics: false,
        ..EngineConfig::default()
    };
    (Engine::new(config).await, dir)
}

/// Records the wall-clock span each stage spent `StageStarted..StageCompleted`
/// so a test can assert two stages actually overlapped rather than merely
/// finishing in an unspecified order.
#[derive(Clone, Default)]
struct StageSpans(Arc<Mutex<HashMap<String, (Option<Instant>, Option<Instant>)>>>);

impl StageSpans {
    async fn overlaps(&self, a: &str, b: &str) -> bool {
        let spans = self.0.lock().await;
        let Some((Some(a_start), Some(a_end))) = spans.get(a).copied() else {
            return false;
        };
        let Some((Some(b_start), Some(b_end))) = spans.get(b).copied() else {
            return false;
        };
        a_start < b_end && b_start < a_end
    }
}

#[async_trait]
impl EventSubscriber for StageSpans {
    async fn on_event(&self, event: WorkflowEvent) {
        let Some(stage_id) = event.stage_id else { return };
        let mut spans = self.0.lock().await;
        let entry = spans.entry(stage_id).or_insert((None, None));
        match event.event_type {
            EventType::StageStarted => entry.0 = Some(Instant::now()),
            EventType::StageCompleted => entry.1 = Some(Instant::now()),
            _ => {}
        }
    }

    fn interested_types(&self) -> Vec<EventType> {
        vec![EventType::StageStarted, EventType::StageCompleted]
    }

    fn name(&self) -> &str {
        "stage-spans"
    }
}

async fn wait_for_terminal(engine: &Engine, id: &str) -> WorkflowState {
    for _ in 0..100 {
        let status = engine.get_workflow_status(id).await.unwrap();
        if status.state.is_terminal() {
            return status.state;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("workflow {id} never reached a terminal state");
}

#[tokio::test]
async fn linear_pipeline_runs_stages_in_order() {
    let (engine, _dir) = engine_with(5, 5).await;
    let definition = WorkflowDefinition::new("linear-pipeline")
        .with_stage(StageDefinition::new(
            "fetch",
            ActionDescriptor::Command { command: "true".into() },
        ))
        .with_stage(
            StageDefinition::new("transform", ActionDescriptor::Command { command: "true".into() })
                .depends_on("fetch"),
        )
        .with_stage(
            StageDefinition::new("publish", ActionDescriptor::Command { command: "true".into() })
                .depends_on("transform"),
        );

    let id = engine.start_workflow(definition, HashMap::new()).await.unwrap();
    assert_eq!(wait_for_terminal(&engine, &id).await, WorkflowState::Completed);
}

#[tokio::test]
async fn diamond_dependency_allows_parallel_level() {
    let (engine, _dir) = engine_with(5, 5).await;
    let spans = StageSpans::default();
    engine.events.subscribe(Arc::new(spans.clone())).await;

    let definition = WorkflowDefinition::new("diamond")
        .with_stage(StageDefinition::new("start", ActionDescriptor::Command { command: "true".into() }))
        .with_stage(
            StageDefinition::new("left", ActionDescriptor::Command { command: "sleep 0.3".into() })
                .depends_on("start")
                .parallel(true),
        )
        .with_stage(
            StageDefinition::new("right", ActionDescriptor::Command { command: "sleep 0.3".into() })
                .depends_on("start")
                .parallel(true),
        )
        .with_stage(
            StageDefinition::new("join", ActionDescriptor::Command { command: "true".into() })
                .depends_on("left")
                .depends_on("right"),
        );

    let id = engine.start_workflow(definition, HashMap::new()).await.unwrap();
    assert_eq!(wait_for_terminal(&engine, &id).await, WorkflowState::Completed);
    assert!(
        spans.overlaps("left", "right").await,
        "left and right are both marked parallel and share a level; their stage spans should overlap"
    );
}

#[tokio::test]
async fn unmarked_level_runs_its_stages_sequentially() {
    let (engine, _dir) = engine_with(5, 5).await;
    let spans = StageSpans::default();
    engine.events.subscribe(Arc::new(spans.clone())).await;

    // "left" and "right" share a level (both depend only on "start") but
    // neither is marked parallel, so the engine must run them one at a
    // time rather than concurrently through the worker pool.
    let definition = WorkflowDefinition::new("sequential-level")
        .with_stage(StageDefinition::new("start", ActionDescriptor::Command { command: "true".into() }))
        .with_stage(
            StageDefinition::new("left", ActionDescriptor::Command { command: "sleep 0.3".into() })
                .depends_on("start"),
        )
        .with_stage(
            StageDefinition::new("right", ActionDescriptor::Command { command: "sleep 0.3".into() })
                .depends_on("start"),
        );

    let id = engine.start_workflow(definition, HashMap::new()).await.unwrap();
    assert_eq!(wait_for_terminal(&engine, &id).await, WorkflowState::Completed);
    assert!(
        !spans.overlaps("left", "right").await,
        "neither stage is marked parallel, so they must run one at a time"
    );
}

#[tokio::test]
async fn cyclic_workflow_is_rejected_before_it_starts() {
    let (engine, _dir) = engine_with(5, 5).await;
    let definition = WorkflowDefinition::new("cycle")
        .with_stage(StageDefinition::new("a", ActionDescriptor::Command { command: "true".into() }).depends_on("c"))
        .with_stage(StageDefinition::new("b", ActionDescriptor::Command { command: "true".into() }).depends_on("a"))
        .with_stage(StageDefinition::new("c", ActionDescriptor::Command { command: "true".into() }).depends_on("b"));

    let err = engine.start_workflow(definition, HashMap::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::CyclicDependency(_)));
}

#[tokio::test]
async fn stage_retries_then_succeeds() {
    let (engine, _dir) = engine_with(5, 5).await;
    // sh -c can't hold counters across attempts, so drive retry-then-succeed
    // through a command that fails the first time by checking a marker
    // file the shell itself creates, which is a realistic shape for
    // idempotent deploy scripts.
    let marker = tempfile::NamedTempFile::new().unwrap();
    let marker_path = marker.path().to_path_buf();
    std::fs::remove_file(&marker_path).unwrap();
    let command = format!(
        "test -f {path} || (touch {path} && exit 1)",
        path = marker_path.display()
    );

    let definition = WorkflowDefinition::new("retry-then-succeed").with_stage(
        StageDefinition::new("flaky", ActionDescriptor::Command { command })
            .retry(RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
                multiplier: 1.0,
                conditions: vec![],
            }),
    );

    let id = engine.start_workflow(definition, HashMap::new()).await.unwrap();
    assert_eq!(wait_for_terminal(&engine, &id).await, WorkflowState::Completed);
}

#[tokio::test]
async fn engine_rejects_submissions_past_capacity() {
    let (engine, _dir) = engine_with(5, 1).await;
    let slow = WorkflowDefinition::new("slow").with_stage(StageDefinition::new(
        "sleep",
        ActionDescriptor::Command { command: "sleep 2".into() },
    ));
    let _id = engine.start_workflow(slow, HashMap::new()).await.unwrap();

    let second = WorkflowDefinition::new("second").with_stage(StageDefinition::new(
        "noop",
        ActionDescriptor::Command { command: "true".into() },
    ));
    let err = engine.start_workflow(second, HashMap::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Overcapacity { .. }));
}

#[tokio::test]
async fn stopping_mid_stage_cancels_the_workflow() {
    let (engine, _dir) = engine_with(5, 5).await;
    let definition = WorkflowDefinition::new("cancel-me").with_stage(StageDefinition::new(
        "sleep",
        ActionDescriptor::Command { command: "sleep 5".into() },
    ));

    let id = engine.start_workflow(definition, HashMap::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.stop(&id).await.unwrap();
    assert_eq!(wait_for_terminal(&engine, &id).await, WorkflowState::Cancelled);
}
