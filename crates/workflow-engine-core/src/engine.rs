/*!
# Engine

The orchestrator: admits workflows, walks each one's dependency levels
dispatching stages through the `WorkerPool`, and exposes the control
surface (`pause`/`resume`/`stop`/status queries). Grounded on
`WorkflowEngine`'s admission-plus-status-map pattern in the workflow
extension this crate grew out of, generalized from a single
linear-order executor to a level-by-level model.
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::action::ActionRegistry;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventBusHandle};
use crate::graph::DependencyGraph;
use crate::instance::{
    EventType, StageStatus, WorkflowEvent, WorkflowInstance, WorkflowState,
};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::persistence::{PersistenceManager, StageSnapshot, WorkflowSnapshot};
use crate::pool::WorkerPool;
use crate::stage_executor::{StageExecutor, StageOutcome};
use crate::state::StateManager;
use crate::types::{StageDefinition, WorkflowDefinition};

/// A point-in-time view of a running or finished workflow, returned by
/// `Engine::get_workflow_status`.
#[derive(Debug, Clone)]
pub struct WorkflowStatus {
    pub id: String,
    pub name: String,
    pub state: WorkflowState,
    pub progress: f64,
    pub current_stage: usize,
    pub last_error: Option<String>,
}

/// The orchestration engine. Cheap to clone: everything it owns is
/// behind an `Arc`, so handing a clone to a CLI or a test is the normal
/// way to interact with a running engine.
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    instances: Arc<RwLock<HashMap<String, Arc<WorkflowInstance>>>>,
    admission: Arc<Semaphore>,
    pool: Arc<WorkerPool>,
    event_bus: Arc<EventBus>,
    pub events: EventBusHandle,
    pub state: StateManager,
    metrics: MetricsCollector,
    persistence: Arc<PersistenceManager>,
    actions: ActionRegistry,
    cancel: CancellationToken,
    background: Arc<RwLock<Vec<JoinHandle<()>>>>,
}

impl Engine {
    pub async fn new(config: EngineConfig) -> Self {
        let (event_bus, events) = EventBus::new(config.event_bus_buffer_size);
        let actions = ActionRegistry::with_builtins().await;
        let engine = Self {
            admission: Arc::new(Semaphore::new(config.max_concurrent_workflows.max(1))),
            pool: Arc::new(WorkerPool::new(config.worker_pool_capacity)),
            event_bus: Arc::new(event_bus),
            events,
            state: StateManager::new(),
            metrics: MetricsCollector::new(),
            persistence: Arc::new(PersistenceManager::new(config.storage_dir.clone())),
            actions,
            cancel: CancellationToken::new(),
            background: Arc::new(RwLock::new(Vec::new())),
            instances: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        };

        engine.spawn_background_tasks().await;
        engine
    }

    /// The health monitor is the out-of-band half of §5's timeout model and
    /// always runs, unconditionally; only the metrics-sampling task is
    /// gated on `config.enable_metrics` (§4.6: "(60 s tick, if enabled)"
    /// names the metrics collector, not the health monitor).
    async fn spawn_background_tasks(&self) {
        let mut background = self.background.write().await;

        if self.config.enable_metrics {
            let metrics = self.metrics.clone();
            let instances = self.instances.clone();
            let interval = self.config.metrics_interval;
            let cancel = self.cancel.clone();
            background.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            let active = instances.read().await.len();
                            metrics.set_gauge("active_workflows", active as f64).await;
                            metrics.set_gauge("last_update", chrono::Utc::now().timestamp() as f64).await;
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            }));
        }

        let interval = self.config.health_check_interval;
        let cancel = self.cancel.clone();
        let engine = self.clone();
        background.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => engine.run_health_check().await,
                    _ = cancel.cancelled() => break,
                }
            }
        }));
    }

    /// Out-of-band enforcement of the workflow and stage timeout layers
    /// (§5): a workflow running past its overall timeout is aborted and
    /// its context cancelled; a stage still running past its own timeout
    /// is failed with a timeout error. The level loop's own
    /// `tokio::time::timeout` around each action handler call is the
    /// in-band layer; this is the backstop for anything that slips past
    /// it (a handler that ignores cancellation, a clock skew between
    /// when a level started and when a stage inside it actually began).
    async fn run_health_check(&self) {
        let snapshot: Vec<Arc<WorkflowInstance>> = self.instances.read().await.values().cloned().collect();
        for instance in snapshot {
            let state = instance.state.read().await.state;
            if state != WorkflowState::Running {
                continue;
            }

            if let Some(started_at) = instance.state.read().await.started_at {
                let elapsed = chrono::Utc::now().signed_duration_since(started_at);
                if elapsed.to_std().unwrap_or_default() > instance.timeout {
                    warn!(workflow_id = %instance.id, "workflow exceeded its timeout; aborting");
                    instance.cancel.cancel();
                    if let Err(e) = self.transition_workflow(&instance, WorkflowState::Aborted).await {
                        error!(workflow_id = %instance.id, error = %e, "failed to abort timed-out workflow");
                    }
                    instance.state.write().await.ended_at = Some(chrono::Utc::now());
                    continue;
                }
            }

            let mut timed_out_stages = Vec::new();
            {
                let stages = instance.stages.read().await;
                for stage in stages.iter() {
                    if stage.status != StageStatus::Running {
                        continue;
                    }
                    let Some(started_at) = stage.started_at else { continue };
                    let stage_timeout = stage
                        .definition
                        .timeout
                        .unwrap_or(self.config.default_stage_timeout);
                    let elapsed = chrono::Utc::now().signed_duration_since(started_at);
                    if elapsed.to_std().unwrap_or_default() > stage_timeout {
                        timed_out_stages.push(stage.name().to_string());
                    }
                }
            }

            for stage_name in timed_out_stages {
                warn!(workflow_id = %instance.id, stage = %stage_name, "stage exceeded its timeout; failing");
                self.record_stage_result(
                    &instance,
                    &stage_name,
                    StageStatus::Failed,
                    None,
                    Some("stage exceeded its timeout".to_string()),
                    0,
                )
                .await;
                self.emit(
                    &instance,
                    WorkflowEvent::new(EventType::StageFailed, instance.id.clone())
                        .with_stage(stage_name.clone())
                        .with_data("error", serde_json::json!("timeout")),
                )
                .await;
            }
        }
    }

    pub fn action_registry(&self) -> &ActionRegistry {
        &self.actions
    }

    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot().await
    }

    /// Admits and begins executing a new workflow, returning its id
    /// immediately; execution happens on a spawned task.
    pub async fn start_workflow(
        &self,
        definition: WorkflowDefinition,
        variables: HashMap<String, serde_json::Value>,
    ) -> EngineResult<String> {
        let graph = DependencyGraph::new(&definition.dependency_map())?;
        let levels = graph.execution_order()?;

        let permit = self
            .admission
            .clone()
            .try_acquire_owned()
            .map_err(|_| EngineError::Overcapacity {
                running: self.config.max_concurrent_workflows - self.admission.available_permits(),
                max: self.config.max_concurrent_workflows,
            })?;

        let timeout = if definition.timeouts.workflow.is_zero() {
            self.config.default_workflow_timeout
        } else {
            definition.timeouts.workflow
        };
        let definition = Arc::new(definition);
        let instance = Arc::new(WorkflowInstance::new(
            definition.clone(),
            variables,
            timeout,
            &self.cancel,
        ));
        let workflow_id = instance.id.clone();

        self.instances
            .write()
            .await
            .insert(workflow_id.clone(), instance.clone());

        let engine = self.clone();
        let instance_for_task = instance.clone();
        tokio::spawn(async move {
            let _permit = permit;
            engine.run_workflow(instance_for_task, levels).await;
        });

        Ok(workflow_id)
    }

    /// Runs a single stage to completion: condition check, pool
    /// acquisition, the Running transition and its event, and the
    /// action itself. Shared by both the concurrent and sequential
    /// level-dispatch paths in `run_workflow` so neither duplicates the
    /// FSM bookkeeping around it.
    async fn run_stage(
        &self,
        instance: &Arc<WorkflowInstance>,
        stage_executor: &StageExecutor,
        stage_def: StageDefinition,
    ) -> (String, EngineResult<StageOutcome>) {
        let cancel = instance.cancel.clone();
        let variables = instance.state.read().await.variables.clone();

        // Conditions are decided before the stage is ever marked
        // Running: the FSM only allows Skipped from
        // Pending/WaitingForDependencies, so a skip must not pass
        // through Running first.
        if !stage_executor.conditions_satisfied(&stage_def, &variables).await {
            self.set_stage_status(instance, &stage_def.name, StageStatus::Skipped).await;
            return (
                stage_def.name.clone(),
                Ok(StageOutcome {
                    output: None,
                    skipped: true,
                    retry_count: 0,
                }),
            );
        }

        let slot = match self.pool.acquire(&cancel).await {
            Ok(slot) => slot,
            Err(e) => return (stage_name_owned(&stage_def.name), Err(e)),
        };
        self.set_stage_status(instance, &stage_def.name, StageStatus::Running).await;
        self.emit(
            instance,
            WorkflowEvent::new(EventType::StageStarted, instance.id.clone()).with_stage(stage_def.name.clone()),
        )
        .await;

        let result = stage_executor.run_action(&stage_def, &variables, &cancel).await;
        drop(slot);
        (stage_def.name.clone(), result)
    }

    async fn run_workflow(&self, instance: Arc<WorkflowInstance>, levels: Vec<Vec<String>>) {
        if let Err(e) = self.transition_workflow(&instance, WorkflowState::Running).await {
            error!(workflow_id = %instance.id, error = %e, "failed to start workflow");
            return;
        }
        instance.state.write().await.started_at = Some(chrono::Utc::now());
        self.emit(&instance, WorkflowEvent::new(EventType::WorkflowStarted, instance.id.clone()))
            .await;
        self.metrics.incr_counter("workflows_started", 1).await;

        let stage_executor = StageExecutor::new(self.actions.clone(), self.config.default_stage_timeout);
        let mut workflow_failed = false;

        'levels: for (level_index, level) in levels.iter().enumerate() {
            self.wait_while_paused(&instance).await;
            if instance.cancel.is_cancelled() {
                workflow_failed = true;
                break;
            }
            instance.state.write().await.current_stage = level_index;

            // Per the level-dispatch rule: a level only runs its stages
            // concurrently through the worker pool when more than one
            // stage is present and at least one of them is marked
            // `parallel`; otherwise stages run one at a time so that
            // unmarked levels behave like a plain sequential pipeline.
            let runs_concurrently = level.len() > 1
                && level.iter().any(|name| {
                    instance
                        .definition
                        .get_stage(name)
                        .map(|s| s.parallel)
                        .unwrap_or(false)
                });

            let mut results = Vec::with_capacity(level.len());
            if runs_concurrently {
                let mut handles = Vec::new();
                for stage_name in level {
                    let Some(stage_def) = instance.definition.get_stage(stage_name).cloned() else {
                        continue;
                    };
                    let engine = self.clone();
                    let instance_ref = instance.clone();
                    let stage_executor = stage_executor.clone();
                    handles.push(tokio::spawn(async move {
                        engine.run_stage(&instance_ref, &stage_executor, stage_def).await
                    }));
                }

                for handle in handles {
                    match handle.await {
                        Ok(result) => results.push(result),
                        Err(join_err) => {
                            error!(workflow_id = %instance.id, error = %join_err, "stage task panicked");
                        }
                    }
                }
            } else {
                for stage_name in level {
                    let Some(stage_def) = instance.definition.get_stage(stage_name).cloned() else {
                        continue;
                    };
                    results.push(self.run_stage(&instance, &stage_executor, stage_def).await);
                }
            }

            for (stage_name, result) in results {
                match result {
                    Ok(outcome) => {
                        let status = if outcome.skipped {
                            StageStatus::Skipped
                        } else {
                            StageStatus::Completed
                        };
                        self.record_stage_result(&instance, &stage_name, status, outcome.output, None, outcome.retry_count)
                            .await;
                        let event_type = if outcome.skipped {
                            EventType::StageSkipped
                        } else {
                            EventType::StageCompleted
                        };
                        self.emit(
                            &instance,
                            WorkflowEvent::new(event_type, instance.id.clone()).with_stage(stage_name),
                        )
                        .await;
                    }
                    Err(e) => {
                        let optional = instance
                            .definition
                            .get_stage(&stage_name)
                            .map(|s| s.optional)
                            .unwrap_or(false);
                        self.record_stage_result(
                            &instance,
                            &stage_name,
                            StageStatus::Failed,
                            None,
                            Some(e.to_string()),
                            0,
                        )
                        .await;
                        self.emit(
                            &instance,
                            WorkflowEvent::new(EventType::StageFailed, instance.id.clone())
                                .with_stage(stage_name.clone())
                                .with_data("error", serde_json::json!(e.to_string())),
                        )
                        .await;

                        if !optional {
                            warn!(workflow_id = %instance.id, stage = %stage_name, error = %e, "stage failed; aborting workflow");
                            workflow_failed = true;
                            break 'levels;
                        }
                    }
                }
            }

            self.persist_snapshot(&instance).await;
        }

        let final_state = if instance.cancel.is_cancelled() {
            WorkflowState::Cancelled
        } else if workflow_failed {
            WorkflowState::Failed
        } else {
            WorkflowState::Completed
        };

        if let Err(e) = self.transition_workflow(&instance, final_state).await {
            error!(workflow_id = %instance.id, error = %e, "failed to finalize workflow state");
        }
        instance.state.write().await.ended_at = Some(chrono::Utc::now());

        let event_type = match final_state {
            WorkflowState::Completed => EventType::WorkflowCompleted,
            WorkflowState::Failed => EventType::WorkflowFailed,
            WorkflowState::Cancelled => EventType::WorkflowCancelled,
            _ => EventType::WorkflowCompleted,
        };
        self.emit(&instance, WorkflowEvent::new(event_type, instance.id.clone())).await;
        self.metrics
            .incr_counter(&format!("workflows_{}", final_state.as_str()), 1)
            .await;
        self.persist_snapshot(&instance).await;
    }

    async fn wait_while_paused(&self, instance: &Arc<WorkflowInstance>) {
        loop {
            let state = instance.state.read().await.state;
            if state != WorkflowState::Paused || instance.cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                _ = instance.cancel.cancelled() => break,
            }
        }
    }

    async fn set_stage_status(&self, instance: &Arc<WorkflowInstance>, name: &str, status: StageStatus) {
        let stage_id_and_from = {
            let stages = instance.stages.read().await;
            stages.iter().find(|s| s.name() == name).map(|s| (s.id.clone(), s.status))
        };
        let Some((stage_id, from)) = stage_id_and_from else { return };
        if let Err(e) = self.state.transition_stage(&stage_id, from, status).await {
            warn!(workflow_id = %instance.id, stage = name, error = %e, "stage transition rejected by FSM; leaving status unchanged");
            return;
        }
        let mut stages = instance.stages.write().await;
        if let Some(stage) = stages.iter_mut().find(|s| s.name() == name) {
            stage.status = status;
            if status == StageStatus::Running {
                stage.started_at = Some(chrono::Utc::now());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_stage_result(
        &self,
        instance: &Arc<WorkflowInstance>,
        name: &str,
        status: StageStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
        retry_count: usize,
    ) {
        let stage_id_and_from = {
            let stages = instance.stages.read().await;
            stages.iter().find(|s| s.name() == name).map(|s| (s.id.clone(), s.status))
        };
        let Some((stage_id, from)) = stage_id_and_from else { return };
        if let Err(e) = self.state.transition_stage(&stage_id, from, status).await {
            warn!(workflow_id = %instance.id, stage = name, error = %e, "stage transition rejected by FSM; leaving status unchanged");
            return;
        }
        let mut stages = instance.stages.write().await;
        if let Some(stage) = stages.iter_mut().find(|s| s.name() == name) {
            stage.status = status;
            stage.ended_at = Some(chrono::Utc::now());
            stage.output = output;
            stage.error = error.clone();
            stage.retry_count = retry_count;
            stage.progress = 1.0;
        }
        drop(stages);
        if let Some(error) = error {
            let mut state = instance.state.write().await;
            state.last_error = Some(error);
            state.error_count += 1;
        }
    }

    async fn transition_workflow(&self, instance: &Arc<WorkflowInstance>, to: WorkflowState) -> EngineResult<()> {
        let mut state = instance.state.write().await;
        let from = state.state;
        self.state.transition_workflow(&instance.id, from, to).await?;
        state.state = to;
        drop(state);
        self.emit(
            instance,
            WorkflowEvent::new(EventType::StateChanged, instance.id.clone())
                .with_data("to", serde_json::json!(to.as_str())),
        )
        .await;
        Ok(())
    }

    async fn emit(&self, instance: &Arc<WorkflowInstance>, event: WorkflowEvent) {
        instance.append_event(event.clone()).await;
        self.event_bus.publish(event).await;
    }

    async fn persist_snapshot(&self, instance: &Arc<WorkflowInstance>) {
        let state = instance.state.read().await;
        let stages = instance.stages.read().await;
        let snapshot = WorkflowSnapshot {
            workflow_id: instance.id.clone(),
            workflow_name: instance.definition.name.clone(),
            state: state.state,
            started_at: state.started_at,
            ended_at: state.ended_at,
            progress: if stages.is_empty() {
                1.0
            } else {
                stages.iter().filter(|s| s.status.satisfies_dependency()).count() as f64
                    / stages.len() as f64
            },
            stages: stages
                .iter()
                .map(|s| StageSnapshot {
                    name: s.name().to_string(),
                    status: s.status,
                    retry_count: s.retry_count,
                    error: s.error.clone(),
                })
                .collect(),
            saved_at: chrono::Utc::now(),
        };
        drop(state);
        drop(stages);

        if let Err(e) = self.persistence.save(&snapshot).await {
            warn!(workflow_id = %instance.id, error = %e, "snapshot save failed; continuing without persistence");
        }
    }

    pub async fn get_workflow_status(&self, id: &str) -> EngineResult<WorkflowStatus> {
        let instances = self.instances.read().await;
        let instance = instances.get(id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        let state = instance.state.read().await;
        Ok(WorkflowStatus {
            id: instance.id.clone(),
            name: instance.definition.name.clone(),
            state: state.state,
            progress: instance.progress().await,
            current_stage: state.current_stage,
            last_error: state.last_error.clone(),
        })
    }

    pub async fn list_active_workflows(&self) -> Vec<String> {
        let instances = self.instances.read().await;
        let mut ids = Vec::new();
        for (id, instance) in instances.iter() {
            if !instance.state.read().await.state.is_terminal() {
                ids.push(id.clone());
            }
        }
        ids
    }

    pub async fn pause(&self, id: &str) -> EngineResult<()> {
        let instance = self.find(id).await?;
        self.transition_workflow(&instance, WorkflowState::Paused).await?;
        self.emit(&instance, WorkflowEvent::new(EventType::WorkflowPaused, id.to_string())).await;
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> EngineResult<()> {
        let instance = self.find(id).await?;
        let current = instance.state.read().await.state;
        if current != WorkflowState::Paused {
            return Err(EngineError::WorkflowNotPaused(id.to_string()));
        }
        self.transition_workflow(&instance, WorkflowState::Running).await?;
        self.emit(&instance, WorkflowEvent::new(EventType::WorkflowResumed, id.to_string())).await;
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> EngineResult<()> {
        let instance = self.find(id).await?;
        instance.cancel.cancel();
        self.emit(&instance, WorkflowEvent::new(EventType::WorkflowStopped, id.to_string())).await;
        Ok(())
    }

    async fn find(&self, id: &str) -> EngineResult<Arc<WorkflowInstance>> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Cancels all running workflows and waits (up to `shutdown_timeout`)
    /// for in-flight stages to release their worker-pool slots.
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.cancel.cancel();
        for handle in self.background.write().await.drain(..) {
            let _ = handle.await;
        }
        self.pool.shutdown_with_timeout(self.config.shutdown_timeout).await
    }
}

fn stage_name_owned(name: &str) -> String {
    name.to_string()
}
