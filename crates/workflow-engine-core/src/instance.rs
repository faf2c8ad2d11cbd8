/*!
# Runtime instances

`WorkflowInstance` and `StageInstance` are the mutable runtime entities
described in the data model. Three sections are guarded by independent
`tokio::sync::RwLock`s (`state`, `stages`, `events`), always acquired in
that fixed order, mirroring the per-entity locking an earlier workflow
extension this engine grew out of kept on its own instance type.
Dependency "pointers" are represented as stage names resolved against
`WorkflowInstance::stages` rather than raw pointers, since Rust's
ownership model makes a name-indexed lookup both safer and just as
cheap as a pointer chase for this access pattern.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::types::{StageDefinition, WorkflowDefinition};

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generates a `workflow_<nanos>_<counter>` id.
pub fn next_workflow_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("workflow_{}_{}", nanos, counter)
}

/// Workflow-level state machine values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Initializing,
    Running,
    Paused,
    WaitingForInput,
    Completed,
    Failed,
    Cancelled,
    Aborted,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::WaitingForInput => "waiting_for_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Aborted => "aborted",
        }
    }
}

/// Stage-level state machine values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    WaitingForDependencies,
    Running,
    WaitingForInput,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Cancelled)
    }

    pub fn satisfies_dependency(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::WaitingForDependencies => "waiting_for_dependencies",
            Self::Running => "running",
            Self::WaitingForInput => "waiting_for_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A single unit of work bound to a `StageDefinition`.
#[derive(Debug, Clone)]
pub struct StageInstance {
    pub id: String,
    pub definition: Arc<StageDefinition>,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: usize,
    pub progress: f64,
    pub message: String,
    pub metadata: HashMap<String, serde_json::Value>,
    /// Names of prerequisite stages, resolved against the owning
    /// `WorkflowInstance`'s stage list.
    pub dependencies: Vec<String>,
}

impl StageInstance {
    pub fn new(workflow_id: &str, index: usize, definition: Arc<StageDefinition>) -> Self {
        let dependencies = definition.dependencies.clone();
        Self {
            id: format!("{}-stage-{}", workflow_id, index),
            definition,
            status: StageStatus::Pending,
            started_at: None,
            ended_at: None,
            output: None,
            error: None,
            retry_count: 0,
            progress: 0.0,
            message: String::new(),
            metadata: HashMap::new(),
            dependencies,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// Closed set of event types the `EventBus` can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowStopped,
    WorkflowCancelled,
    StageStarted,
    StageCompleted,
    StageFailed,
    StageSkipped,
    StageRetried,
    StateChanged,
    UserInputRequired,
    UserInputProvided,
    MetricsUpdated,
    ErrorOccurred,
    WarningIssued,
    ProgressUpdated,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow_started",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowFailed => "workflow_failed",
            Self::WorkflowPaused => "workflow_paused",
            Self::WorkflowResumed => "workflow_resumed",
            Self::WorkflowStopped => "workflow_stopped",
            Self::WorkflowCancelled => "workflow_cancelled",
            Self::StageStarted => "stage_started",
            Self::StageCompleted => "stage_completed",
            Self::StageFailed => "stage_failed",
            Self::StageSkipped => "stage_skipped",
            Self::StageRetried => "stage_retried",
            Self::StateChanged => "state_changed",
            Self::UserInputRequired => "user_input_required",
            Self::UserInputProvided => "user_input_provided",
            Self::MetricsUpdated => "metrics_updated",
            Self::ErrorOccurred => "error_occurred",
            Self::WarningIssued => "warning_issued",
            Self::ProgressUpdated => "progress_updated",
        }
    }
}

/// A single entry in a workflow's append-only event log. `id` has no
/// bearing on ordering or equality checks the engine performs itself; it
/// exists so a subscriber that persists events elsewhere (a log shipper,
/// a dedup cache) has a stable key, since spec §5 allows events from one
/// workflow to arrive out of order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub workflow_id: String,
    pub stage_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkflowEvent {
    pub fn new(event_type: EventType, workflow_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            workflow_id: workflow_id.into(),
            stage_id: None,
            timestamp: Utc::now(),
            data: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_stage(mut self, stage_id: impl Into<String>) -> Self {
        self.stage_id = Some(stage_id.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// Everything guarded by `WorkflowInstance::state`.
#[derive(Debug, Clone)]
pub struct WorkflowStateData {
    pub state: WorkflowState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub current_stage: usize,
    pub variables: HashMap<String, serde_json::Value>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub last_error: Option<String>,
    pub error_count: usize,
}

/// Mutable runtime entity created by `Engine::start_workflow`.
///
/// Ownership: only the owning execution task mutates `state`
/// and `stages`; the event log has its own lock so emitters and snapshot
/// readers never contend with the execution task. Always acquire
/// `state` -> `stages` -> `events` when more than one is needed.
pub struct WorkflowInstance {
    pub id: String,
    pub definition: Arc<WorkflowDefinition>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    pub state: RwLock<WorkflowStateData>,
    pub stages: RwLock<Vec<StageInstance>>,
    pub events: RwLock<Vec<WorkflowEvent>>,
}

impl WorkflowInstance {
    pub fn new(
        definition: Arc<WorkflowDefinition>,
        variables: HashMap<String, serde_json::Value>,
        timeout: Duration,
        parent_cancel: &CancellationToken,
    ) -> Self {
        let id = next_workflow_id();
        let stages = definition
            .stages
            .iter()
            .enumerate()
            .map(|(i, stage_def)| StageInstance::new(&id, i, Arc::new(stage_def.clone())))
            .collect();

        Self {
            id,
            definition,
            timeout,
            cancel: parent_cancel.child_token(),
            state: RwLock::new(WorkflowStateData {
                state: WorkflowState::Initializing,
                started_at: None,
                ended_at: None,
                current_stage: 0,
                variables,
                metadata: HashMap::new(),
                last_error: None,
                error_count: 0,
            }),
            stages: RwLock::new(stages),
            events: RwLock::new(Vec::new()),
        }
    }

    pub async fn append_event(&self, event: WorkflowEvent) {
        self.events.write().await.push(event);
    }

    /// Progress as `completed_or_skipped / total` (1.0 for an empty workflow).
    pub async fn progress(&self) -> f64 {
        let stages = self.stages.read().await;
        if stages.is_empty() {
            return 1.0;
        }
        let done = stages
            .iter()
            .filter(|s| matches!(s.status, StageStatus::Completed | StageStatus::Skipped))
            .count();
        done as f64 / stages.len() as f64
    }
}
