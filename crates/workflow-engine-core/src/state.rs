/*!
# State machine validation

Two explicit transition tables, one per entity, grounded on the
`can_transition_to` match-based validator pattern used for execution
status in the pack's `meridian-workflow` state module. Each table is a
pure function from `(from, to)` to `bool` so `StateManager` and anyone
auditing the engine can reason about legal moves without chasing
runtime state.

`StateManager` layers listener dispatch on top of the pure transition
tables: per spec §4.4, listeners register by entity ID (empty string =
global) and are notified asynchronously, in spawned tasks isolated from
the transition that triggered them, the same isolate-and-spawn idiom
`events.rs` uses for subscriber fan-out. `validate_consistency` is the
separate cross-check helper spec §4.4 calls for — used by tests and
health checks, never on the hot transition path.
*/

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::instance::{StageStatus, WorkflowState};

/// Whether `from -> to` is a legal workflow-level transition.
pub fn can_transition_workflow(from: WorkflowState, to: WorkflowState) -> bool {
    use WorkflowState::*;
    matches!(
        (from, to),
        (Initializing, Running)
            | (Initializing, Failed)
            | (Initializing, Cancelled)
            | (Running, Paused)
            | (Running, WaitingForInput)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Running, Aborted)
            | (Paused, Running)
            | (Paused, Cancelled)
            | (Paused, Aborted)
            | (WaitingForInput, Running)
            | (WaitingForInput, Cancelled)
            | (WaitingForInput, Aborted)
            | (Failed, Running)
    )
}

/// Whether `from -> to` is a legal stage-level transition.
pub fn can_transition_stage(from: StageStatus, to: StageStatus) -> bool {
    use StageStatus::*;
    matches!(
        (from, to),
        (Pending, WaitingForDependencies)
            | (Pending, Running)
            | (Pending, Skipped)
            | (Pending, Cancelled)
            | (WaitingForDependencies, Running)
            | (WaitingForDependencies, Skipped)
            | (WaitingForDependencies, Cancelled)
            | (Running, WaitingForInput)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (WaitingForInput, Running)
            | (WaitingForInput, Cancelled)
            | (Failed, Running) // retry
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Workflow,
    Stage,
}

impl Entity {
    fn label(self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Stage => "stage",
        }
    }
}

/// Validates a transition and builds the error the engine's
/// `InvalidStateTransition` variant expects when one is illegal.
pub fn validate_workflow_transition(
    id: &str,
    from: WorkflowState,
    to: WorkflowState,
) -> Result<(), crate::error::EngineError> {
    if can_transition_workflow(from, to) {
        Ok(())
    } else {
        Err(crate::error::EngineError::InvalidStateTransition {
            entity: Entity::Workflow.label(),
            id: id.to_string(),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}

pub fn validate_stage_transition(
    id: &str,
    from: StageStatus,
    to: StageStatus,
) -> Result<(), crate::error::EngineError> {
    if can_transition_stage(from, to) {
        Ok(())
    } else {
        Err(crate::error::EngineError::InvalidStateTransition {
            entity: Entity::Stage.label(),
            id: id.to_string(),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}

/// Notified after a workflow-level transition has already been committed.
/// Implementations must not assume delivery order across transitions and
/// must not panic the process on a bad implementation; `StateManager`
/// isolates each call in its own spawned task the same way `EventBus`
/// isolates subscribers.
#[async_trait]
pub trait WorkflowTransitionListener: Send + Sync {
    async fn on_transition(&self, workflow_id: &str, from: WorkflowState, to: WorkflowState);
}

/// Notified after a stage-level transition has already been committed.
#[async_trait]
pub trait StageTransitionListener: Send + Sync {
    async fn on_transition(&self, stage_id: &str, from: StageStatus, to: StageStatus);
}

/// Key under which a listener is registered: a specific entity ID, or
/// the empty string for "every entity of this kind".
const GLOBAL: &str = "";

/// Owns the two transition tables plus listener registries keyed by
/// entity ID (spec §4.4: "empty string = global"). `Engine` calls
/// `transition_workflow`/`transition_stage` instead of the bare
/// `validate_*` functions directly whenever it wants listeners notified;
/// the bare functions remain for call sites (like the engine's own FSM
/// guard on `set_stage_status`) that only need the yes/no check.
#[derive(Clone, Default)]
pub struct StateManager {
    workflow_listeners: Arc<RwLock<HashMap<String, Vec<Arc<dyn WorkflowTransitionListener>>>>>,
    stage_listeners: Arc<RwLock<HashMap<String, Vec<Arc<dyn StageTransitionListener>>>>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// `entity_id = None` registers a global listener, notified for every
    /// workflow.
    pub async fn register_workflow_listener(
        &self,
        entity_id: Option<&str>,
        listener: Arc<dyn WorkflowTransitionListener>,
    ) {
        let key = entity_id.unwrap_or(GLOBAL).to_string();
        self.workflow_listeners.write().await.entry(key).or_default().push(listener);
    }

    pub async fn register_stage_listener(
        &self,
        entity_id: Option<&str>,
        listener: Arc<dyn StageTransitionListener>,
    ) {
        let key = entity_id.unwrap_or(GLOBAL).to_string();
        self.stage_listeners.write().await.entry(key).or_default().push(listener);
    }

    /// Validates the transition, then — only if it is legal — spawns an
    /// isolated notification task per matching listener (entity-specific
    /// and global). Returns the same error `validate_workflow_transition`
    /// would on an illegal move, without notifying anyone.
    pub async fn transition_workflow(
        &self,
        workflow_id: &str,
        from: WorkflowState,
        to: WorkflowState,
    ) -> Result<(), crate::error::EngineError> {
        validate_workflow_transition(workflow_id, from, to)?;
        let listeners = self.workflow_listeners.read().await;
        let matching: Vec<_> = listeners
            .get(workflow_id)
            .into_iter()
            .chain(listeners.get(GLOBAL))
            .flatten()
            .cloned()
            .collect();
        drop(listeners);
        for listener in matching {
            let workflow_id = workflow_id.to_string();
            tokio::spawn(async move {
                listener.on_transition(&workflow_id, from, to).await;
            });
        }
        Ok(())
    }

    pub async fn transition_stage(
        &self,
        stage_id: &str,
        from: StageStatus,
        to: StageStatus,
    ) -> Result<(), crate::error::EngineError> {
        validate_stage_transition(stage_id, from, to)?;
        let listeners = self.stage_listeners.read().await;
        let matching: Vec<_> = listeners
            .get(stage_id)
            .into_iter()
            .chain(listeners.get(GLOBAL))
            .flatten()
            .cloned()
            .collect();
        drop(listeners);
        for listener in matching {
            let stage_id = stage_id.to_string();
            tokio::spawn(async move {
                listener.on_transition(&stage_id, from, to).await;
            });
        }
        Ok(())
    }
}

/// Cross-checks a workflow's declared state against the statuses of its
/// stages, independent of how they got there. Encodes invariants I4–I6
/// from spec §3; intended for tests and health checks, not the hot
/// transition path (those already go through the FSM tables above, which
/// make most violations unreachable by construction).
pub fn validate_consistency(state: WorkflowState, stage_statuses: &[StageStatus]) -> Result<(), String> {
    if state.is_terminal() {
        // I4: every stage instance is itself in a terminal status.
        if let Some(bad) = stage_statuses.iter().find(|s| !s.is_terminal()) {
            return Err(format!(
                "workflow is in terminal state {:?} but a stage is still {:?}",
                state, bad
            ));
        }
    }

    if state == WorkflowState::Completed {
        // I5: every stage reached Completed or Skipped specifically.
        if let Some(bad) = stage_statuses
            .iter()
            .find(|s| !matches!(s, StageStatus::Completed | StageStatus::Skipped))
        {
            return Err(format!("workflow is Completed but a stage is {:?}", bad));
        }
    }

    if state == WorkflowState::Failed {
        // I6: at least one stage failed, and none are still running.
        if !stage_statuses.iter().any(|s| *s == StageStatus::Failed) {
            return Err("workflow is Failed but no stage is Failed".to_string());
        }
        if stage_statuses.iter().any(|s| *s == StageStatus::Running) {
            return Err("workflow is Failed but a stage is still Running".to_string());
        }
    }

    Ok(())
}
