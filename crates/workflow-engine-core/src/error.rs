//! Error taxonomy for the workflow engine.

use thiserror::Error;

/// All errors the engine can surface, grouped by the layer that raises them.
#[derive(Debug, Error)]
pub enum EngineError {
    // -- Admission errors --------------------------------------------------
    /// `MaxConcurrentWorkflows` has been reached.
    #[error("engine is at capacity: {running}/{max} workflows running")]
    Overcapacity { running: usize, max: usize },

    /// The submitted `WorkflowDefinition` is structurally invalid.
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// The stage dependency graph contains a cycle.
    #[error("cyclic dependency detected among stages: {0:?}")]
    CyclicDependency(Vec<String>),

    /// A stage depends on a name that is not declared anywhere in the workflow.
    #[error("stage '{stage}' depends on unresolved stage '{dependency}'")]
    UnresolvedDependency { stage: String, dependency: String },

    // -- State errors --------------------------------------------------------
    /// A transition was attempted that the FSM does not allow.
    #[error("invalid transition for {entity} '{id}': {from} -> {to}")]
    InvalidStateTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// No workflow or stage exists with the given id.
    #[error("not found: {0}")]
    NotFound(String),

    /// A control operation requires the workflow to be running.
    #[error("workflow '{0}' is not running")]
    WorkflowNotRunning(String),

    /// A control operation requires the workflow to be paused.
    #[error("workflow '{0}' is not paused")]
    WorkflowNotPaused(String),

    // -- Execution errors ------------------------------------------------
    /// No `ActionHandler` is registered for the action's type tag.
    #[error("no handler registered for action type '{0}'")]
    NoHandler(String),

    /// The handler rejected the action during its structural validation pass.
    #[error("action validation failed: {0}")]
    ValidationFailed(String),

    /// One or more prerequisite stages have not reached a satisfying status.
    #[error("dependencies not satisfied for stage '{0}'")]
    DependenciesNotSatisfied(String),

    /// The action handler's `execute` call returned an error.
    #[error("action failed for stage '{stage}': {source}")]
    ActionFailed {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    /// A stage or workflow exceeded its allotted time budget.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Execution was cancelled via a cancellation token.
    #[error("cancelled")]
    Cancelled,

    // -- Infrastructure errors --------------------------------------------
    /// The `WorkerPool` has no free capacity and is not shutting down.
    #[error("worker pool is full")]
    PoolFull,

    /// A persistence operation (save/load/delete/list) failed.
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    /// `Engine::shutdown` did not complete within its deadline.
    #[error("shutdown did not complete within the deadline")]
    ShutdownTimeout,
}

pub type EngineResult<T> = Result<T, EngineError>;
