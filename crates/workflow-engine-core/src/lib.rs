/*!
# Workflow Engine

A DAG-based workflow orchestration engine:

- **Dependency graphs**: stages declare their prerequisites; Kahn's
  algorithm turns that into levels of independently runnable work.
- **Bounded concurrency**: a semaphore-backed worker pool caps how many
  stages run at once across the whole engine.
- **Explicit state machines**: workflow and stage lifecycles are
  validated transition tables, not ad hoc flags.
- **Retry with backoff**: stages can declare a retry policy with
  exponential delay capped at a maximum.
- **Events and metrics**: a best-effort event bus fans lifecycle events
  out to subscribers; a metrics collector tracks counters and gauges.
- **Snapshot persistence**: workflow progress is written to JSON
  snapshots on a best-effort basis.

## Example

```rust,no_run
use workflow_engine_core::{Engine, EngineConfig, WorkflowDefinition, StageDefinition};
use workflow_engine_core::types::ActionDescriptor;
use std::collections::HashMap;

# async fn run() -> workflow_engine_core::error::EngineResult<()> {
let engine = Engine::new(EngineConfig::default()).await;

let workflow = WorkflowDefinition::new("deploy")
    .with_stage(StageDefinition::new("build", ActionDescriptor::Command {
        command: "echo building".to_string(),
    }))
    .with_stage(StageDefinition::new("deploy", ActionDescriptor::Command {
        command: "echo deploying".to_string(),
    }).depends_on("build"));

let id = engine.start_workflow(workflow, HashMap::new()).await?;
let status = engine.get_workflow_status(&id).await?;
println!("{:?}", status.state);
# Ok(())
# }
```
*/

pub mod action;
pub mod conditions;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod instance;
pub mod metrics;
pub mod persistence;
pub mod pool;
pub mod stage_executor;
pub mod state;
pub mod types;

pub use action::{ActionHandler, ActionRegistry, CommandActionHandler, FunctionActionHandler};
pub use config::EngineConfig;
pub use engine::{Engine, WorkflowStatus};
pub use error::{EngineError, EngineResult};
pub use events::{EventBus, EventBusHandle, EventSubscriber};
pub use graph::DependencyGraph;
pub use instance::{
    EventType, StageInstance, StageStatus, WorkflowEvent, WorkflowInstance, WorkflowState,
};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use persistence::{PersistenceManager, StageSnapshot, WorkflowSnapshot};
pub use pool::{WorkerPool, WorkerSlot};
pub use stage_executor::{StageExecutor, StageOutcome};
pub use state::{StageTransitionListener, StateManager, WorkflowTransitionListener};
pub use types::{
    ActionDescriptor, ConditionDescriptor, RetryPolicy, StageDefinition, StageKind,
    TimeoutConfig, TriggerDescriptor, VariableDeclaration, VariableOperator, WorkflowDefinition,
};
