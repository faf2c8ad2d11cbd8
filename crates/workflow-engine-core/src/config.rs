/*!
# Engine configuration

Every engine tunable lives here, in one
`serde`-derived struct with a `Default` impl, following the shape of
`WorkflowPluginConfig`/`ExecutionConfig` in the workflow extension this
engine grew out of.
*/

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of workflows the engine will run concurrently (I11).
    pub max_concurrent_workflows: usize,

    /// `WorkerPool` capacity: maximum concurrently running stages (I10).
    pub worker_pool_capacity: usize,

    /// `EventBus` internal channel capacity.
    pub event_bus_buffer_size: usize,

    /// Default workflow timeout, used when a definition doesn't set one.
    pub default_workflow_timeout: Duration,

    /// Default stage timeout, used when a stage definition doesn't set one.
    pub default_stage_timeout: Duration,

    /// Directory snapshots are written to.
    pub storage_dir: PathBuf,

    /// How long a persisted snapshot is kept before `cleanup_old` removes it.
    pub retention_days: u32,

    /// Whether the metrics-collector background task runs.
    pub enable_metrics: bool,

    /// Health-monitor tick interval.
    pub health_check_interval: Duration,

    /// Metrics-collector tick interval.
    pub metrics_interval: Duration,

    /// Deadline `Engine::shutdown` waits for in-flight work before failing.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 10,
            worker_pool_capacity: 5,
            event_bus_buffer_size: 256,
            default_workflow_timeout: Duration::from_secs(60 * 60),
            default_stage_timeout: Duration::from_secs(5 * 60),
            storage_dir: PathBuf::from("./workflow_data"),
            retention_days: 30,
            enable_metrics: true,
            health_check_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}
