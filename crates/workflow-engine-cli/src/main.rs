//! Command-line front end for the workflow engine: load a workflow
//! definition from JSON, run it to completion, and print lifecycle
//! events as they happen.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::info;
use workflow_engine_core::{
    Engine, EngineConfig, EventSubscriber, EventType, WorkflowDefinition, WorkflowEvent,
    WorkflowState,
};

#[derive(Parser)]
#[command(name = "workflow-engine", about = "Run and inspect DAG workflows")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition file without running it.
    Validate {
        /// Path to a JSON workflow definition.
        definition: PathBuf,
    },
    /// Run a workflow definition to completion and print its events.
    Run {
        /// Path to a JSON workflow definition.
        definition: PathBuf,
        /// Directory for persisted snapshots.
        #[arg(long, default_value = "./workflow_data")]
        storage_dir: PathBuf,
        /// Maximum stages running concurrently.
        #[arg(long, default_value_t = 5)]
        worker_capacity: usize,
        /// Initial workflow variables as key=value pairs (strings).
        #[arg(long = "var", value_parser = parse_key_val)]
        variables: Vec<(String, String)>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

struct StdoutSubscriber;

#[async_trait]
impl EventSubscriber for StdoutSubscriber {
    async fn on_event(&self, event: WorkflowEvent) {
        match event.stage_id {
            Some(stage_id) => println!("[{}] {} ({})", event.workflow_id, event.event_type.as_str(), stage_id),
            None => println!("[{}] {}", event.workflow_id, event.event_type.as_str()),
        }
    }

    fn interested_types(&self) -> Vec<EventType> {
        vec![
            EventType::WorkflowStarted,
            EventType::WorkflowCompleted,
            EventType::WorkflowFailed,
            EventType::WorkflowPaused,
            EventType::WorkflowResumed,
            EventType::WorkflowStopped,
            EventType::WorkflowCancelled,
            EventType::StageStarted,
            EventType::StageCompleted,
            EventType::StageFailed,
            EventType::StageSkipped,
            EventType::StageRetried,
        ]
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { definition } => {
            let definition = load_definition(&definition)?;
            let graph =
                workflow_engine_core::DependencyGraph::new(&definition.dependency_map())?;
            let levels = graph.execution_order()?;
            println!(
                "'{}' is valid: {} stages across {} levels",
                definition.name,
                graph.stage_count(),
                levels.len()
            );
            Ok(())
        }
        Command::Run {
            definition,
            storage_dir,
            worker_capacity,
            variables,
        } => run(definition, storage_dir, worker_capacity, variables).await,
    }
}

fn load_definition(path: &PathBuf) -> anyhow::Result<WorkflowDefinition> {
    let body = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&body)?)
}

async fn run(
    definition_path: PathBuf,
    storage_dir: PathBuf,
    worker_capacity: usize,
    variables: Vec<(String, String)>,
) -> anyhow::Result<()> {
    let definition = load_definition(&definition_path)?;
    let config = EngineConfig {
        storage_dir,
        worker_pool_capacity: worker_capacity,
        ..EngineConfig::default()
    };

    let engine = Engine::new(config).await;
    engine.events.subscribe(Arc::new(StdoutSubscriber)).await;

    let variables: HashMap<String, serde_json::Value> = variables
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect();

    let id = engine.start_workflow(definition, variables).await?;
    info!(workflow_id = %id, "workflow submitted");

    loop {
        let status = engine.get_workflow_status(&id).await?;
        if matches!(
            status.state,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled | WorkflowState::Aborted
        ) {
            println!(
                "workflow '{}' finished in state {:?} (progress {:.0}%)",
                status.name,
                status.state,
                status.progress * 100.0
            );
            engine.shutdown().await?;
            std::process::exit(if status.state == WorkflowState::Completed { 0 } else { 1 });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
