/*!
# Action handlers

Dispatches a `StageDefinition`'s `ActionDescriptor` to whatever
implementation actually performs the work. Grounded on the
`WorkflowAction`/executor trait split an earlier iteration of this task
runner used: the trait shape (`validate` then `execute`) survives, the
binding to any particular external runtime does not.
*/

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::types::ActionDescriptor;

/// Implemented by anything capable of carrying out an `ActionDescriptor`.
/// Looked up in the `ActionRegistry` by `ActionDescriptor::type_tag`.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Structural validation before the stage is admitted to a level run
    /// (surfaced as `EngineError::ValidationFailed`). Default accepts everything.
    fn validate(&self, _action: &ActionDescriptor) -> EngineResult<()> {
        Ok(())
    }

    /// Performs the action, returning an opaque JSON result stored on the
    /// `StageInstance`. Errors surface as `EngineError::ActionFailed`.
    async fn execute(
        &self,
        action: &ActionDescriptor,
        variables: &HashMap<String, serde_json::Value>,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Maps an action's type tag to the handler that carries it out.
#[derive(Clone)]
pub struct ActionRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn ActionHandler>>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registry pre-populated with the built-in `command` and `function`
    /// handlers.
    pub async fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("command", Arc::new(CommandActionHandler)).await;
        registry
            .register("function", Arc::new(FunctionActionHandler::new()))
            .await;
        registry
    }

    pub async fn register(&self, type_tag: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.write().await.insert(type_tag.into(), handler);
    }

    pub async fn get(&self, type_tag: &str) -> EngineResult<Arc<dyn ActionHandler>> {
        self.handlers
            .read()
            .await
            .get(type_tag)
            .cloned()
            .ok_or_else(|| EngineError::NoHandler(type_tag.to_string()))
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `ActionDescriptor::Command` through a shell, treating a non-zero
/// exit as failure.
pub struct CommandActionHandler;

#[async_trait]
impl ActionHandler for CommandActionHandler {
    async fn execute(
        &self,
        action: &ActionDescriptor,
        _variables: &HashMap<String, serde_json::Value>,
    ) -> anyhow::Result<serde_json::Value> {
        let command = match action {
            ActionDescriptor::Command { command } => command,
            other => anyhow::bail!("CommandActionHandler cannot handle '{}'", other.type_tag()),
        };

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            anyhow::bail!(
                "command exited with status {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(serde_json::json!({
            "stdout": String::from_utf8_lossy(&output.stdout),
            "exit_code": output.status.code(),
        }))
    }
}

/// In-process function registry: user code registers closures under a
/// name and `ActionDescriptor::Function` dispatches to them by
/// `function_name`.
pub struct FunctionActionHandler {
    functions: RwLock<
        HashMap<
            String,
            Arc<
                dyn Fn(&HashMap<String, serde_json::Value>) -> anyhow::Result<serde_json::Value>
                    + Send
                    + Sync,
            >,
        >,
    >,
}

impl FunctionActionHandler {
    pub fn new() -> Self {
        Self {
            functions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register<F>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(&HashMap<String, serde_json::Value>) -> anyhow::Result<serde_json::Value>
            + Send
            + Sync
            + 'static,
    {
        self.functions.write().await.insert(name.into(), Arc::new(function));
    }
}

impl Default for FunctionActionHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionHandler for FunctionActionHandler {
    async fn execute(
        &self,
        action: &ActionDescriptor,
        variables: &HashMap<String, serde_json::Value>,
    ) -> anyhow::Result<serde_json::Value> {
        let (function_name, parameters) = match action {
            ActionDescriptor::Function {
                function_name,
                parameters,
            } => (function_name, parameters),
            other => anyhow::bail!("FunctionActionHandler cannot handle '{}'", other.type_tag()),
        };

        let function = self
            .functions
            .read()
            .await
            .get(function_name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no function registered under '{}'", function_name))?;

        let mut merged = variables.clone();
        merged.extend(parameters.clone());
        function(&merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_handler_captures_stdout() {
        let handler = CommandActionHandler;
        let action = ActionDescriptor::Command {
            command: "echo hello".to_string(),
        };
        let result = handler.execute(&action, &HashMap::new()).await.unwrap();
        assert!(result["stdout"].as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn command_handler_fails_on_nonzero_exit() {
        let handler = CommandActionHandler;
        let action = ActionDescriptor::Command {
            command: "exit 1".to_string(),
        };
        assert!(handler.execute(&action, &HashMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn function_handler_dispatches_by_name() {
        let handler = FunctionActionHandler::new();
        handler
            .register("double", |params| {
                let n = params.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(serde_json::json!({ "result": n * 2 }))
            })
            .await;

        let action = ActionDescriptor::Function {
            function_name: "double".to_string(),
            parameters: HashMap::from([("n".to_string(), serde_json::json!(21))]),
        };
        let result = handler.execute(&action, &HashMap::new()).await.unwrap();
        assert_eq!(result["result"], 42);
    }

    #[tokio::test]
    async fn function_handler_errors_on_unknown_name() {
        let handler = FunctionActionHandler::new();
        let action = ActionDescriptor::Function {
            function_name: "missing".to_string(),
            parameters: HashMap::new(),
        };
        assert!(handler.execute(&action, &HashMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn registry_resolves_registered_tag() {
        let registry = ActionRegistry::new();
        registry.register("command", Arc::new(CommandActionHandler)).await;
        assert!(registry.get("command").await.is_ok());
        assert!(matches!(
            registry.get("missing").await.unwrap_err(),
            EngineError::NoHandler(_)
        ));
    }
}
