/*!
# Stage executor

Runs a single stage to completion: checks conditions, dispatches the
action through the `ActionRegistry` under a timeout, and retries with
exponential backoff on failure. Grounded on
`Task::execute`/`WorkflowEngine::execute_with_retry` in the workflow
extension this engine grew out of.
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::action::ActionRegistry;
use crate::conditions::evaluate_all;
use crate::error::{EngineError, EngineResult};
use crate::types::StageDefinition;

pub struct StageOutcome {
    pub output: Option<serde_json::Value>,
    pub skipped: bool,
    pub retry_count: usize,
}

/// Executes one stage. Stateless: every piece of mutable bookkeeping
/// (status, timestamps, retry_count) is the caller's (`Engine`)
/// responsibility to record from the returned `StageOutcome` or error.
#[derive(Clone)]
pub struct StageExecutor {
    registry: ActionRegistry,
    default_stage_timeout: Duration,
}

impl StageExecutor {
    pub fn new(registry: ActionRegistry, default_stage_timeout: Duration) -> Self {
        Self {
            registry,
            default_stage_timeout,
        }
    }

    /// Evaluates `stage`'s conditions in definition order (a conjunction).
    /// Callers check this *before* transitioning a stage to `Running`:
    /// the FSM only allows `Skipped` from `Pending`/`WaitingForDependencies`,
    /// not from `Running`, so a skip must be decided before the stage is
    /// ever marked running.
    pub async fn conditions_satisfied(
        &self,
        stage: &StageDefinition,
        variables: &HashMap<String, serde_json::Value>,
    ) -> bool {
        evaluate_all(&stage.conditions, variables).await
    }

    /// Runs `stage` to completion: re-checks conditions (so this remains
    /// correct when called directly, e.g. from tests), then dispatches
    /// the action under a timeout and retries with backoff on failure.
    /// Returns `Ok(StageOutcome{skipped: true, ..})` when a condition is
    /// not satisfied (conditions gate execution, not an error).
    pub async fn run(
        &self,
        stage: &StageDefinition,
        variables: &HashMap<String, serde_json::Value>,
        cancel: &CancellationToken,
    ) -> EngineResult<StageOutcome> {
        if !self.conditions_satisfied(stage, variables).await {
            info!(stage = %stage.name, "stage conditions not satisfied; skipping");
            return Ok(StageOutcome {
                output: None,
                skipped: true,
                retry_count: 0,
            });
        }
        self.run_action(stage, variables, cancel).await
    }

    /// Dispatches `stage`'s action and retries on failure, assuming the
    /// caller has already confirmed its conditions are satisfied (the
    /// path `Engine` takes once a stage is marked `Running`).
    pub async fn run_action(
        &self,
        stage: &StageDefinition,
        variables: &HashMap<String, serde_json::Value>,
        cancel: &CancellationToken,
    ) -> EngineResult<StageOutcome> {
        let handler = self.registry.get(stage.action.type_tag()).await?;
        handler
            .validate(&stage.action)
            .map_err(|e| EngineError::ValidationFailed(e.to_string()))?;

        let timeout = stage.timeout.unwrap_or(self.default_stage_timeout);
        let policy = stage.retry_policy.clone().unwrap_or_default();

        let mut attempt = 1usize;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let result = tokio::select! {
                result = tokio::time::timeout(timeout, handler.execute(&stage.action, variables)) => result,
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            };

            match result {
                Ok(Ok(output)) => {
                    return Ok(StageOutcome {
                        output: Some(output),
                        skipped: false,
                        retry_count: attempt - 1,
                    });
                }
                Ok(Err(source)) => {
                    let message = source.to_string();
                    if attempt >= policy.max_attempts || !policy.matches(&message) {
                        return Err(EngineError::ActionFailed {
                            stage: stage.name.clone(),
                            source,
                        });
                    }
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        stage = %stage.name,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %message,
                        "stage failed; retrying after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(_elapsed) => {
                    return Err(EngineError::Timeout(timeout));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionHandler, CommandActionHandler};
    use crate::types::{ActionDescriptor, ConditionDescriptor, RetryPolicy, VariableOperator};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyHandler {
        failures_remaining: AtomicUsize,
    }

    #[async_trait]
    impl ActionHandler for FlakyHandler {
        async fn execute(
            &self,
            _action: &ActionDescriptor,
            _variables: &HashMap<String, serde_json::Value>,
        ) -> anyhow::Result<serde_json::Value> {
            if self.failures_remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
                anyhow::bail!("transient timeout");
            }
            Ok(serde_json::json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn runs_command_stage_successfully() {
        let registry = ActionRegistry::new();
        registry.register("command", Arc::new(CommandActionHandler)).await;
        let executor = StageExecutor::new(registry, Duration::from_secs(5));
        let stage = StageDefinition::new(
            "greet",
            ActionDescriptor::Command {
                command: "true".into(),
            },
        );
        let outcome = executor
            .run(&stage, &HashMap::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.skipped);
    }

    #[tokio::test]
    async fn unsatisfied_condition_skips_without_error() {
        let registry = ActionRegistry::new();
        registry.register("command", Arc::new(CommandActionHandler)).await;
        let executor = StageExecutor::new(registry, Duration::from_secs(5));
        let stage = StageDefinition::new(
            "conditional",
            ActionDescriptor::Command {
                command: "true".into(),
            },
        )
        .with_condition(ConditionDescriptor::Variable {
            variable: "run_it".into(),
            operator: VariableOperator::Equals,
            value: "yes".into(),
        });
        let outcome = executor
            .run(&stage, &HashMap::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.skipped);
    }

    #[tokio::test]
    async fn retries_until_success_within_max_attempts() {
        let registry = ActionRegistry::new();
        registry
            .register(
                "flaky",
                Arc::new(FlakyHandler {
                    failures_remaining: AtomicUsize::new(2),
                }),
            )
            .await;
        let executor = StageExecutor::new(registry, Duration::from_secs(5));
        let stage = StageDefinition::new(
            "flaky-stage",
            ActionDescriptor::Custom {
                action_type: "flaky".into(),
                parameters: HashMap::new(),
            },
        )
        .retry(RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 1.0,
            conditions: vec![],
        });
        let outcome = executor
            .run(&stage, &HashMap::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.retry_count, 2);
    }

    #[tokio::test]
    async fn exhausting_retries_surfaces_action_failed() {
        let registry = ActionRegistry::new();
        registry
            .register(
                "flaky",
                Arc::new(FlakyHandler {
                    failures_remaining: AtomicUsize::new(10),
                }),
            )
            .await;
        let executor = StageExecutor::new(registry, Duration::from_secs(5));
        let stage = StageDefinition::new(
            "flaky-stage",
            ActionDescriptor::Custom {
                action_type: "flaky".into(),
                parameters: HashMap::new(),
            },
        )
        .retry(RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 1.0,
            conditions: vec![],
        });
        let err = executor
            .run(&stage, &HashMap::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ActionFailed { .. }));
    }

    #[tokio::test]
    async fn missing_handler_returns_no_handler_error() {
        let registry = ActionRegistry::new();
        let executor = StageExecutor::new(registry, Duration::from_secs(5));
        let stage = StageDefinition::new(
            "lonely",
            ActionDescriptor::Custom {
                action_type: "nothing_registered".into(),
                parameters: HashMap::new(),
            },
        );
        let err = executor
            .run(&stage, &HashMap::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoHandler(_)));
    }
}
