/*!
# Condition evaluation

Gates whether a stage runs once its dependencies are satisfied, grounded
on the `Condition`/`CompareOp` evaluator in the workflow extension this
engine grew out of, generalized to the closed `ConditionDescriptor` set
in [`crate::types`].
*/

use std::collections::HashMap;
use std::path::Path;

use tracing::warn;

use crate::types::{ConditionDescriptor, VariableOperator};

/// Evaluates every condition attached to a stage; a stage runs only if
/// all of them are true (conjunction, no short-circuit
/// side effects beyond `CommandSuccess` spawning a process).
pub async fn evaluate_all(
    conditions: &[ConditionDescriptor],
    variables: &HashMap<String, serde_json::Value>,
) -> bool {
    for condition in conditions {
        if !evaluate_one(condition, variables).await {
            return false;
        }
    }
    true
}

async fn evaluate_one(
    condition: &ConditionDescriptor,
    variables: &HashMap<String, serde_json::Value>,
) -> bool {
    match condition {
        ConditionDescriptor::Variable {
            variable,
            operator,
            value,
        } => {
            let actual = variables.get(variable).map(value_as_string);
            match (operator, actual) {
                (VariableOperator::Equals, Some(actual)) => &actual == value,
                (VariableOperator::NotEquals, Some(actual)) => &actual != value,
                (VariableOperator::NotEquals, None) => true,
                (VariableOperator::Contains, Some(actual)) => actual.contains(value.as_str()),
                _ => false,
            }
        }
        ConditionDescriptor::FileExists { path } => Path::new(path).is_file(),
        ConditionDescriptor::CommandSuccess { command } => run_command(command).await,
        ConditionDescriptor::Expression { expression } => {
            // Reserved extension point (see type docs): falls back to the
            // truthiness of a same-named variable rather than parsing an
            // expression grammar.
            warn!(expression, "Expression condition has no parser; falling back to variable truthiness");
            variables
                .get(expression)
                .map(is_truthy)
                .unwrap_or(false)
        }
    }
}

fn value_as_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Null => false,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

async fn run_command(command: &str) -> bool {
    tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .kill_on_drop(true)
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn variable_equals_matches_stringified_value() {
        let condition = ConditionDescriptor::Variable {
            variable: "env".into(),
            operator: VariableOperator::Equals,
            value: "prod".into(),
        };
        let variables = vars(&[("env", serde_json::json!("prod"))]);
        assert!(evaluate_one(&condition, &variables).await);
    }

    #[tokio::test]
    async fn variable_not_equals_true_when_missing() {
        let condition = ConditionDescriptor::Variable {
            variable: "missing".into(),
            operator: VariableOperator::NotEquals,
            value: "x".into(),
        };
        assert!(evaluate_one(&condition, &HashMap::new()).await);
    }

    #[tokio::test]
    async fn variable_contains_checks_substring() {
        let condition = ConditionDescriptor::Variable {
            variable: "branch".into(),
            operator: VariableOperator::Contains,
            value: "release".into(),
        };
        let variables = vars(&[("branch", serde_json::json!("release/1.0"))]);
        assert!(evaluate_one(&condition, &variables).await);
    }

    #[tokio::test]
    async fn file_exists_checks_real_path() {
        let condition = ConditionDescriptor::FileExists {
            path: "/nonexistent/path/for/sure".into(),
        };
        assert!(!evaluate_one(&condition, &HashMap::new()).await);
    }

    #[tokio::test]
    async fn command_success_reflects_exit_code() {
        let ok = ConditionDescriptor::CommandSuccess {
            command: "true".into(),
        };
        let fail = ConditionDescriptor::CommandSuccess {
            command: "false".into(),
        };
        assert!(evaluate_one(&ok, &HashMap::new()).await);
        assert!(!evaluate_one(&fail, &HashMap::new()).await);
    }

    #[tokio::test]
    async fn evaluate_all_is_a_conjunction() {
        let conditions = vec![
            ConditionDescriptor::CommandSuccess { command: "true".into() },
            ConditionDescriptor::CommandSuccess { command: "false".into() },
        ];
        assert!(!evaluate_all(&conditions, &HashMap::new()).await);
    }
}
