/*!
# Workflow definition types

The immutable template a `WorkflowInstance` is created from. Grounded on
`WorkflowConfig`/`TaskConfig` of the workflow extension this crate grew out
of, generalized to closed action/condition tag sets.
*/

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Declared variable slot on a `WorkflowDefinition`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDeclaration {
    pub name: String,
    pub var_type: String,
    pub default: Option<serde_json::Value>,
    pub required: bool,
}

/// Timeout configuration at the workflow/stage/action layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub workflow: Duration,
    pub stage: Duration,
    pub action: Duration,
}

/// A trigger descriptor (the engine stores these but does not act on them;
/// scheduling external triggers is a collaborator's concern).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDescriptor {
    pub name: String,
    pub kind: String,
    pub config: serde_json::Value,
}

/// Retry policy for a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// If non-empty, only errors whose message matches one of these
    /// substrings are retried; empty means "retry unconditionally".
    pub conditions: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            conditions: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (1-indexed), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32 - 1);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Whether an error is eligible for retry under this policy. Each
    /// condition is tried as a regex pattern first (so callers can write
    /// `"^timeout:"` or `"5\\d\\d$"`); a condition that fails to compile as
    /// a regex falls back to a plain substring match rather than being
    /// silently ignored.
    pub fn matches(&self, error: &str) -> bool {
        self.conditions.is_empty()
            || self.conditions.iter().any(|c| match Regex::new(c) {
                Ok(re) => re.is_match(error),
                Err(_) => error.contains(c.as_str()),
            })
    }
}

/// Closed set of action types a stage can perform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ActionDescriptor {
    Command {
        command: String,
    },
    Script {
        body: String,
    },
    Function {
        function_name: String,
        #[serde(default)]
        parameters: HashMap<String, serde_json::Value>,
    },
    Http {
        url: String,
        method: String,
        #[serde(default)]
        body: Option<serde_json::Value>,
    },
    ExternalModel {
        model: String,
        #[serde(default)]
        parameters: HashMap<String, serde_json::Value>,
    },
    GitOperation {
        operation: String,
        #[serde(default)]
        parameters: HashMap<String, serde_json::Value>,
    },
    FileOperation {
        operation: String,
        path: String,
    },
    /// User-registered extension: the handler is looked up by this tag.
    Custom {
        action_type: String,
        #[serde(default)]
        parameters: HashMap<String, serde_json::Value>,
    },
}

impl ActionDescriptor {
    /// The tag used to look up a handler in the `ActionHandler` registry.
    pub fn type_tag(&self) -> &str {
        match self {
            Self::Command { .. } => "command",
            Self::Script { .. } => "script",
            Self::Function { .. } => "function",
            Self::Http { .. } => "http",
            Self::ExternalModel { .. } => "external_model",
            Self::GitOperation { .. } => "git_operation",
            Self::FileOperation { .. } => "file_operation",
            Self::Custom { action_type, .. } => action_type.as_str(),
        }
    }
}

/// Closed set of condition kinds gating a stage's execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ConditionDescriptor {
    /// Compare a workflow variable against a literal.
    Variable {
        variable: String,
        operator: VariableOperator,
        value: String,
    },
    /// True iff `path` exists as a regular file.
    FileExists { path: String },
    /// True iff running `command` through a shell exits 0.
    CommandSuccess { command: String },
    /// Reserved extension point: a boolean-returning mini-expression.
    /// Unimplemented beyond truthiness of the named variable (documented
    /// here); never fabricates richer semantics.
    Expression { expression: String },
}

/// Operators supported by the `Variable` condition kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VariableOperator {
    Equals,
    NotEquals,
    Contains,
}

/// Stage type tag: whether a stage runs a single action, or is a
/// grouping marker for sequential/parallel siblings at the same level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Action,
    Parallel,
    Sequential,
}

/// Immutable definition of a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub kind: StageKind,
    pub action: ActionDescriptor,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<ConditionDescriptor>,
    pub timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, action: ActionDescriptor) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Action,
            action,
            dependencies: Vec::new(),
            conditions: Vec::new(),
            timeout: None,
            retry_policy: None,
            parallel: false,
            optional: false,
            metadata: HashMap::new(),
        }
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_condition(mut self, condition: ConditionDescriptor) -> Self {
        self.conditions.push(condition);
        self
    }
}

/// Immutable template a `WorkflowInstance` is created from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: String,
    pub description: String,
    pub stages: Vec<StageDefinition>,
    #[serde(default)]
    pub variables: Vec<VariableDeclaration>,
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub default_retry_policy: RetryPolicy,
    #[serde(default)]
    pub triggers: Vec<TriggerDescriptor>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            description: String::new(),
            stages: Vec::new(),
            variables: Vec::new(),
            timeouts: TimeoutConfig {
                workflow: Duration::from_secs(60 * 60),
                stage: Duration::from_secs(5 * 60),
                action: Duration::from_secs(5 * 60),
            },
            default_retry_policy: RetryPolicy::default(),
            triggers: Vec::new(),
        }
    }

    pub fn with_stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    /// Dependency map used to build a `DependencyGraph`: stage name -> prerequisite names.
    pub fn dependency_map(&self) -> HashMap<String, Vec<String>> {
        self.stages
            .iter()
            .map(|s| (s.name.clone(), s.dependencies.clone()))
            .collect()
    }

    pub fn get_stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_caps_at_max() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(30),
            multiplier: 2.0,
            conditions: vec![],
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(30));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(30));
    }

    #[test]
    fn retry_matches_empty_conditions_unconditionally() {
        let policy = RetryPolicy::default();
        assert!(policy.matches("anything at all"));
    }

    #[test]
    fn retry_matches_named_condition_only() {
        let policy = RetryPolicy {
            conditions: vec!["timeout".to_string()],
            ..RetryPolicy::default()
        };
        assert!(policy.matches("operation timeout exceeded"));
        assert!(!policy.matches("permission denied"));
    }

    #[test]
    fn retry_matches_regex_pattern() {
        let policy = RetryPolicy {
            conditions: vec![r"^(502|503|504):".to_string()],
            ..RetryPolicy::default()
        };
        assert!(policy.matches("503: service unavailable"));
        assert!(!policy.matches("permission denied"));
        assert!(!policy.matches("got a 503: mid-string, not anchored"));
    }

    #[test]
    fn retry_matches_falls_back_to_substring_on_bad_pattern() {
        let policy = RetryPolicy {
            conditions: vec!["(unclosed".to_string()],
            ..RetryPolicy::default()
        };
        assert!(policy.matches("error: (unclosed bracket"));
        assert!(!policy.matches("unrelated error"));
    }

    #[test]
    fn action_type_tag() {
        let action = ActionDescriptor::Command {
            command: "echo hi".to_string(),
        };
        assert_eq!(action.type_tag(), "command");
    }

    #[test]
    fn dependency_map_reflects_stage_deps() {
        let def = WorkflowDefinition::new("wf")
            .with_stage(StageDefinition::new(
                "a",
                ActionDescriptor::Command {
                    command: "true".into(),
                },
            ))
            .with_stage(
                StageDefinition::new(
                    "b",
                    ActionDescriptor::Command {
                        command: "true".into(),
                    },
                )
                .depends_on("a"),
            );

        let map = def.dependency_map();
        assert_eq!(map.get("b").unwrap(), &vec!["a".to_string()]);
        assert!(map.get("a").unwrap().is_empty());
    }
}
