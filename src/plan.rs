//! Raw plans as produced by an upstream planner.
//!
//! Nothing here is trusted: ids may collide, dependencies may dangle and
//! the graph may contain cycles. `Mission::from_plan` only reshapes the
//! data; the validator decides whether it may run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A task graph submitted for validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPlan {
    /// Optional caller-chosen mission id (UUID); generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub objective: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub tasks: Vec<RawTask>,
}

/// One task descriptor inside a raw plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTask {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(alias = "tool_name")]
    pub tool: String,
    #[serde(default = "empty_args", alias = "tool_args")]
    pub args: Value,
    #[serde(default, alias = "dependencies")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub best_effort: bool,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn empty_args() -> Value {
    Value::Object(Default::default())
}

impl RawPlan {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            id: None,
            objective: objective.into(),
            metadata: BTreeMap::new(),
            tasks: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: RawTask) -> Self {
        self.tasks.push(task);
        self
    }

    /// Parse a plan from JSON text.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Parse a plan from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

impl RawTask {
    pub fn new(id: impl Into<String>, tool: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            tool: tool.into(),
            args,
            depends_on: Vec::new(),
            priority: 0,
            best_effort: false,
            max_attempts: None,
            timeout_ms: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}
