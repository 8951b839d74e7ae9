//! Per-attempt audit entries and task results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::task::TaskId;
use crate::tools::ErrorClass;

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    /// Rejected by an open circuit before the handler was called
    CircuitOpen,
}

/// Append-only audit entry written once per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_id: TaskId,
    /// 1-based, strictly increasing per task
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error_classification: Option<ErrorClass>,
    /// Full error text, kept for unclassifiable failures too
    pub error: Option<String>,
    pub latency_ms: u64,
}

/// Structured result of a successful tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub output: Value,
    /// Serialized size of the raw handler output
    pub size_bytes: usize,
    /// Whether `output` was cut down to the configured limit
    pub truncated: bool,
}
