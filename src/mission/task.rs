//! Task type and its state machine.
//!
//! # Invariants
//! - `id` is unique within its mission (checked once, by the validator)
//! - Status only moves forward, except `Running <-> Retrying`
//! - `records` is append-only and strictly ordered by `attempt_number`

use std::borrow::Borrow;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::record::{ExecutionRecord, TaskResult};

/// Identifier of a task, unique within one mission.
///
/// Task ids come from the planner, so they are free-form strings rather
/// than generated UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> Ready -> Running -> Succeeded
///    |         |        |  ^ \-> Failed
///    |         |        v  |       ^
///    |         |      Retrying ----+ (retry cut short by cancel)
///    |         |        |
///    +---------+--------+----> Skipped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies
    Pending,
    /// All dependencies satisfied, waiting for a worker
    Ready,
    /// An attempt is in progress
    Running,
    /// Waiting for a scheduled re-queue after a retryable failure
    Retrying,
    /// Finished successfully
    Succeeded,
    /// Finished unsuccessfully, retries exhausted or not allowed
    Failed,
    /// Never ran (upstream failure or cancellation)
    Skipped,
}

impl TaskStatus {
    /// `true` for Succeeded, Failed and Skipped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// `true` while the task still holds the mission open.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self -> to` is a legal edge of the state machine.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Retrying)
                | (Retrying, Running)
                | (Retrying, Failed)
                | (Retrying, Skipped)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Wall-clock milestones of a task, used for auditing ordering guarantees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskTimeline {
    pub ready_at: Option<DateTime<Utc>>,
    /// Start of the first attempt
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A single unit of work bound to exactly one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    description: String,
    tool_name: String,
    tool_args: Value,
    dependencies: Vec<TaskId>,
    status: TaskStatus,
    attempt_count: u32,
    max_attempts: u32,
    /// Attempts rejected by an open circuit; not counted in `attempt_count`
    circuit_deferrals: u32,
    timeout_ms: Option<u64>,
    last_error: Option<String>,
    result: Option<TaskResult>,
    priority: i32,
    best_effort: bool,
    records: Vec<ExecutionRecord>,
    timeline: TaskTimeline,
}

impl Task {
    /// Create a pending task.
    ///
    /// Duplicate dependency ids are collapsed, keeping first-declared order.
    pub fn new(
        id: impl Into<TaskId>,
        tool_name: impl Into<String>,
        tool_args: Value,
        dependencies: Vec<TaskId>,
    ) -> Self {
        let mut deps: Vec<TaskId> = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }

        Self {
            id: id.into(),
            description: String::new(),
            tool_name: tool_name.into(),
            tool_args,
            dependencies: deps,
            status: TaskStatus::Pending,
            attempt_count: 0,
            max_attempts: 3,
            circuit_deferrals: 0,
            timeout_ms: None,
            last_error: None,
            result: None,
            priority: 0,
            best_effort: false,
            records: Vec::new(),
            timeline: TaskTimeline::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_best_effort(mut self, best_effort: bool) -> Self {
        self.best_effort = best_effort;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn tool_args(&self) -> &Value {
        &self.tool_args
    }

    pub fn dependencies(&self) -> &[TaskId] {
        &self.dependencies
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn circuit_deferrals(&self) -> u32 {
        self.circuit_deferrals
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn result(&self) -> Option<&TaskResult> {
        self.result.as_ref()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_best_effort(&self) -> bool {
        self.best_effort
    }

    pub fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    pub fn timeline(&self) -> &TaskTimeline {
        &self.timeline
    }

    /// Number the next execution record will carry (1-based).
    pub fn next_attempt_number(&self) -> u32 {
        self.records.len() as u32 + 1
    }

    // State transitions - explicit and validated

    /// Move to `to`, stamping the timeline.
    ///
    /// # Errors
    /// `TaskError::InvalidTransition` if the edge is not part of the state
    /// machine; the task is left untouched.
    pub fn transition(&mut self, to: TaskStatus) -> Result<TaskStatus, TaskError> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                task_id: self.id.clone(),
                from,
                to,
            });
        }

        let now = Utc::now();
        match to {
            TaskStatus::Ready => self.timeline.ready_at = Some(now),
            TaskStatus::Running if self.timeline.started_at.is_none() => {
                self.timeline.started_at = Some(now)
            }
            s if s.is_terminal() => self.timeline.finished_at = Some(now),
            _ => {}
        }
        self.status = to;
        Ok(from)
    }

    /// Append an execution record.
    ///
    /// # Errors
    /// Rejects records whose `attempt_number` does not continue the sequence.
    pub(crate) fn push_record(&mut self, record: ExecutionRecord) -> Result<(), TaskError> {
        let expected = self.next_attempt_number();
        if record.attempt_number != expected {
            return Err(TaskError::OutOfOrderRecord {
                task_id: self.id.clone(),
                expected,
                got: record.attempt_number,
            });
        }
        self.records.push(record);
        Ok(())
    }

    pub(crate) fn count_attempt(&mut self) {
        self.attempt_count = self.attempt_count.saturating_add(1);
    }

    pub(crate) fn count_deferral(&mut self) {
        self.circuit_deferrals = self.circuit_deferrals.saturating_add(1);
    }

    pub(crate) fn set_result(&mut self, result: TaskResult) {
        self.result = Some(result);
        self.last_error = None;
    }

    pub(crate) fn set_last_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }
}

/// Errors raised by illegal task operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task {task_id}: invalid state transition from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {task_id}: execution record {got} out of order (expected {expected})")]
    OutOfOrderRecord {
        task_id: TaskId,
        expected: u32,
        got: u32,
    },
}
