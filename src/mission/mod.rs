//! Mission module - the task graph data model.
//!
//! A mission is built from a raw planner graph (`Mission::from_plan`),
//! consumed once by the validator, and then owned by the orchestrator for
//! its whole run. Snapshots handed to callers are plain clones.

mod record;
mod task;

pub use record::{AttemptOutcome, ExecutionRecord, TaskResult};
pub use task::{Task, TaskError, TaskId, TaskStatus, TaskTimeline};

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::plan::RawPlan;

/// Metadata key holding a planner-supplied id that was not a UUID.
pub const PLANNER_ID_KEY: &str = "planner_id";

/// Unique identifier for a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MissionId(Uuid);

impl MissionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for MissionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for MissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mission lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    /// Built from a raw plan, not yet validated
    Draft,
    /// Accepted by the validator, ready to run
    Validated,
    Running,
    /// Cancel requested; in-flight attempts are finishing
    Cancelling,
    /// Every task succeeded
    Completed,
    /// No required task failed, but something did not succeed
    CompletedWithFailures,
    /// A required task failed
    Failed,
    Cancelled,
}

impl MissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithFailures | Self::Failed | Self::Cancelled
        )
    }
}

impl std::fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Validated => "validated",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::CompletedWithFailures => "completed_with_failures",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MissionSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub active: usize,
}

/// Top-level unit of work: an objective plus its task DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mission {
    id: MissionId,
    objective: String,
    tasks: Vec<Task>,
    status: MissionStatus,
    created_at: DateTime<Utc>,
    metadata: BTreeMap<String, Value>,
}

impl Mission {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            id: MissionId::new(),
            objective: objective.into(),
            tasks: Vec::new(),
            status: MissionStatus::Draft,
            created_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Reshape a raw plan into a Draft mission, preserving declaration order.
    ///
    /// Tasks without their own `max_attempts` get `default_max_attempts`.
    /// A planner id that is not a UUID is kept under [`PLANNER_ID_KEY`].
    pub fn from_plan(plan: RawPlan, default_max_attempts: u32) -> Self {
        let mut metadata = plan.metadata;
        let id = match plan.id {
            Some(raw) => match raw.parse::<MissionId>() {
                Ok(id) => id,
                Err(_) => {
                    metadata.insert(PLANNER_ID_KEY.to_string(), Value::String(raw));
                    MissionId::new()
                }
            },
            None => MissionId::new(),
        };

        let tasks = plan
            .tasks
            .into_iter()
            .map(|raw| {
                Task::new(
                    raw.id,
                    raw.tool,
                    raw.args,
                    raw.depends_on.into_iter().map(TaskId::from).collect(),
                )
                .with_description(raw.description)
                .with_priority(raw.priority)
                .with_best_effort(raw.best_effort)
                .with_max_attempts(raw.max_attempts.unwrap_or(default_max_attempts))
                .with_timeout(raw.timeout_ms.map(Duration::from_millis))
            })
            .collect();

        Self {
            id,
            objective: plan.objective,
            tasks,
            status: MissionStatus::Draft,
            created_at: Utc::now(),
            metadata,
        }
    }

    pub fn id(&self) -> MissionId {
        self.id
    }

    pub fn objective(&self) -> &str {
        &self.objective
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub(crate) fn tasks_mut(&mut self) -> &mut [Task] {
        &mut self.tasks
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id().as_str() == id)
    }

    pub(crate) fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id().as_str() == id)
    }

    pub fn status(&self) -> MissionStatus {
        self.status
    }

    /// Set the mission status, returning the previous one.
    ///
    /// Terminal statuses are final; later calls are ignored.
    pub(crate) fn set_status(&mut self, status: MissionStatus) -> MissionStatus {
        let previous = self.status;
        if !previous.is_terminal() {
            self.status = status;
        }
        previous
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// `true` once no task is Pending, Ready, Running or Retrying.
    pub fn is_settled(&self) -> bool {
        self.tasks.iter().all(|t| t.status().is_terminal())
    }

    pub fn summary(&self) -> MissionSummary {
        let mut summary = MissionSummary {
            total: self.tasks.len(),
            ..Default::default()
        };
        for task in &self.tasks {
            match task.status() {
                TaskStatus::Succeeded => summary.succeeded += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Skipped => summary.skipped += 1,
                _ => summary.active += 1,
            }
        }
        summary
    }

    /// Terminal status implied by the task table, ignoring cancellation.
    ///
    /// Returns `None` while any task is still active.
    pub fn settled_outcome(&self) -> Option<MissionStatus> {
        if !self.is_settled() {
            return None;
        }
        let required_failed = self
            .tasks
            .iter()
            .any(|t| !t.is_best_effort() && t.status() == TaskStatus::Failed);
        if required_failed {
            Some(MissionStatus::Failed)
        } else if self.tasks.iter().all(|t| t.status() == TaskStatus::Succeeded) {
            Some(MissionStatus::Completed)
        } else {
            Some(MissionStatus::CompletedWithFailures)
        }
    }
}
