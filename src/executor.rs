//! Per-task execution: one attempt at a time.
//!
//! The executor owns a task for the duration of an attempt. It moves the
//! task to Running, releases the mission lock while the pipeline runs,
//! then appends the execution record and decides between success, retry
//! and failure. It never sleeps: a retry is returned to the caller as a
//! delay, and the caller re-queues the task when the delay has passed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::bindings::resolve_bindings;
use crate::events::{EventBus, OrchestratorEvent};
use crate::mission::{AttemptOutcome, ExecutionRecord, Mission, TaskError, TaskId, TaskStatus};
use crate::pipeline::ToolInvocationPipeline;
use crate::retry::{FailureKind, RetryDecision, RetryPolicy};
use crate::tools::InvocationContext;

/// What the caller should do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStep {
    /// The task reached a terminal status
    Settled(TaskStatus),
    /// The task is Retrying; dispatch it again after the delay
    RetryAfter(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Task {0} is not part of the mission")]
    UnknownTask(TaskId),

    #[error(transparent)]
    Task(#[from] TaskError),
}

pub struct TaskExecutor {
    pipeline: Arc<ToolInvocationPipeline>,
    retry: RetryPolicy,
    default_timeout: Duration,
    events: EventBus,
}

impl TaskExecutor {
    pub fn new(
        pipeline: Arc<ToolInvocationPipeline>,
        retry: RetryPolicy,
        default_timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            pipeline,
            retry,
            default_timeout,
            events,
        }
    }

    pub fn pipeline(&self) -> &Arc<ToolInvocationPipeline> {
        &self.pipeline
    }

    /// Run one attempt of a Ready or Retrying task.
    ///
    /// If `cancel` has fired before the attempt starts, the task is skipped
    /// instead. A failure observed after cancellation is final.
    pub async fn execute_attempt(
        &self,
        mission: &RwLock<Mission>,
        task_id: &TaskId,
        cancel: &CancellationToken,
    ) -> Result<AttemptStep, ExecutorError> {
        let (mission_id, tool_name, args, timeout, attempt) = {
            let mut guard = mission.write().await;
            let mission_id = guard.id();

            let args = {
                let snapshot: &Mission = &guard;
                let task = snapshot
                    .task(task_id.as_str())
                    .ok_or_else(|| ExecutorError::UnknownTask(task_id.clone()))?;
                resolve_bindings(task.tool_args(), &|dep: &TaskId| {
                    snapshot
                        .task(dep.as_str())
                        .and_then(|t| t.result())
                        .map(|r| &r.output)
                })
            };

            let task = guard
                .task_mut(task_id.as_str())
                .ok_or_else(|| ExecutorError::UnknownTask(task_id.clone()))?;

            if cancel.is_cancelled() {
                let from = task.transition(TaskStatus::Skipped)?;
                self.events.task_changed(mission_id, task_id, from, TaskStatus::Skipped);
                return Ok(AttemptStep::Settled(TaskStatus::Skipped));
            }

            let from = task.transition(TaskStatus::Running)?;
            self.events.task_changed(mission_id, task_id, from, TaskStatus::Running);
            (
                mission_id,
                task.tool_name().to_string(),
                args,
                task.timeout().unwrap_or(self.default_timeout),
                task.attempt_count() + 1,
            )
        };

        tracing::debug!(
            mission_id = %mission_id,
            task_id = %task_id,
            tool = %tool_name,
            attempt,
            "Starting attempt"
        );

        let ctx = InvocationContext::new(mission_id, task_id.clone(), attempt, timeout);
        let started_at = Utc::now();
        let invocation = self.pipeline.run(&tool_name, &args, &ctx).await;
        let finished_at = Utc::now();

        let mut guard = mission.write().await;
        let task = guard
            .task_mut(task_id.as_str())
            .ok_or_else(|| ExecutorError::UnknownTask(task_id.clone()))?;

        let mut record = ExecutionRecord {
            task_id: task_id.clone(),
            attempt_number: task.next_attempt_number(),
            started_at,
            finished_at,
            outcome: AttemptOutcome::Succeeded,
            error_classification: None,
            error: None,
            latency_ms: invocation.latency_ms,
        };

        let failure = match invocation.outcome {
            Ok(result) => {
                task.count_attempt();
                task.push_record(record.clone())?;
                task.set_result(result);
                let from = task.transition(TaskStatus::Succeeded)?;
                self.recorded(mission_id, record);
                self.events.task_changed(mission_id, task_id, from, TaskStatus::Succeeded);
                return Ok(AttemptStep::Settled(TaskStatus::Succeeded));
            }
            Err(failure) => failure,
        };

        let circuit_open = failure.is_circuit_open();
        let kind = if circuit_open {
            task.count_deferral();
            record.outcome = AttemptOutcome::CircuitOpen;
            FailureKind::CircuitOpen {
                retry_in: failure.error.retry_after().unwrap_or_default(),
            }
        } else {
            task.count_attempt();
            record.outcome = AttemptOutcome::Failed;
            FailureKind::Attempt {
                class: failure.class,
                retry_after: failure.error.retry_after(),
            }
        };
        record.error_classification = Some(failure.class);
        record.error = Some(failure.error.to_string());
        task.push_record(record.clone())?;
        task.set_last_error(failure.to_string());
        self.recorded(mission_id, record);

        if !circuit_open {
            tracing::warn!(
                mission_id = %mission_id,
                task_id = %task_id,
                tool = %tool_name,
                attempt,
                class = %failure.class,
                error = %failure.error,
                "Attempt failed"
            );
        }

        let decision = if cancel.is_cancelled() {
            None
        } else {
            Some(self.retry.decide(
                kind,
                task.attempt_count(),
                task.max_attempts(),
                task.circuit_deferrals(),
            ))
        };

        match decision {
            Some(RetryDecision::Retry { delay }) => {
                let from = task.transition(TaskStatus::Retrying)?;
                self.events.task_changed(mission_id, task_id, from, TaskStatus::Retrying);
                tracing::info!(
                    mission_id = %mission_id,
                    task_id = %task_id,
                    tool = %tool_name,
                    circuit_open,
                    delay_ms = delay.as_millis() as u64,
                    "Retry scheduled"
                );
                Ok(AttemptStep::RetryAfter(delay))
            }
            Some(RetryDecision::GiveUp { reason }) => {
                let from = task.transition(TaskStatus::Failed)?;
                self.events.task_changed(mission_id, task_id, from, TaskStatus::Failed);
                tracing::warn!(
                    mission_id = %mission_id,
                    task_id = %task_id,
                    attempts = task.attempt_count(),
                    %reason,
                    "Task failed"
                );
                Ok(AttemptStep::Settled(TaskStatus::Failed))
            }
            None => {
                let from = task.transition(TaskStatus::Failed)?;
                self.events.task_changed(mission_id, task_id, from, TaskStatus::Failed);
                tracing::info!(mission_id = %mission_id, task_id = %task_id, "Not retrying, mission is cancelling");
                Ok(AttemptStep::Settled(TaskStatus::Failed))
            }
        }
    }

    fn recorded(&self, mission_id: crate::mission::MissionId, record: ExecutionRecord) {
        self.events
            .emit(OrchestratorEvent::ExecutionRecorded { mission_id, record });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerRegistry;
    use crate::config::{BreakerConfig, RetryConfig};
    use crate::mission::Task;
    use crate::tools::testing::ScriptedTool;
    use crate::tools::{ToolError, ToolRegistry};
    use serde_json::json;

    fn executor(tool: Arc<ScriptedTool>) -> TaskExecutor {
        let registry = ToolRegistry::new();
        registry.register_tool(tool).unwrap();
        let pipeline = ToolInvocationPipeline::new(
            Arc::new(registry),
            CircuitBreakerRegistry::new(BreakerConfig::default()),
            1024,
        );
        let retry = RetryPolicy::from(&RetryConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter: 0.0,
            max_circuit_deferrals: 3,
        });
        TaskExecutor::new(Arc::new(pipeline), retry, Duration::from_secs(1), EventBus::new())
    }

    fn ready_mission(tasks: Vec<Task>) -> RwLock<Mission> {
        let mut mission = tasks.into_iter().fold(Mission::new("m"), Mission::with_task);
        for task in mission.tasks_mut() {
            if task.dependencies().is_empty() {
                task.transition(TaskStatus::Ready).unwrap();
            }
        }
        RwLock::new(mission)
    }

    #[tokio::test]
    async fn test_success_records_and_stores_result() {
        let exec = executor(Arc::new(ScriptedTool::new("echo")));
        let mission = ready_mission(vec![Task::new("a", "echo", json!({"x": 1}), vec![])]);
        let id = TaskId::from("a");

        let step = exec
            .execute_attempt(&mission, &id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(step, AttemptStep::Settled(TaskStatus::Succeeded));

        let m = mission.read().await;
        let task = m.task("a").unwrap();
        assert_eq!(task.attempt_count(), 1);
        assert_eq!(task.records().len(), 1);
        assert_eq!(task.result().unwrap().output["echo"], json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_transient_failure_asks_for_retry() {
        let tool = Arc::new(ScriptedTool::new("flaky").then_fail(ToolError::transient("busy")));
        let exec = executor(tool);
        let mission = ready_mission(vec![Task::new("a", "flaky", json!({}), vec![])]);
        let id = TaskId::from("a");
        let cancel = CancellationToken::new();

        let step = exec.execute_attempt(&mission, &id, &cancel).await.unwrap();
        assert_eq!(step, AttemptStep::RetryAfter(Duration::from_millis(10)));
        assert_eq!(mission.read().await.task("a").unwrap().status(), TaskStatus::Retrying);

        let step = exec.execute_attempt(&mission, &id, &cancel).await.unwrap();
        assert_eq!(step, AttemptStep::Settled(TaskStatus::Succeeded));

        let m = mission.read().await;
        let numbers: Vec<u32> = m.task("a").unwrap().records().iter().map(|r| r.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(m.task("a").unwrap().last_error(), None);
    }

    #[tokio::test]
    async fn test_bindings_resolved_from_upstream_result() {
        let exec = executor(Arc::new(ScriptedTool::new("echo")));
        let mission = ready_mission(vec![
            Task::new("a", "echo", json!({"v": "hello"}), vec![]),
            Task::new(
                "b",
                "echo",
                json!({"got": {"$from": "a", "pointer": "/echo/v"}}),
                vec![TaskId::from("a")],
            ),
        ]);
        let cancel = CancellationToken::new();
        exec.execute_attempt(&mission, &TaskId::from("a"), &cancel).await.unwrap();
        mission
            .write()
            .await
            .task_mut("b")
            .unwrap()
            .transition(TaskStatus::Ready)
            .unwrap();
        exec.execute_attempt(&mission, &TaskId::from("b"), &cancel).await.unwrap();

        let m = mission.read().await;
        assert_eq!(m.task("b").unwrap().result().unwrap().output["echo"], json!({"got": "hello"}));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips() {
        let tool = Arc::new(ScriptedTool::new("echo"));
        let exec = executor(tool.clone());
        let mission = ready_mission(vec![Task::new("a", "echo", json!({}), vec![])]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let step = exec
            .execute_attempt(&mission, &TaskId::from("a"), &cancel)
            .await
            .unwrap();
        assert_eq!(step, AttemptStep::Settled(TaskStatus::Skipped));
        assert_eq!(tool.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_task_is_an_error() {
        let exec = executor(Arc::new(ScriptedTool::new("echo")));
        let mission = ready_mission(vec![]);
        let err = exec
            .execute_attempt(&mission, &TaskId::from("ghost"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownTask(_)));
    }
}
