//! Mission orchestrator.
//!
//! Holds the in-memory mission table and runs missions. Each running
//! mission gets a driver task that owns readiness, cascades and the
//! mission status; attempts run on spawned worker tasks that take a permit
//! from a semaphore shared by every mission on this orchestrator.
//!
//! ```text
//! driver ──dispatch──▶ worker (permit) ──▶ TaskExecutor ──▶ pipeline
//!   ▲                                          │
//!   └──────── Attempted / Requeue ◀────────────┘ (retry timers)
//! ```
//!
//! Retries never park a worker: the executor hands back a delay and the
//! driver arms a timer that re-queues the task.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::breaker::{CircuitBreakerRegistry, CircuitBreakerState};
use crate::config::EngineConfig;
use crate::events::{EventBus, OrchestratorEvent};
use crate::executor::{AttemptStep, ExecutorError, TaskExecutor};
use crate::mission::{Mission, MissionId, MissionStatus, MissionSummary, TaskId, TaskStatus};
use crate::pipeline::ToolInvocationPipeline;
use crate::plan::RawPlan;
use crate::retry::RetryPolicy;
use crate::scheduler::{Moved, ReadyKey, TopologicalScheduler};
use crate::tools::{RegistryError, Tool, ToolDescriptor, ToolInfo, ToolRegistry};
use crate::validation::{PlanValidator, ValidationResult};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Mission {0} not found")]
    NotFound(MissionId),

    #[error("Mission {0} has already been started")]
    AlreadyStarted(MissionId),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Row of [`MissionOrchestrator::list_missions`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissionInfo {
    pub id: MissionId,
    pub objective: String,
    pub status: MissionStatus,
    pub summary: MissionSummary,
    pub created_at: DateTime<Utc>,
}

struct MissionEntry {
    mission: Arc<RwLock<Mission>>,
    cancel: CancellationToken,
    status: Arc<watch::Sender<MissionStatus>>,
    started: bool,
}

/// Handle to a running mission.
#[derive(Debug, Clone)]
pub struct MissionHandle {
    mission_id: MissionId,
    status: watch::Receiver<MissionStatus>,
    cancel: CancellationToken,
    mission: Arc<RwLock<Mission>>,
}

impl MissionHandle {
    pub fn mission_id(&self) -> MissionId {
        self.mission_id
    }

    /// Latest published mission status.
    pub fn status(&self) -> MissionStatus {
        *self.status.borrow()
    }

    /// Wait until the mission reaches a terminal status.
    pub async fn wait(&self) -> MissionStatus {
        let mut rx = self.status.clone();
        let result = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        result.unwrap_or_else(|_| *rx.borrow())
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn snapshot(&self) -> Mission {
        self.mission.read().await.clone()
    }
}

pub struct MissionOrchestrator {
    config: EngineConfig,
    registry: Arc<ToolRegistry>,
    breakers: CircuitBreakerRegistry,
    executor: Arc<TaskExecutor>,
    validator: PlanValidator,
    missions: Arc<RwLock<HashMap<MissionId, MissionEntry>>>,
    workers: Arc<Semaphore>,
    events: EventBus,
}

impl MissionOrchestrator {
    pub fn new(config: EngineConfig, registry: Arc<ToolRegistry>) -> Self {
        let events = EventBus::new();
        let breakers = CircuitBreakerRegistry::new(config.breaker.clone());
        let pipeline = Arc::new(ToolInvocationPipeline::new(
            registry.clone(),
            breakers.clone(),
            config.max_result_bytes,
        ));
        let executor = Arc::new(TaskExecutor::new(
            pipeline,
            RetryPolicy::from(&config.retry),
            config.tool_timeout,
            events.clone(),
        ));

        Self {
            validator: PlanValidator::new(config.limits.clone()),
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            config,
            registry,
            breakers,
            executor,
            missions: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn register_tool(&self, descriptor: ToolDescriptor) -> Result<(), OrchestratorError> {
        Ok(self.registry.register(descriptor)?)
    }

    pub fn register_handler(&self, handler: Arc<dyn Tool>) -> Result<(), OrchestratorError> {
        Ok(self.registry.register_tool(handler)?)
    }

    pub fn list_tools(&self) -> Vec<ToolInfo> {
        self.registry.list_tools()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub async fn breaker_states(&self) -> Vec<CircuitBreakerState> {
        self.breakers.snapshots().await
    }

    /// Validate a raw plan. Accepted missions are stored, ready to run.
    pub async fn submit_plan(&self, plan: RawPlan) -> ValidationResult {
        let result = self
            .validator
            .validate_plan(plan, self.config.default_max_attempts, &self.registry);

        if let Some(mission) = &result.mission {
            let (status, _) = watch::channel(mission.status());
            let entry = MissionEntry {
                mission: Arc::new(RwLock::new(mission.clone())),
                cancel: CancellationToken::new(),
                status: Arc::new(status),
                started: false,
            };
            self.missions.write().await.insert(mission.id(), entry);
        }
        result
    }

    /// Start a validated mission.
    ///
    /// # Errors
    /// `NotFound` for unknown ids, `AlreadyStarted` if the mission was run
    /// or cancelled before.
    pub async fn run_mission(&self, mission_id: MissionId) -> Result<MissionHandle, OrchestratorError> {
        let mut missions = self.missions.write().await;
        let entry = missions
            .get_mut(&mission_id)
            .ok_or(OrchestratorError::NotFound(mission_id))?;
        if entry.started {
            return Err(OrchestratorError::AlreadyStarted(mission_id));
        }
        entry.started = true;

        let scheduler = {
            let mut mission = entry.mission.write().await;
            let from = mission.set_status(MissionStatus::Running);
            self.events.mission_changed(mission_id, from, MissionStatus::Running);
            TopologicalScheduler::new(&mission)
        };
        entry.status.send_replace(MissionStatus::Running);
        tracing::info!(mission_id = %mission_id, tasks = scheduler.len(), "Mission started");

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = MissionDriver {
            mission_id,
            mission: entry.mission.clone(),
            scheduler,
            executor: self.executor.clone(),
            workers: self.workers.clone(),
            cancel: entry.cancel.clone(),
            events: self.events.clone(),
            status: entry.status.clone(),
            queue: BTreeSet::new(),
            in_flight: HashSet::new(),
            timers: 0,
            cancelling: false,
            tx,
            rx,
        };
        tokio::spawn(driver.run());

        Ok(MissionHandle {
            mission_id,
            status: entry.status.subscribe(),
            cancel: entry.cancel.clone(),
            mission: entry.mission.clone(),
        })
    }

    /// Submit, and run if accepted.
    pub async fn submit_and_run(
        &self,
        plan: RawPlan,
    ) -> Result<(ValidationResult, Option<MissionHandle>), OrchestratorError> {
        let result = self.submit_plan(plan).await;
        let handle = match &result.mission {
            Some(mission) => Some(self.run_mission(mission.id()).await?),
            None => None,
        };
        Ok((result, handle))
    }

    /// Cancel a mission.
    ///
    /// A running mission stops dispatching and lets in-flight attempts
    /// finish. A mission that never started is cancelled on the spot.
    /// Cancelling a finished mission does nothing.
    pub async fn cancel(&self, mission_id: MissionId) -> Result<(), OrchestratorError> {
        let mut missions = self.missions.write().await;
        let entry = missions
            .get_mut(&mission_id)
            .ok_or(OrchestratorError::NotFound(mission_id))?;

        if entry.started {
            entry.cancel.cancel();
            return Ok(());
        }

        entry.started = true;
        entry.cancel.cancel();
        let mut mission = entry.mission.write().await;
        for task in mission.tasks_mut() {
            if let Ok(from) = task.transition(TaskStatus::Skipped) {
                self.events.task_changed(mission_id, task.id(), from, TaskStatus::Skipped);
            }
        }
        let from = mission.set_status(MissionStatus::Cancelled);
        self.events.mission_changed(mission_id, from, MissionStatus::Cancelled);
        entry.status.send_replace(MissionStatus::Cancelled);
        tracing::info!(mission_id = %mission_id, "Mission cancelled before start");
        Ok(())
    }

    /// Snapshot of a mission.
    pub async fn get_mission_state(&self, mission_id: MissionId) -> Option<Mission> {
        let mission = self.missions.read().await.get(&mission_id)?.mission.clone();
        let snapshot = mission.read().await.clone();
        Some(snapshot)
    }

    /// All known missions, newest first.
    pub async fn list_missions(&self) -> Vec<MissionInfo> {
        let handles: Vec<Arc<RwLock<Mission>>> = self
            .missions
            .read()
            .await
            .values()
            .map(|e| e.mission.clone())
            .collect();

        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            let mission = handle.read().await;
            infos.push(MissionInfo {
                id: mission.id(),
                objective: mission.objective().to_string(),
                status: mission.status(),
                summary: mission.summary(),
                created_at: mission.created_at(),
            });
        }
        infos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        infos
    }
}

enum DriverMsg {
    Attempted {
        task_id: TaskId,
        step: Result<AttemptStep, ExecutorError>,
    },
    Requeue(TaskId),
}

/// Per-mission control loop.
struct MissionDriver {
    mission_id: MissionId,
    mission: Arc<RwLock<Mission>>,
    scheduler: TopologicalScheduler,
    executor: Arc<TaskExecutor>,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
    events: EventBus,
    status: Arc<watch::Sender<MissionStatus>>,
    /// Ready (or re-queued Retrying) tasks in dispatch order
    queue: BTreeSet<ReadyKey>,
    in_flight: HashSet<TaskId>,
    /// Armed retry timers
    timers: usize,
    cancelling: bool,
    tx: mpsc::UnboundedSender<DriverMsg>,
    rx: mpsc::UnboundedReceiver<DriverMsg>,
}

impl MissionDriver {
    async fn run(mut self) {
        {
            let handle = self.mission.clone();
            let mut mission = handle.write().await;
            self.promote(&mut mission);
        }

        loop {
            if self.mission.read().await.is_settled() {
                break;
            }
            if self.queue.is_empty() && self.in_flight.is_empty() && self.timers == 0 {
                self.abandon_stalled().await;
                continue;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !self.cancelling => self.begin_cancel().await,
                Some(msg) = self.rx.recv() => self.handle(msg).await,
                permit = self.workers.clone().acquire_owned(), if !self.cancelling && !self.queue.is_empty() => {
                    match permit {
                        Ok(permit) => self.dispatch(permit),
                        Err(_) => {
                            tracing::error!(mission_id = %self.mission_id, "Worker pool closed");
                            self.cancel.cancel();
                        }
                    }
                }
                else => break,
            }
        }

        self.finish().await;
    }

    fn dispatch(&mut self, permit: OwnedSemaphorePermit) {
        let Some((_, index)) = self.queue.pop_first() else {
            return;
        };
        let task_id = self.scheduler.task_id(index).clone();
        self.in_flight.insert(task_id.clone());
        tracing::debug!(mission_id = %self.mission_id, task_id = %task_id, "Dispatching task");

        let executor = self.executor.clone();
        let mission = self.mission.clone();
        let cancel = self.cancel.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let step = executor.execute_attempt(&mission, &task_id, &cancel).await;
            drop(permit);
            let _ = tx.send(DriverMsg::Attempted { task_id, step });
        });
    }

    async fn handle(&mut self, msg: DriverMsg) {
        match msg {
            DriverMsg::Attempted { task_id, step } => {
                self.in_flight.remove(&task_id);
                match step {
                    Ok(AttemptStep::Settled(_)) => self.settle(&task_id).await,
                    Ok(AttemptStep::RetryAfter(delay)) if !self.cancelling => {
                        self.arm_timer(task_id, delay)
                    }
                    Ok(AttemptStep::RetryAfter(_)) => self.force_terminal(&task_id).await,
                    Err(e) => {
                        tracing::error!(
                            mission_id = %self.mission_id,
                            task_id = %task_id,
                            error = %e,
                            "Attempt could not run"
                        );
                        self.force_terminal(&task_id).await;
                    }
                }
            }
            DriverMsg::Requeue(task_id) => {
                self.timers = self.timers.saturating_sub(1);
                if self.cancelling {
                    return;
                }
                let mission = self.mission.read().await;
                let retrying = mission
                    .task(task_id.as_str())
                    .is_some_and(|t| t.status() == TaskStatus::Retrying);
                if let (true, Some(index)) = (retrying, self.scheduler.index_of(&task_id)) {
                    self.queue.insert(self.scheduler.ready_key(index));
                }
            }
        }
    }

    fn arm_timer(&mut self, task_id: TaskId, delay: Duration) {
        self.timers += 1;
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
            let _ = tx.send(DriverMsg::Requeue(task_id));
        });
    }

    /// Cascade from a settled task and promote whatever became ready.
    async fn settle(&mut self, task_id: &TaskId) {
        let handle = self.mission.clone();
        let mut mission = handle.write().await;
        let moved = self.scheduler.on_terminal(&mut mission, task_id);
        self.publish(&moved);
        if !self.cancelling {
            self.promote(&mut mission);
        }
    }

    fn promote(&mut self, mission: &mut Mission) {
        for task_id in self.scheduler.compute_ready_set(mission) {
            self.events
                .task_changed(self.mission_id, &task_id, TaskStatus::Pending, TaskStatus::Ready);
            if let Some(index) = self.scheduler.index_of(&task_id) {
                self.queue.insert(self.scheduler.ready_key(index));
            }
        }
    }

    fn publish(&self, moved: &[Moved]) {
        for m in moved {
            self.events.task_changed(self.mission_id, &m.task_id, m.from, m.to);
        }
    }

    /// Put a task that cannot continue into a terminal status, then cascade.
    ///
    /// A task whose attempt already ran (Running, or Retrying after a
    /// failure that raced with cancellation) ends Failed; anything else is
    /// Skipped.
    async fn force_terminal(&mut self, task_id: &TaskId) {
        {
            let mut mission = self.mission.write().await;
            if let Some(task) = mission.task_mut(task_id.as_str()) {
                let to = match task.status() {
                    TaskStatus::Running | TaskStatus::Retrying => TaskStatus::Failed,
                    _ => TaskStatus::Skipped,
                };
                if let Ok(from) = task.transition(to) {
                    self.events.task_changed(self.mission_id, task_id, from, to);
                }
            }
        }
        self.settle(task_id).await;
    }

    async fn begin_cancel(&mut self) {
        self.cancelling = true;
        self.queue.clear();

        let mut mission = self.mission.write().await;
        let from = mission.set_status(MissionStatus::Cancelling);
        self.events
            .mission_changed(self.mission_id, from, MissionStatus::Cancelling);
        self.status.send_replace(MissionStatus::Cancelling);

        let mut skipped = 0usize;
        for task in mission.tasks_mut() {
            if self.in_flight.contains(task.id()) {
                continue;
            }
            if matches!(
                task.status(),
                TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Retrying
            ) {
                if let Ok(from) = task.transition(TaskStatus::Skipped) {
                    self.events
                        .task_changed(self.mission_id, task.id(), from, TaskStatus::Skipped);
                    skipped += 1;
                }
            }
        }
        tracing::info!(
            mission_id = %self.mission_id,
            skipped,
            in_flight = self.in_flight.len(),
            "Mission cancelling"
        );
    }

    /// Nothing is queued, running or waiting, yet tasks remain unsettled.
    async fn abandon_stalled(&mut self) {
        let mut mission = self.mission.write().await;
        let mut stranded = Vec::new();
        for task in mission.tasks_mut() {
            if let Ok(from) = task.transition(TaskStatus::Skipped) {
                self.events
                    .task_changed(self.mission_id, task.id(), from, TaskStatus::Skipped);
                stranded.push(task.id().to_string());
            }
        }
        tracing::warn!(mission_id = %self.mission_id, ?stranded, "Mission stalled, skipping stranded tasks");
    }

    async fn finish(self) {
        let mut mission = self.mission.write().await;
        let outcome = if self.cancelling {
            MissionStatus::Cancelled
        } else {
            mission.settled_outcome().unwrap_or(MissionStatus::Failed)
        };
        let from = mission.set_status(outcome);
        self.events.mission_changed(self.mission_id, from, outcome);
        self.status.send_replace(outcome);

        let summary = mission.summary();
        tracing::info!(
            mission_id = %self.mission_id,
            status = %outcome,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "Mission finished"
        );
    }
}
