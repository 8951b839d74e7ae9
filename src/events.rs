//! Orchestrator events for observers.
//!
//! Events fan out over a broadcast channel. Subscribers are read-only and a
//! slow subscriber only loses events (`RecvError::Lagged`); the orchestrator
//! never waits on it.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::mission::{ExecutionRecord, MissionId, MissionStatus, TaskId, TaskStatus};

const EVENT_CAPACITY: usize = 256;

/// Something observable happened to a mission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    MissionStatusChanged {
        mission_id: MissionId,
        from: MissionStatus,
        to: MissionStatus,
    },
    TaskStatusChanged {
        mission_id: MissionId,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// An attempt finished and its audit entry was appended
    ExecutionRecorded {
        mission_id: MissionId,
        record: ExecutionRecord,
    },
}

/// Sending half shared by the orchestrator, drivers and executors.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Publish an event (ignored if nobody is listening).
    pub fn emit(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn task_changed(
        &self,
        mission_id: MissionId,
        task_id: &TaskId,
        from: TaskStatus,
        to: TaskStatus,
    ) {
        tracing::debug!(mission_id = %mission_id, task_id = %task_id, %from, %to, "Task status changed");
        self.emit(OrchestratorEvent::TaskStatusChanged {
            mission_id,
            task_id: task_id.clone(),
            from,
            to,
        });
    }

    pub(crate) fn mission_changed(&self, mission_id: MissionId, from: MissionStatus, to: MissionStatus) {
        if from == to {
            return;
        }
        self.emit(OrchestratorEvent::MissionStatusChanged {
            mission_id,
            from,
            to,
        });
    }
}
