//! Incremental topological scheduling over a validated mission.
//!
//! The scheduler keeps, per task, the number of dependencies that are not
//! yet satisfied plus the reverse adjacency list. It is driven repeatedly as
//! tasks settle:
//!
//! - [`on_terminal`](TopologicalScheduler::on_terminal) releases dependents of
//!   a finished task and cascades skips from failures
//! - [`compute_ready_set`](TopologicalScheduler::compute_ready_set) promotes
//!   every Pending task whose dependencies are all satisfied
//!
//! Skip cascade rules:
//! - a Failed task always skips its direct dependents
//! - when the failed task was required, every transitive dependent is skipped
//! - when it was best-effort, the skip travels on through required dependents
//!   only; a best-effort dependent of a skipped task may still run

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use crate::mission::{Mission, TaskId, TaskStatus};

/// Dispatch order key: higher priority first, then declaration order.
pub type ReadyKey = (Reverse<i32>, usize);

/// A task moved by the scheduler, for event emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Moved {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Debug, Clone)]
pub struct TopologicalScheduler {
    ids: Vec<TaskId>,
    index: HashMap<TaskId, usize>,
    priority: Vec<i32>,
    best_effort: Vec<bool>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    unsatisfied: Vec<usize>,
}

impl TopologicalScheduler {
    /// Build from the mission's current task table.
    ///
    /// Dependencies on ids that do not exist are ignored; the validator
    /// rejects such plans before a scheduler is ever built for a run.
    pub fn new(mission: &Mission) -> Self {
        let tasks = mission.tasks();
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id().clone()).collect();
        let index: HashMap<TaskId, usize> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut deps = vec![Vec::new(); tasks.len()];
        let mut dependents = vec![Vec::new(); tasks.len()];
        let mut unsatisfied = vec![0; tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            for dep in task.dependencies() {
                if let Some(&d) = index.get(dep) {
                    deps[i].push(d);
                    dependents[d].push(i);
                    if tasks[d].status() != TaskStatus::Succeeded {
                        unsatisfied[i] += 1;
                    }
                }
            }
        }

        Self {
            ids,
            index,
            priority: tasks.iter().map(|t| t.priority()).collect(),
            best_effort: tasks.iter().map(|t| t.is_best_effort()).collect(),
            deps,
            dependents,
            unsatisfied,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn index_of(&self, task_id: &TaskId) -> Option<usize> {
        self.index.get(task_id).copied()
    }

    pub fn task_id(&self, index: usize) -> &TaskId {
        &self.ids[index]
    }

    pub fn ready_key(&self, index: usize) -> ReadyKey {
        (Reverse(self.priority[index]), index)
    }

    /// Promote every Pending task whose dependencies are all satisfied.
    ///
    /// Returns the promoted tasks in dispatch order.
    pub fn compute_ready_set(&mut self, mission: &mut Mission) -> Vec<TaskId> {
        let mut promoted: Vec<usize> = Vec::new();
        for (i, task) in mission.tasks_mut().iter_mut().enumerate() {
            if task.status() == TaskStatus::Pending
                && self.unsatisfied.get(i) == Some(&0)
                && task.transition(TaskStatus::Ready).is_ok()
            {
                promoted.push(i);
            }
        }
        promoted.sort_by_key(|&i| self.ready_key(i));
        promoted.into_iter().map(|i| self.ids[i].clone()).collect()
    }

    /// Account for `task_id` having reached its terminal status.
    ///
    /// Returns the tasks skipped as a consequence.
    pub fn on_terminal(&mut self, mission: &mut Mission, task_id: &TaskId) -> Vec<Moved> {
        let Some(i) = self.index_of(task_id) else {
            return Vec::new();
        };
        let status = mission.tasks()[i].status();
        let mut moved = Vec::new();

        match status {
            TaskStatus::Succeeded => {
                for &d in &self.dependents[i] {
                    self.unsatisfied[d] = self.unsatisfied[d].saturating_sub(1);
                }
            }
            TaskStatus::Failed => {
                let hard = !self.best_effort[i];
                let mut stack = Vec::new();
                for &d in &self.dependents[i] {
                    if skip(mission, d, &mut moved) {
                        stack.push(d);
                    }
                }
                self.propagate(mission, stack, hard, &mut moved);
            }
            TaskStatus::Skipped => self.propagate(mission, vec![i], false, &mut moved),
            _ => {}
        }
        moved
    }

    /// Walk dependents of already-skipped tasks.
    fn propagate(&mut self, mission: &mut Mission, mut stack: Vec<usize>, hard: bool, moved: &mut Vec<Moved>) {
        while let Some(src) = stack.pop() {
            for &d in &self.dependents[src] {
                if mission.tasks()[d].status() != TaskStatus::Pending {
                    continue;
                }
                if !hard && self.best_effort[d] {
                    self.unsatisfied[d] = self.unsatisfied[d].saturating_sub(1);
                } else if skip(mission, d, moved) {
                    stack.push(d);
                }
            }
        }
    }

    /// Full deterministic topological order (Kahn's algorithm).
    ///
    /// Returns `None` if the graph has a cycle.
    pub fn execution_order(&self) -> Option<Vec<TaskId>> {
        self.kahn().map(|order| order.into_iter().map(|i| self.ids[i].clone()).collect())
    }

    /// Number of tasks on the longest dependency chain, `None` if cyclic.
    pub fn depth(&self) -> Option<usize> {
        let order = self.kahn()?;
        let mut level = vec![0usize; self.ids.len()];
        for &i in &order {
            level[i] = 1 + self.deps[i].iter().map(|&d| level[d]).max().unwrap_or(0);
        }
        Some(level.into_iter().max().unwrap_or(0))
    }

    fn kahn(&self) -> Option<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<ReadyKey> = (0..self.ids.len())
            .filter(|&i| in_degree[i] == 0)
            .map(|i| self.ready_key(i))
            .collect();

        let mut order = Vec::with_capacity(self.ids.len());
        while let Some((_, i)) = ready.pop_first() {
            order.push(i);
            for &d in &self.dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.insert(self.ready_key(d));
                }
            }
        }

        (order.len() == self.ids.len()).then_some(order)
    }
}

fn skip(mission: &mut Mission, index: usize, moved: &mut Vec<Moved>) -> bool {
    let task = &mut mission.tasks_mut()[index];
    match task.transition(TaskStatus::Skipped) {
        Ok(from) => {
            moved.push(Moved {
                task_id: task.id().clone(),
                from,
                to: TaskStatus::Skipped,
            });
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::Task;
    use serde_json::json;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, "noop", json!({}), deps.iter().map(|d| TaskId::from(*d)).collect())
    }

    fn finish(mission: &mut Mission, id: &str, status: TaskStatus) {
        let t = mission.task_mut(id).unwrap();
        t.transition(TaskStatus::Running).unwrap();
        t.transition(status).unwrap();
    }

    fn ids(list: &[TaskId]) -> Vec<&str> {
        list.iter().map(|t| t.as_str()).collect()
    }

    fn status(mission: &Mission, id: &str) -> TaskStatus {
        mission.task(id).unwrap().status()
    }

    #[test]
    fn test_ready_set_priority_then_declaration() {
        let mut mission = Mission::new("m")
            .with_task(task("a", &[]))
            .with_task(task("b", &[]).with_priority(5))
            .with_task(task("c", &[]))
            .with_task(task("d", &["a"]));
        let mut sched = TopologicalScheduler::new(&mission);

        let ready = sched.compute_ready_set(&mut mission);
        assert_eq!(ids(&ready), vec!["b", "a", "c"]);
        assert_eq!(status(&mission, "d"), TaskStatus::Pending);

        // Repeated calls are incremental
        assert!(sched.compute_ready_set(&mut mission).is_empty());

        finish(&mut mission, "a", TaskStatus::Succeeded);
        assert!(sched.on_terminal(&mut mission, &TaskId::from("a")).is_empty());
        assert_eq!(ids(&sched.compute_ready_set(&mut mission)), vec!["d"]);
    }

    #[test]
    fn test_required_failure_skips_everything_downstream() {
        // a -> b -> c(best effort)
        let mut mission = Mission::new("m")
            .with_task(task("a", &[]))
            .with_task(task("b", &["a"]))
            .with_task(task("c", &["b"]).with_best_effort(true));
        let mut sched = TopologicalScheduler::new(&mission);
        sched.compute_ready_set(&mut mission);

        finish(&mut mission, "a", TaskStatus::Failed);
        let moved = sched.on_terminal(&mut mission, &TaskId::from("a"));
        assert_eq!(moved.len(), 2);
        assert_eq!(status(&mission, "b"), TaskStatus::Skipped);
        assert_eq!(status(&mission, "c"), TaskStatus::Skipped);
    }

    #[test]
    fn test_best_effort_failure_lets_best_effort_grandchild_run() {
        // a(best effort) -> b(best effort) -> c(best effort)
        //                -> d(required)    -> e(required)
        let mut mission = Mission::new("m")
            .with_task(task("a", &[]).with_best_effort(true))
            .with_task(task("b", &["a"]).with_best_effort(true))
            .with_task(task("c", &["b"]).with_best_effort(true))
            .with_task(task("d", &["a"]))
            .with_task(task("e", &["d"]));
        let mut sched = TopologicalScheduler::new(&mission);
        sched.compute_ready_set(&mut mission);

        finish(&mut mission, "a", TaskStatus::Failed);
        sched.on_terminal(&mut mission, &TaskId::from("a"));

        // Direct dependents of a failure never run
        assert_eq!(status(&mission, "b"), TaskStatus::Skipped);
        assert_eq!(status(&mission, "d"), TaskStatus::Skipped);
        assert_eq!(status(&mission, "e"), TaskStatus::Skipped);
        // c tolerates its skipped upstream
        assert_eq!(ids(&sched.compute_ready_set(&mut mission)), vec!["c"]);
    }

    #[test]
    fn test_mixed_dependencies_wait_for_all() {
        let mut mission = Mission::new("m")
            .with_task(task("a", &[]))
            .with_task(task("b", &[]))
            .with_task(task("c", &["a", "b"]));
        let mut sched = TopologicalScheduler::new(&mission);
        sched.compute_ready_set(&mut mission);

        finish(&mut mission, "a", TaskStatus::Succeeded);
        sched.on_terminal(&mut mission, &TaskId::from("a"));
        assert!(sched.compute_ready_set(&mut mission).is_empty());

        finish(&mut mission, "b", TaskStatus::Succeeded);
        sched.on_terminal(&mut mission, &TaskId::from("b"));
        assert_eq!(ids(&sched.compute_ready_set(&mut mission)), vec!["c"]);
    }

    #[test]
    fn test_execution_order_and_depth() {
        let mission = Mission::new("m")
            .with_task(task("c", &["b"]))
            .with_task(task("b", &["a"]))
            .with_task(task("a", &[]))
            .with_task(task("x", &[]).with_priority(1));
        let sched = TopologicalScheduler::new(&mission);
        let order = sched.execution_order().unwrap();
        assert_eq!(ids(&order), vec!["x", "a", "b", "c"]);
        assert_eq!(sched.depth(), Some(3));
    }

    #[test]
    fn test_cycle_has_no_order() {
        let mission = Mission::new("m")
            .with_task(task("a", &["b"]))
            .with_task(task("b", &["a"]));
        let sched = TopologicalScheduler::new(&mission);
        assert_eq!(sched.execution_order(), None);
        assert_eq!(sched.depth(), None);
    }
}
