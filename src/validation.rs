//! Plan validation.
//!
//! A draft mission is checked once, before anything runs. Checks happen in
//! a fixed order:
//!
//! 1. structure: empty plan, empty or duplicate task ids, dangling dependencies
//! 2. cycles (each reported with the full path back to its start)
//! 3. per task: known tool, arguments against the tool schema, bindings,
//!    attempt budget
//! 4. size: task count and dependency depth
//!
//! Structural errors stop validation early because the later checks assume
//! a well-formed id space. Everything else is collected so the planner gets
//! the complete list in one round trip.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::bindings::collect_bindings;
use crate::config::PlanLimits;
use crate::mission::{Mission, MissionStatus, TaskId};
use crate::plan::RawPlan;
use crate::scheduler::TopologicalScheduler;
use crate::tools::{FieldError, ToolRegistry};

/// Which bound a plan exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphDimension {
    Tasks,
    Depth,
}

impl std::fmt::Display for GraphDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tasks => write!(f, "task count"),
            Self::Depth => write!(f, "dependency depth"),
        }
    }
}

/// A reason a plan was rejected. Serialized with a `kind` tag so planners
/// can repair and resubmit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("plan has no tasks")]
    EmptyPlan,

    #[error("task at position {index} has an empty id")]
    EmptyTaskId { index: usize },

    #[error("duplicate task id '{task_id}'")]
    DuplicateTaskId { task_id: TaskId },

    #[error("task '{task_id}' depends on unknown task '{dependency}'")]
    DanglingDependency { task_id: TaskId, dependency: TaskId },

    #[error("dependency cycle: {}", format_path(.path))]
    CycleDetected { path: Vec<TaskId> },

    #[error("task '{task_id}' uses unknown tool '{tool}'")]
    UnknownTool { task_id: TaskId, tool: String },

    #[error("task '{task_id}' has invalid arguments for '{tool}': {}", format_fields(.fields))]
    SchemaViolation {
        task_id: TaskId,
        tool: String,
        fields: Vec<FieldError>,
    },

    #[error("task '{task_id}' binds to '{source_task}', which is not one of its dependencies")]
    UnboundReference { task_id: TaskId, source_task: TaskId },

    #[error("task '{task_id}' must allow at least one attempt")]
    InvalidMaxAttempts { task_id: TaskId },

    #[error("plan {dimension} {actual} exceeds the limit of {limit}")]
    GraphTooLarge {
        dimension: GraphDimension,
        actual: usize,
        limit: usize,
    },
}

fn format_path(path: &[TaskId]) -> String {
    path.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Outcome of validating a plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub ok: bool,
    /// The validated mission, present when `ok`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mission: Option<Mission>,
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    fn accepted(mission: Mission) -> Self {
        Self {
            ok: true,
            mission: Some(mission),
            errors: Vec::new(),
        }
    }

    fn rejected(errors: Vec<ValidationError>) -> Self {
        Self {
            ok: false,
            mission: None,
            errors,
        }
    }
}

/// Checks draft missions against a tool registry and size limits.
#[derive(Debug, Clone, Default)]
pub struct PlanValidator {
    limits: PlanLimits,
}

impl PlanValidator {
    pub fn new(limits: PlanLimits) -> Self {
        Self { limits }
    }

    /// Build a draft mission from a raw plan and validate it.
    ///
    /// Validating the same plan twice gives the same verdict, errors and
    /// task table. Only `created_at` differs, and the mission id too unless
    /// the plan carries a UUID `id`.
    pub fn validate_plan(
        &self,
        plan: RawPlan,
        default_max_attempts: u32,
        registry: &ToolRegistry,
    ) -> ValidationResult {
        self.validate(Mission::from_plan(plan, default_max_attempts), registry)
    }

    /// Validate a draft mission, consuming it.
    ///
    /// On success the mission comes back with status `Validated`. On
    /// rejection it is dropped untouched; nothing has executed.
    pub fn validate(&self, mut mission: Mission, registry: &ToolRegistry) -> ValidationResult {
        let errors = self.check(&mission, registry);
        if !errors.is_empty() {
            tracing::warn!(
                mission_id = %mission.id(),
                errors = errors.len(),
                "Plan rejected"
            );
            return ValidationResult::rejected(errors);
        }

        mission.set_status(MissionStatus::Validated);
        tracing::info!(
            mission_id = %mission.id(),
            tasks = mission.tasks().len(),
            "Plan accepted"
        );
        ValidationResult::accepted(mission)
    }

    /// Run every check and return the errors found, in check order.
    pub fn check(&self, mission: &Mission, registry: &ToolRegistry) -> Vec<ValidationError> {
        let tasks = mission.tasks();
        if tasks.is_empty() {
            return vec![ValidationError::EmptyPlan];
        }

        let structural = check_structure(mission);
        if !structural.is_empty() {
            return structural;
        }

        let mut errors = find_cycles(mission);
        let acyclic = errors.is_empty();

        for task in tasks {
            match registry.get(task.tool_name()) {
                None => errors.push(ValidationError::UnknownTool {
                    task_id: task.id().clone(),
                    tool: task.tool_name().to_string(),
                }),
                Some(descriptor) => {
                    if let Err(fields) = descriptor.schema().validate_plan(task.tool_args()) {
                        errors.push(ValidationError::SchemaViolation {
                            task_id: task.id().clone(),
                            tool: task.tool_name().to_string(),
                            fields,
                        });
                    }
                }
            }

            for binding in collect_bindings(task.tool_args()) {
                if !task.dependencies().contains(&binding.source) {
                    errors.push(ValidationError::UnboundReference {
                        task_id: task.id().clone(),
                        source_task: binding.source,
                    });
                }
            }

            if task.max_attempts() == 0 {
                errors.push(ValidationError::InvalidMaxAttempts {
                    task_id: task.id().clone(),
                });
            }
        }

        if tasks.len() > self.limits.max_tasks {
            errors.push(ValidationError::GraphTooLarge {
                dimension: GraphDimension::Tasks,
                actual: tasks.len(),
                limit: self.limits.max_tasks,
            });
        }
        if acyclic {
            let depth = TopologicalScheduler::new(mission).depth().unwrap_or(0);
            if depth > self.limits.max_depth {
                errors.push(ValidationError::GraphTooLarge {
                    dimension: GraphDimension::Depth,
                    actual: depth,
                    limit: self.limits.max_depth,
                });
            }
        }

        errors
    }
}

fn check_structure(mission: &Mission) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut seen: HashSet<&TaskId> = HashSet::new();

    for (index, task) in mission.tasks().iter().enumerate() {
        if task.id().as_str().trim().is_empty() {
            errors.push(ValidationError::EmptyTaskId { index });
        } else if !seen.insert(task.id()) {
            errors.push(ValidationError::DuplicateTaskId {
                task_id: task.id().clone(),
            });
        }
    }

    for task in mission.tasks() {
        for dep in task.dependencies() {
            if !seen.contains(dep) {
                errors.push(ValidationError::DanglingDependency {
                    task_id: task.id().clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    errors
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Three-color DFS over dependency edges, in declaration order.
///
/// Every back-edge yields one `CycleDetected` whose path starts and ends at
/// the same task. Iterative, so deep chains cannot overflow the stack.
fn find_cycles(mission: &Mission) -> Vec<ValidationError> {
    let tasks = mission.tasks();
    let index: HashMap<&TaskId, usize> = tasks.iter().enumerate().map(|(i, t)| (t.id(), i)).collect();
    let edges: Vec<Vec<usize>> = tasks
        .iter()
        .map(|t| t.dependencies().iter().filter_map(|d| index.get(d).copied()).collect())
        .collect();

    let mut color = vec![Color::White; tasks.len()];
    let mut errors = Vec::new();

    for root in 0..tasks.len() {
        if color[root] != Color::White {
            continue;
        }
        // (node, next edge to explore); the stack doubles as the current path
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        color[root] = Color::Gray;

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            if let Some(&target) = edges[node].get(top.1) {
                top.1 += 1;
                match color[target] {
                    Color::White => {
                        color[target] = Color::Gray;
                        stack.push((target, 0));
                    }
                    Color::Gray => {
                        let start = stack.iter().position(|&(n, _)| n == target).unwrap_or(0);
                        let mut path: Vec<TaskId> = stack[start..]
                            .iter()
                            .map(|&(n, _)| tasks[n].id().clone())
                            .collect();
                        path.push(tasks[target].id().clone());
                        errors.push(ValidationError::CycleDetected { path });
                    }
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                stack.pop();
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::RawTask;
    use crate::tools::testing::ScriptedTool;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> ToolRegistry {
        let registry = ToolRegistry::new();
        registry
            .register_tool(Arc::new(ScriptedTool::new("noop")))
            .unwrap();
        registry
            .register_tool(Arc::new(ScriptedTool::new("read").with_schema(json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }))))
            .unwrap();
        registry
    }

    fn plan(tasks: Vec<RawTask>) -> RawPlan {
        tasks.into_iter().fold(RawPlan::new("test"), RawPlan::with_task)
    }

    fn noop(id: &str) -> RawTask {
        RawTask::new(id, "noop", json!({}))
    }

    fn validate(p: RawPlan) -> ValidationResult {
        PlanValidator::default().validate_plan(p, 3, &registry())
    }

    #[test]
    fn test_valid_plan_accepted_in_topological_order() {
        let result = validate(plan(vec![
            noop("d").depends_on(["b", "c"]),
            noop("b").depends_on(["a"]),
            noop("c").depends_on(["a"]),
            noop("a"),
        ]));
        assert!(result.ok);
        let mission = result.mission.unwrap();
        assert_eq!(mission.status(), MissionStatus::Validated);

        let order = TopologicalScheduler::new(&mission).execution_order().unwrap();
        let pos = |id: &str| order.iter().position(|t| t.as_str() == id).unwrap();
        for task in mission.tasks() {
            for dep in task.dependencies() {
                assert!(pos(dep.as_str()) < pos(task.id().as_str()));
            }
        }
    }

    #[test]
    fn test_validation_is_idempotent() {
        let p = plan(vec![noop("a"), noop("b").depends_on(["a"]), noop("x").depends_on(["x"])]);
        let validator = PlanValidator::default();
        let registry = registry();
        let mission = Mission::from_plan(p, 3);
        assert_eq!(
            validator.check(&mission, &registry),
            validator.check(&mission, &registry)
        );
    }

    #[test]
    fn test_valid_plan_validates_identically_twice() {
        let mut p = plan(vec![noop("a"), noop("b").depends_on(["a"]).priority(2)]);
        p.id = Some(uuid::Uuid::new_v4().to_string());

        let first = validate(p.clone());
        let second = validate(p);
        assert!(first.ok && second.ok);
        assert_eq!(first.errors, second.errors);

        let (m1, m2) = (first.mission.unwrap(), second.mission.unwrap());
        assert_eq!(m1.id(), m2.id());
        assert_eq!(m1.status(), m2.status());
        assert_eq!(m1.tasks(), m2.tasks());
        assert_eq!(m1.metadata(), m2.metadata());
    }

    #[test]
    fn test_structure_errors_stop_early() {
        let result = validate(plan(vec![
            noop("a"),
            noop("a"),
            RawTask::new("b", "missing_tool", json!({})).depends_on(["ghost"]),
        ]));
        assert!(!result.ok);
        assert!(result.mission.is_none());
        assert_eq!(
            result.errors,
            vec![
                ValidationError::DuplicateTaskId {
                    task_id: TaskId::from("a")
                },
                ValidationError::DanglingDependency {
                    task_id: TaskId::from("b"),
                    dependency: TaskId::from("ghost")
                },
            ]
        );
    }

    #[test]
    fn test_cycle_path_returns_to_start() {
        let result = validate(plan(vec![
            noop("a").depends_on(["b"]),
            noop("b").depends_on(["c"]),
            noop("c").depends_on(["a"]),
            noop("d"),
        ]));
        let path = match &result.errors[..] {
            [ValidationError::CycleDetected { path }] => path.clone(),
            other => panic!("unexpected errors: {:?}", other),
        };
        assert_eq!(path.first(), path.last());
        let names: Vec<&str> = path.iter().map(TaskId::as_str).collect();
        assert_eq!(names, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let result = validate(plan(vec![noop("a").depends_on(["a"])]));
        assert_eq!(
            result.errors,
            vec![ValidationError::CycleDetected {
                path: vec![TaskId::from("a"), TaskId::from("a")]
            }]
        );
    }

    #[test]
    fn test_per_task_errors_collected() {
        let result = validate(plan(vec![
            RawTask::new("a", "search", json!({})),
            RawTask::new("b", "read", json!({"path": 5})),
            RawTask::new("c", "read", json!({"path": {"$from": "a"}})),
            noop("d").max_attempts(0),
        ]));
        let kinds: Vec<String> = result
            .errors
            .iter()
            .map(|e| serde_json::to_value(e).unwrap()["kind"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "unknown_tool",
                "schema_violation",
                "unbound_reference",
                "invalid_max_attempts"
            ]
        );
    }

    #[test]
    fn test_binding_to_dependency_accepted() {
        let result = validate(plan(vec![
            noop("a"),
            RawTask::new("b", "read", json!({"path": {"$from": "a", "pointer": "/p"}})).depends_on(["a"]),
        ]));
        assert!(result.ok, "{:?}", result.errors);
    }

    #[test]
    fn test_size_limits() {
        let validator = PlanValidator::new(PlanLimits {
            max_tasks: 2,
            max_depth: 2,
        });
        let result = validator.validate_plan(
            plan(vec![noop("a"), noop("b").depends_on(["a"]), noop("c").depends_on(["b"])]),
            3,
            &registry(),
        );
        assert_eq!(
            result.errors,
            vec![
                ValidationError::GraphTooLarge {
                    dimension: GraphDimension::Tasks,
                    actual: 3,
                    limit: 2
                },
                ValidationError::GraphTooLarge {
                    dimension: GraphDimension::Depth,
                    actual: 3,
                    limit: 2
                },
            ]
        );
    }

    #[test]
    fn test_errors_serialize_tagged() {
        let err = ValidationError::CycleDetected {
            path: vec![TaskId::from("a"), TaskId::from("a")],
        };
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"kind": "cycle_detected", "path": ["a", "a"]})
        );
        assert_eq!(err.to_string(), "dependency cycle: a -> a");
        assert_eq!(validate(RawPlan::new("empty")).errors, vec![ValidationError::EmptyPlan]);
    }
}
