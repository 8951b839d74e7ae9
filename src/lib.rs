//! # Mission Orchestrator
//!
//! Single-process engine that turns a plan (a DAG of tool-bound tasks) into
//! an executed mission.
//!
//! This library provides:
//! - Plan validation before anything runs (cycles, unknown tools, bad args)
//! - A bounded worker pool shared by all missions
//! - Per-task retries with exponential backoff and per-tool circuit breakers
//! - An append-only attempt log and an event stream for observers
//!
//! ## Architecture
//!
//! ```text
//!   RawPlan ──▶ PlanValidator ──▶ Mission (Validated)
//!                                     │
//!                                     ▼
//!                         ┌──────────────────────┐
//!                         │  MissionOrchestrator │
//!                         │   driver per mission │
//!                         └──────────┬───────────┘
//!                                    │ dispatch (semaphore)
//!                                    ▼
//!   TaskExecutor ──▶ ToolInvocationPipeline ──▶ CircuitBreaker ──▶ Tool
//! ```
//!
//! ## Task Flow
//! 1. Submit a plan; it is validated into a mission or rejected with every error
//! 2. Run the mission; tasks become Ready once their dependencies succeed
//! 3. Each attempt goes through resolve, validate, invoke and result processing
//! 4. Failures are classified and retried, given up, or cascaded to dependents
//!
//! ## Modules
//! - `mission`: Mission, task and execution record types
//! - `tools`: Tool trait, registry and built-in tools
//! - `orchestrator`: Mission lifecycle and dispatch

pub mod bindings;
pub mod breaker;
pub mod config;
pub mod events;
pub mod executor;
pub mod mission;
pub mod orchestrator;
pub mod pipeline;
pub mod plan;
pub mod retry;
pub mod scheduler;
pub mod tools;
pub mod validation;

pub use config::EngineConfig;
pub use events::OrchestratorEvent;
pub use mission::{Mission, MissionId, MissionStatus, TaskId, TaskStatus};
pub use orchestrator::{MissionHandle, MissionOrchestrator, OrchestratorError};
pub use plan::{RawPlan, RawTask};
pub use tools::{Tool, ToolError, ToolRegistry};
pub use validation::{ValidationError, ValidationResult};
