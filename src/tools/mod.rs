//! Tool system for mission tasks.
//!
//! Every task is bound to exactly one tool. Tools are registered in an
//! explicit [`ToolRegistry`] that is handed to the validator and the
//! invocation pipeline; there is no process-global registry.
//!
//! ## Registration-time checking
//!
//! A tool's argument schema is parsed when it is registered, so a plan that
//! names an unknown tool or omits a required argument is rejected by the
//! validator before anything runs.

mod directory;
mod error;
mod file_ops;
pub mod schema;
mod summarize;
#[cfg(test)]
pub(crate) mod testing;

pub use directory::ListDirectory;
pub use error::{ErrorClass, FieldError, ToolError};
pub use file_ops::{ReadFile, WriteFile};
pub use schema::{ArgumentSchema, SchemaError};
pub use summarize::Summarize;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::mission::{MissionId, TaskId};

/// Resolve a path relative to the workspace.
///
/// - Relative paths are joined with `workspace`
/// - Absolute paths are used as-is
pub fn resolve_path(path_str: &str, workspace: &Path) -> PathBuf {
    let path = Path::new(path_str);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

/// Map an I/O failure onto a classified tool error.
pub(crate) fn io_error(context: &str, err: std::io::Error) -> ToolError {
    use std::io::ErrorKind;
    let message = format!("{}: {}", context, err);
    match err.kind() {
        ErrorKind::NotFound
        | ErrorKind::PermissionDenied
        | ErrorKind::InvalidInput
        | ErrorKind::InvalidData
        | ErrorKind::AlreadyExists => ToolError::permanent(message),
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            ToolError::transient(message)
        }
        _ => ToolError::Other(anyhow::Error::new(err).context(context.to_string())),
    }
}

/// Per-attempt information handed to a tool handler.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub mission_id: MissionId,
    pub task_id: TaskId,
    /// 1-based attempt number
    pub attempt: u32,
    /// Budget for this attempt; the pipeline enforces it as well
    pub timeout: Duration,
    /// Stable across retries of the same task
    pub idempotency_key: String,
}

impl InvocationContext {
    pub fn new(mission_id: MissionId, task_id: TaskId, attempt: u32, timeout: Duration) -> Self {
        let idempotency_key = idempotency_key(mission_id, &task_id);
        Self {
            mission_id,
            task_id,
            attempt,
            timeout,
            idempotency_key,
        }
    }
}

/// Derive the idempotency key of a task: hex SHA-256 over mission and task id.
pub fn idempotency_key(mission_id: MissionId, task_id: &TaskId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"mission-orchestrator:task:");
    hasher.update(mission_id.as_uuid().as_bytes());
    hasher.update(b":");
    hasher.update(task_id.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Information about a tool for display purposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub idempotent: bool,
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Whether repeating a call with the same arguments is harmless.
    fn is_idempotent(&self) -> bool {
        false
    }

    /// Execute the tool with already-validated arguments.
    async fn execute(&self, args: Value, ctx: &InvocationContext) -> Result<Value, ToolError>;
}

/// Everything the pipeline needs to call a tool.
#[derive(Clone)]
pub struct ToolDescriptor {
    name: String,
    description: String,
    schema: ArgumentSchema,
    idempotent: bool,
    handler: Arc<dyn Tool>,
}

impl ToolDescriptor {
    /// Build a descriptor from a handler's own metadata.
    pub fn from_tool(handler: Arc<dyn Tool>) -> Result<Self, RegistryError> {
        let name = handler.name().to_string();
        let schema = handler.parameters_schema();
        Self::new(name, &schema, handler.clone())
            .map(|d| d.with_description(handler.description()).idempotent(handler.is_idempotent()))
    }

    /// Build a descriptor under an explicit name and schema.
    pub fn new(
        name: impl Into<String>,
        schema: &Value,
        handler: Arc<dyn Tool>,
    ) -> Result<Self, RegistryError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let schema = ArgumentSchema::from_json(schema).map_err(|source| {
            RegistryError::InvalidSchema {
                tool: name.clone(),
                source,
            }
        })?;
        Ok(Self {
            name,
            description: String::new(),
            schema,
            idempotent: false,
            handler,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn schema(&self) -> &ArgumentSchema {
        &self.schema
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn handler(&self) -> &Arc<dyn Tool> {
        &self.handler
    }
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("idempotent", &self.idempotent)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Errors raised while registering tools.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Tool name cannot be empty")]
    EmptyName,

    #[error("Tool '{0}' is already registered")]
    Duplicate(String),

    #[error("Tool '{tool}' has an invalid argument schema: {source}")]
    InvalidSchema {
        tool: String,
        #[source]
        source: SchemaError,
    },
}

/// Registry of available tools, keyed by name.
///
/// Cheap to share behind an `Arc`; lookups take a read lock only long
/// enough to clone the descriptor handle.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<ToolDescriptor>>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in file and text tools.
    pub fn with_builtins(workspace: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let workspace = workspace.into();
        let registry = Self::new();
        registry.register_tool(Arc::new(ListDirectory::new(workspace.clone())))?;
        registry.register_tool(Arc::new(ReadFile::new(workspace.clone())))?;
        registry.register_tool(Arc::new(WriteFile::new(workspace)))?;
        registry.register_tool(Arc::new(Summarize))?;

        tracing::info!(tools = registry.len(), "Registered built-in tools");
        Ok(registry)
    }

    /// Register a descriptor under its name.
    pub fn register(&self, descriptor: ToolDescriptor) -> Result<(), RegistryError> {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        if tools.contains_key(descriptor.name()) {
            return Err(RegistryError::Duplicate(descriptor.name().to_string()));
        }
        tracing::debug!(tool = %descriptor.name(), idempotent = descriptor.is_idempotent(), "Registered tool");
        tools.insert(descriptor.name().to_string(), Arc::new(descriptor));
        Ok(())
    }

    /// Register a handler using its own name, schema and idempotency flag.
    pub fn register_tool(&self, handler: Arc<dyn Tool>) -> Result<(), RegistryError> {
        self.register(ToolDescriptor::from_tool(handler)?)
    }

    /// Register or overwrite a descriptor, returning the previous one.
    pub fn replace(&self, descriptor: ToolDescriptor) -> Option<Arc<ToolDescriptor>> {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        tools.insert(descriptor.name().to_string(), Arc::new(descriptor))
    }

    /// Look up a tool, failing with `ToolError::UnknownTool` on a miss.
    pub fn resolve(&self, name: &str) -> Result<Arc<ToolDescriptor>, ToolError> {
        self.get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        tools.get(name).cloned()
    }

    /// Check if a tool exists by name.
    pub fn has_tool(&self, name: &str) -> bool {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        tools.contains_key(name)
    }

    /// List all available tools, sorted by name.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        let mut infos: Vec<ToolInfo> = tools
            .values()
            .map(|d| ToolInfo {
                name: d.name().to_string(),
                description: d.description().to_string(),
                idempotent: d.is_idempotent(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.list_tools().into_iter().map(|t| t.name).collect();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}
