//! Directory listing tool.
//!
//! Paths resolve relative to the workspace:
//! - `src/` → lists `{workspace}/src/`
//! - `/var/log` → absolute paths are used as-is
//!
//! Entry paths are reported relative to the workspace (absolute when the
//! entry lies outside it), so they can be passed straight to `read_file`.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use walkdir::WalkDir;

use super::{io_error, resolve_path, InvocationContext, Tool, ToolError};

/// Hard cap on returned entries.
const MAX_ENTRIES: usize = 1000;

/// List contents of a directory.
pub struct ListDirectory {
    workspace: PathBuf,
}

impl ListDirectory {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ListDirectory {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List files and directories. Use '.' for the workspace root or a relative path like 'src/'."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path, relative to the workspace",
                    "default": "."
                },
                "max_depth": {
                    "type": "integer",
                    "description": "Maximum depth to traverse",
                    "default": 1
                }
            }
        })
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        let path = args["path"].as_str().unwrap_or(".");
        let max_depth = args["max_depth"].as_u64().unwrap_or(1).max(1) as usize;

        let full_path = resolve_path(path, &self.workspace);
        let metadata = std::fs::metadata(&full_path)
            .map_err(|e| io_error(&format!("cannot list {}", full_path.display()), e))?;
        if !metadata.is_dir() {
            return Err(ToolError::permanent(format!("Not a directory: {}", path)));
        }

        let mut entries = Vec::new();
        let mut truncated = false;
        let walker = WalkDir::new(&full_path)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name();

        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            if entries.len() >= MAX_ENTRIES {
                truncated = true;
                break;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.workspace)
                .unwrap_or(entry.path());
            entries.push(json!({
                "path": relative.to_string_lossy(),
                "is_dir": entry.file_type().is_dir(),
                "depth": entry.depth(),
            }));
        }

        Ok(json!({
            "path": path,
            "count": entries.len(),
            "entries": entries,
            "truncated": truncated,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::{MissionId, TaskId};
    use std::time::Duration;

    fn ctx() -> InvocationContext {
        InvocationContext::new(MissionId::new(), TaskId::from("t"), 1, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_lists_sorted_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/deep.txt"), "x").unwrap();

        let tool = ListDirectory::new(dir.path().to_path_buf());
        let out = tool
            .execute(json!({"path": ".", "max_depth": 1}), &ctx())
            .await
            .unwrap();

        let names: Vec<&str> = out["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["path"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert_eq!(out["truncated"], json!(false));
    }

    #[tokio::test]
    async fn test_subdirectory_entries_are_workspace_relative() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/notes.txt"), "hello").unwrap();

        let tool = ListDirectory::new(dir.path().to_path_buf());
        let out = tool.execute(json!({"path": "docs"}), &ctx()).await.unwrap();

        let entry = out["entries"][0]["path"].as_str().unwrap();
        assert_eq!(std::path::Path::new(entry), std::path::Path::new("docs/notes.txt"));
        assert!(resolve_path(entry, dir.path()).is_file());
    }

    #[tokio::test]
    async fn test_missing_directory_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ListDirectory::new(dir.path().to_path_buf());
        let err = tool
            .execute(json!({"path": "nope"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ToolError::Execution { class: crate::tools::ErrorClass::Permanent, .. }
        ));
    }
}
