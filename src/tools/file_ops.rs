//! File operation tools: read and write files.
//!
//! Paths resolve relative to the workspace:
//! - `output/report.md` → `{workspace}/output/report.md`
//! - `/etc/hosts` → absolute paths are used as-is

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{io_error, resolve_path, InvocationContext, Tool, ToolError};

/// Read the contents of a text file.
pub struct ReadFile {
    workspace: PathBuf,
}

impl ReadFile {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file's contents, optionally restricted to a line range."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace"
                },
                "start_line": {
                    "type": "integer",
                    "description": "Optional: start reading from this line number (1-indexed)"
                },
                "end_line": {
                    "type": "integer",
                    "description": "Optional: stop reading at this line number (inclusive)"
                }
            },
            "required": ["path"]
        })
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| ToolError::permanent("Missing 'path' argument"))?;
        let full_path = resolve_path(path, &self.workspace);

        let bytes = tokio::fs::read(&full_path)
            .await
            .map_err(|e| io_error(&format!("cannot read {}", full_path.display()), e))?;
        let size = bytes.len();
        let content = String::from_utf8(bytes).map_err(|_| {
            ToolError::permanent(format!("Binary file detected: {} ({} bytes)", path, size))
        })?;

        let start_line = args["start_line"].as_u64().map(|n| n as usize);
        let end_line = args["end_line"].as_u64().map(|n| n as usize);

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();

        let content = if start_line.is_some() || end_line.is_some() {
            let start = start_line.unwrap_or(1).saturating_sub(1).min(total_lines);
            let end = end_line.unwrap_or(total_lines).min(total_lines);
            let (start, end) = if start > end { (end, start) } else { (start, end) };
            lines[start..end].join("\n")
        } else {
            content
        };

        Ok(json!({
            "path": path,
            "content": content,
            "total_lines": total_lines,
            "bytes": size,
        }))
    }
}

/// Write content to a file (create or overwrite).
///
/// Not idempotent when `append` is set, so it is registered as
/// non-idempotent as a whole.
pub struct WriteFile {
    workspace: PathBuf,
}

impl WriteFile {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text to a file, creating parent directories as needed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path, relative to the workspace"},
                "content": {"type": "string", "description": "Text to write"},
                "append": {"type": "boolean", "default": false}
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| ToolError::permanent("Missing 'path' argument"))?;
        let content = args["content"]
            .as_str()
            .ok_or_else(|| ToolError::permanent("Missing 'content' argument"))?;
        let append = args["append"].as_bool().unwrap_or(false);

        let full_path = resolve_path(path, &self.workspace);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("cannot create parent directory", e))?;
        }

        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&full_path)
                .await
                .map_err(|e| io_error(&format!("cannot open {}", full_path.display()), e))?;
            file.write_all(content.as_bytes())
                .await
                .map_err(|e| io_error("write failed", e))?;
        } else {
            tokio::fs::write(&full_path, content)
                .await
                .map_err(|e| io_error(&format!("cannot write {}", full_path.display()), e))?;
        }

        Ok(json!({
            "path": path,
            "bytes_written": content.len(),
            "appended": append,
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
    async fn test_read_line_range() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "one\ntwo\nthree\nfour").unwrap();

        let tool = ReadFile::new(dir.path().to_path_buf());
        let out = tool
            .execute(json!({"path": "f.txt", "start_line": 2, "end_line": 3}), &ctx())
            .await
            .unwrap();
        assert_eq!(out["content"], json!("two\nthree"));
        assert_eq!(out["total_lines"], json!(4));
    }

    #[tokio::test]
    async fn test_binary_file_is_permanent_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bin"), [0xff, 0xfe, 0x00]).unwrap();

        let tool = ReadFile::new(dir.path().to_path_buf());
        let err = tool.execute(json!({"path": "bin"}), &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("Binary file detected"));
    }

    #[tokio::test]
    async fn test_write_then_append() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WriteFile::new(dir.path().to_path_buf());

        tool.execute(json!({"path": "out/log.txt", "content": "a"}), &ctx())
            .await
            .unwrap();
        tool.execute(
            json!({"path": "out/log.txt", "content": "b", "append": true}),
            &ctx(),
        )
        .await
        .unwrap();

        let text = std::fs::read_to_string(dir.path().join("out/log.txt")).unwrap();
        assert_eq!(text, "ab");
    }
}
