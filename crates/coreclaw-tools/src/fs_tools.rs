//! Workspace-sandboxed filesystem tools: `fs.read`, `fs.write`, `fs.edit`,
//! `fs.list`.
//!
//! Follows `file_tools::{validate_path, validate_parent_path}`'s shape:
//! canonicalize the requested path, canonicalize the workspace root,
//! and require the former to start with the latter. That containment
//! check is what stops a symlink planted inside the workspace from
//! resolving to a target outside it. That crate's `Platform` indirection
//! (native vs. browser filesystem) is dropped; this crate only ever
//! runs natively, so the direct-executor functions
//! below call `tokio::fs`/`std::fs` directly and are reused verbatim by
//! both the in-process `Tool` impls and the `coreclaw-worker` binary's
//! `fs.write` isolated path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use coreclaw_core::isolated::IsolatedToolRuntime;
use coreclaw_core::tools::registry::{Tool, ToolError};
use coreclaw_types::config::Config;
use serde_json::{json, Value};

/// Resolve `path` relative to `workspace`, rejecting anything that
/// escapes the workspace root once symlinks are resolved.
pub fn validate_path(path: &str, workspace: &Path) -> Result<PathBuf, ToolError> {
    let joined = workspace.join(path);
    let canonical = std::fs::canonicalize(&joined)
        .map_err(|_| ToolError::FileNotFound(path.to_string()))?;
    let workspace_canonical = std::fs::canonicalize(workspace)
        .map_err(|e| ToolError::ExecutionFailed(format!("cannot canonicalize workspace: {e}")))?;
    if !canonical.starts_with(&workspace_canonical) {
        return Err(ToolError::InvalidPath(format!("path escapes workspace: {path}")));
    }
    Ok(canonical)
}

/// Same containment check as [`validate_path`], but for a path that may
/// not exist yet (write targets): walks up to the nearest existing
/// ancestor, canonicalizes that, and checks containment there.
pub fn validate_parent_path(path: &str, workspace: &Path) -> Result<PathBuf, ToolError> {
    let joined = workspace.join(path);
    let workspace_canonical = std::fs::canonicalize(workspace)
        .map_err(|e| ToolError::ExecutionFailed(format!("cannot canonicalize workspace: {e}")))?;

    let mut ancestor = joined.clone();
    let existing = loop {
        if ancestor.exists() {
            break ancestor.clone();
        }
        match ancestor.parent() {
            Some(parent) => ancestor = parent.to_path_buf(),
            None => return Err(ToolError::InvalidPath(format!("no existing ancestor for: {path}"))),
        }
    };
    let existing_canonical = std::fs::canonicalize(&existing)
        .map_err(|e| ToolError::ExecutionFailed(format!("cannot canonicalize ancestor: {e}")))?;
    if !existing_canonical.starts_with(&workspace_canonical) {
        return Err(ToolError::InvalidPath(format!("path escapes workspace: {path}")));
    }
    Ok(joined)
}

fn required_str(args: &Value, field: &str) -> Result<String, ToolError> {
    args.get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ToolError::InvalidArgs(format!("missing '{field}'")))
}

pub async fn read_file_direct(workspace: &Path, path: &str) -> Result<String, ToolError> {
    let resolved = validate_path(path, workspace)?;
    tokio::fs::read_to_string(&resolved)
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to read {path}: {e}")))
}

pub async fn write_file_direct(workspace: &Path, path: &str, content: &str) -> Result<(), ToolError> {
    let resolved = validate_parent_path(path, workspace)?;
    if let Some(parent) = resolved.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to create parent dirs: {e}")))?;
    }
    tokio::fs::write(&resolved, content)
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to write {path}: {e}")))
}

pub async fn edit_file_direct(
    workspace: &Path,
    path: &str,
    old_text: &str,
    new_text: &str,
) -> Result<(), ToolError> {
    let resolved = validate_path(path, workspace)?;
    let content = tokio::fs::read_to_string(&resolved)
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to read {path}: {e}")))?;
    let occurrences = content.matches(old_text).count();
    if occurrences == 0 {
        return Err(ToolError::InvalidArgs(format!("old_text not found in {path}")));
    }
    if occurrences > 1 {
        return Err(ToolError::InvalidArgs(format!(
            "old_text occurs {occurrences} times in {path}, must be unique"
        )));
    }
    let updated = content.replacen(old_text, new_text, 1);
    tokio::fs::write(&resolved, updated)
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to write {path}: {e}")))
}

pub async fn list_directory_direct(workspace: &Path, path: &str) -> Result<Value, ToolError> {
    let resolved = validate_path(path, workspace)?;
    let mut read_dir = tokio::fs::read_dir(&resolved)
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to list {path}: {e}")))?;
    let mut entries = Vec::new();
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to read directory entry: {e}")))?
    {
        let metadata = entry
            .metadata()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to stat entry: {e}")))?;
        entries.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "is_dir": metadata.is_dir(),
            "size": metadata.len(),
        }));
    }
    entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    Ok(Value::Array(entries))
}

pub struct ReadFileTool {
    workspace: PathBuf,
}

impl ReadFileTool {
    pub fn new(workspace: PathBuf) -> Self {
        ReadFileTool { workspace }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "fs.read"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let path = required_str(&args, "path")?;
        let content = read_file_direct(&self.workspace, &path).await?;
        Ok(json!({ "content": content }))
    }
}

/// `fs.write` is one of the three isolatable tools (§4.5): when the
/// isolated runtime handles it, the actual write happens inside the
/// sandboxed worker process; this wrapper only decides whether to
/// delegate or fall back to the in-process executor.
pub struct WriteFileTool {
    workspace: PathBuf,
    isolated: Arc<IsolatedToolRuntime>,
}

impl WriteFileTool {
    pub fn new(workspace: PathBuf, isolated: Arc<IsolatedToolRuntime>) -> Self {
        WriteFileTool { workspace, isolated }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "fs.write"
    }

    fn description(&self) -> &str {
        "Write a text file to the workspace, creating parent directories as needed"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let path = required_str(&args, "path")?;
        let content = required_str(&args, "content")?;

        if self.isolated.handles("fs.write") {
            let payload = json!({ "path": path, "content": content });
            self.isolated
                .execute("fs.write", payload, None)
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        } else {
            write_file_direct(&self.workspace, &path, &content).await?;
        }
        Ok(json!({ "written": true, "path": path }))
    }
}

pub struct EditFileTool {
    workspace: PathBuf,
}

impl EditFileTool {
    pub fn new(workspace: PathBuf) -> Self {
        EditFileTool { workspace }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "fs.edit"
    }

    fn description(&self) -> &str {
        "Replace a unique occurrence of old_text with new_text in a workspace file"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "old_text": { "type": "string" },
                "new_text": { "type": "string" }
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let path = required_str(&args, "path")?;
        let old_text = required_str(&args, "old_text")?;
        let new_text = required_str(&args, "new_text")?;
        edit_file_direct(&self.workspace, &path, &old_text, &new_text).await?;
        Ok(json!({ "edited": true, "path": path }))
    }
}

pub struct ListDirectoryTool {
    workspace: PathBuf,
}

impl ListDirectoryTool {
    pub fn new(workspace: PathBuf) -> Self {
        ListDirectoryTool { workspace }
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "fs.list"
    }

    fn description(&self) -> &str {
        "List the entries of a workspace directory"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let path = required_str(&args, "path")?;
        let entries = list_directory_direct(&self.workspace, &path).await?;
        Ok(json!({ "entries": entries }))
    }
}

/// Used by `coreclaw-worker` to resolve the workspace root for the
/// sandboxed `fs.write` path without depending on `ToolPolicy`.
pub fn workspace_root(config: &Config) -> PathBuf {
    config.workspace_path()
}
