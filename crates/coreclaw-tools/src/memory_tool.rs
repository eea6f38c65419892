//! `memory.read`/`memory.write`: paragraph-search and append/overwrite
//! access to the per-chat or global memory file the system prompt draws
//! on.
//!
//! Follows `memory_tool::{MemoryReadTool, MemoryWriteTool}`'s
//! `search_paragraphs`/append-or-overwrite shape, but retargeted from a
//! single `~/.clawft/workspace/memory/MEMORY.md` to the per-scope files
//! `coreclaw_core::agent::context` already reads into the prompt
//! (`memory/global.md`, or `memory/{channel}_{sanitized(chatId)}.md`),
//! using its `chat_memory_filename`/`sanitize_chat_id` helpers directly
//! so a write here lands exactly where the context builder looks. The
//! optional `vector-memory` feature (`HashEmbedder`/`VectorStore`) some
//! reference crates carry has no counterpart in this workspace and is
//! dropped; scope is plain substring paragraph search.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use coreclaw_core::agent::context::{chat_memory_filename, GLOBAL_MEMORY_FILE};
use coreclaw_core::tools::registry::{Tool, ToolError};
use coreclaw_types::models::Chat;
use serde_json::{json, Value};

fn memory_path(workspace: &Path, scope: &str, chat: &Chat) -> Result<PathBuf, ToolError> {
    let relative = match scope {
        "global" => GLOBAL_MEMORY_FILE.to_string(),
        "chat" => chat_memory_filename(&chat.channel, &chat.chat_id),
        other => return Err(ToolError::InvalidArgs(format!("unknown scope '{other}'"))),
    };
    Ok(workspace.join(relative))
}

/// Case-insensitive substring match over paragraphs (blocks separated by
/// a blank line), mirroring `memory_tool::search_paragraphs`.
pub fn search_paragraphs(content: &str, query: &str) -> Vec<String> {
    if query.is_empty() {
        return content.split("\n\n").map(|p| p.to_string()).collect();
    }
    let needle = query.to_lowercase();
    content
        .split("\n\n")
        .filter(|p| p.to_lowercase().contains(&needle))
        .map(|p| p.to_string())
        .collect()
}

pub struct MemoryReadTool {
    workspace: PathBuf,
}

impl MemoryReadTool {
    pub fn new(workspace: PathBuf) -> Self {
        MemoryReadTool { workspace }
    }
}

#[async_trait]
impl Tool for MemoryReadTool {
    fn name(&self) -> &str {
        "memory.read"
    }

    fn description(&self) -> &str {
        "Search the chat or global memory file for paragraphs matching a query"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "scope": { "type": "string", "enum": ["chat", "global"] },
                "channel": { "type": "string" },
                "chatId": { "type": "string" },
                "query": { "type": "string" }
            },
            "required": ["scope", "channel", "chatId"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let scope = args.get("scope").and_then(|v| v.as_str()).unwrap_or("chat");
        let channel = args
            .get("channel")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs("missing 'channel'".into()))?;
        let chat_id = args
            .get("chatId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs("missing 'chatId'".into()))?;
        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("");

        let chat = Chat {
            id: 0,
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            role: Default::default(),
            registered: false,
        };
        let path = memory_path(&self.workspace, scope, &chat)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(_) => return Ok(json!({ "paragraphs": [] })),
        };
        let paragraphs = search_paragraphs(&content, query);
        Ok(json!({ "paragraphs": paragraphs }))
    }
}

pub struct MemoryWriteTool {
    workspace: PathBuf,
}

impl MemoryWriteTool {
    pub fn new(workspace: PathBuf) -> Self {
        MemoryWriteTool { workspace }
    }
}

#[async_trait]
impl Tool for MemoryWriteTool {
    fn name(&self) -> &str {
        "memory.write"
    }

    fn description(&self) -> &str {
        "Append to or overwrite the chat or global memory file"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "scope": { "type": "string", "enum": ["chat", "global"] },
                "channel": { "type": "string" },
                "chatId": { "type": "string" },
                "content": { "type": "string" },
                "mode": { "type": "string", "enum": ["append", "overwrite"] }
            },
            "required": ["scope", "channel", "chatId", "content"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let scope = args.get("scope").and_then(|v| v.as_str()).unwrap_or("chat");
        let channel = args
            .get("channel")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs("missing 'channel'".into()))?;
        let chat_id = args
            .get("chatId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs("missing 'chatId'".into()))?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs("missing 'content'".into()))?;
        let mode = args.get("mode").and_then(|v| v.as_str()).unwrap_or("append");

        let chat = Chat {
            id: 0,
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            role: Default::default(),
            registered: false,
        };
        let path = memory_path(&self.workspace, scope, &chat)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::ExecutionFailed(format!("failed to create memory dir: {e}")))?;
        }

        match mode {
            "overwrite" => {
                tokio::fs::write(&path, content)
                    .await
                    .map_err(|e| ToolError::ExecutionFailed(format!("failed to write memory: {e}")))?;
            }
            "append" => {
                let existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
                let updated = if existing.is_empty() {
                    content.to_string()
                } else {
                    format!("{existing}\n\n{content}")
                };
                tokio::fs::write(&path, updated)
                    .await
                    .map_err(|e| ToolError::ExecutionFailed(format!("failed to write memory: {e}")))?;
            }
            other => return Err(ToolError::InvalidArgs(format!("unknown mode '{other}'"))),
        }
        Ok(json!({ "written": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_paragraphs_matches_case_insensitively() {
        let content = "Alpha paragraph\n\nBeta note\n\nGamma detail";
        let hits = search_paragraphs(content, "beta");
        assert_eq!(hits, vec!["Beta note"]);
    }

    #[test]
    fn search_paragraphs_empty_query_returns_all() {
        let content = "a\n\nb";
        assert_eq!(search_paragraphs(content, ""), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn append_then_overwrite_global_memory() {
        let dir = tempfile::tempdir().unwrap();
        let tool = MemoryWriteTool::new(dir.path().to_path_buf());
        tool.execute(json!({
            "scope": "global", "channel": "cli", "chatId": "c1",
            "content": "first", "mode": "append"
        }))
        .await
        .unwrap();
        tool.execute(json!({
            "scope": "global", "channel": "cli", "chatId": "c1",
            "content": "second", "mode": "append"
        }))
        .await
        .unwrap();
        let written = tokio::fs::read_to_string(dir.path().join(GLOBAL_MEMORY_FILE)).await.unwrap();
        assert_eq!(written, "first\n\nsecond");
    }

    #[tokio::test]
    async fn chat_scope_targets_sanitized_filename() {
        let dir = tempfile::tempdir().unwrap();
        let write = MemoryWriteTool::new(dir.path().to_path_buf());
        write
            .execute(json!({
                "scope": "chat", "channel": "telegram", "chatId": "abc/def",
                "content": "note", "mode": "append"
            }))
            .await
            .unwrap();
        let expected = dir.path().join(chat_memory_filename("telegram", "abc/def"));
        assert!(expected.exists());
    }
}
