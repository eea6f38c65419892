//! Tool implementations for Coreclaw.
//!
//! Each module owns one or two tools plus a `pub` direct-executor
//! function that does the actual work (filesystem write, process spawn,
//! HTTP fetch). The `Tool::execute` impls in this crate call that
//! executor directly when the isolated tool runtime is disabled or
//! doesn't cover that tool name, and delegate to
//! `coreclaw_core::isolated::IsolatedToolRuntime::execute` otherwise.
//! `coreclaw-worker`'s sandboxed child process calls the same executors
//! against the payload it reads from stdin, so there is exactly one
//! place each tool's real behavior is implemented.

pub mod chat_register_tool;
pub mod fs_tools;
pub mod memory_tool;
pub mod message_tool;
pub mod shell_tool;
pub mod web_fetch;

use std::path::PathBuf;
use std::sync::Arc;

use coreclaw_core::bus::MessageBus;
use coreclaw_core::isolated::IsolatedToolRuntime;
use coreclaw_core::tools::policy::ToolPolicy;
use coreclaw_core::tools::registry::ToolRegistry;
use coreclaw_storage::Storage;
use coreclaw_types::config::Config;

/// Register every tool the agent runtime can call. `workspace` is the
/// already-expanded workspace directory (`config.workspace_path()`);
/// callers typically pass that in directly.
pub fn register_all(
    registry: &mut ToolRegistry,
    workspace: PathBuf,
    config: Arc<Config>,
    policy: Arc<ToolPolicy>,
    isolated: Arc<IsolatedToolRuntime>,
    bus: Arc<MessageBus>,
    storage: Arc<Storage>,
) {
    registry.register(Arc::new(fs_tools::ReadFileTool::new(workspace.clone())));
    registry.register(Arc::new(fs_tools::WriteFileTool::new(workspace.clone(), isolated.clone())));
    registry.register(Arc::new(fs_tools::EditFileTool::new(workspace.clone())));
    registry.register(Arc::new(fs_tools::ListDirectoryTool::new(workspace.clone())));

    registry.register(Arc::new(shell_tool::ShellExecTool::new(
        workspace.clone(),
        config.clone(),
        isolated.clone(),
    )));

    registry.register(Arc::new(web_fetch::WebFetchTool::new(
        policy.clone(),
        config.web_fetch.clone(),
        isolated,
    )));

    registry.register(Arc::new(memory_tool::MemoryReadTool::new(workspace.clone())));
    registry.register(Arc::new(memory_tool::MemoryWriteTool::new(workspace)));

    registry.register(Arc::new(message_tool::MessageTool::new(bus)));

    registry.register(Arc::new(chat_register_tool::ChatRegisterTool::new(policy, storage)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_all_registers_every_tool() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path().join("db.sqlite"), dir.path().join("backups")));
        storage.migrate().await.unwrap();
        std::mem::forget(dir);

        let mut config = Config::default();
        config.isolation.enabled = false;
        let config = Arc::new(config);
        let policy = Arc::new(ToolPolicy::new(config.clone(), storage.clone()));
        let isolated = Arc::new(IsolatedToolRuntime::new(config.clone()));
        let bus = Arc::new(MessageBus::new(storage.clone(), config.bus.clone()));

        let mut registry = ToolRegistry::new();
        register_all(
            &mut registry,
            config.workspace_path(),
            config,
            policy,
            isolated,
            bus,
            storage,
        );

        let names = registry.list();
        for expected in [
            "fs.read",
            "fs.write",
            "fs.edit",
            "fs.list",
            "shell.exec",
            "web.fetch",
            "memory.read",
            "memory.write",
            "message.send",
            "chat.register",
        ] {
            assert!(names.contains(&expected.to_string()), "missing tool: {expected}");
        }
    }
}
