//! Stdin/stdout dispatch for Coreclaw's isolated tool runtime (§4.5).
//!
//! `coreclaw_core::isolated::IsolatedToolRuntime::run_worker` always
//! re-invokes the current executable with a hidden `__coreclaw-worker`
//! subcommand and speaks this same protocol, so this crate is both a
//! standalone binary (for deployments that want a slimmer sandbox
//! image) and a library `coreclaw-cli` links to implement that hidden
//! subcommand without duplicating the dispatch logic. Either way the
//! protocol is: read one `{"tool", "payload"}` JSON object from stdin,
//! write one `{"ok":true,"result":...}` or `{"ok":false,"error":...}`
//! JSON object to stdout.
//!
//! The parent sets the child's working directory to
//! `config.workspace_path()` and clears its environment before spawn
//! (§4.5), so there is no config file path left for this process to
//! read: path-sensitive tools resolve against the process's current
//! directory rather than against a re-parsed `Config`. Bounds that
//! aren't workspace-relative (`web.fetch`'s body cap/timeout) fall back
//! to `WebFetchConfig::default()` for the same reason — a customized
//! bound would need `CORECLAW_CONFIG` added to `allowedEnv` for the
//! worker to see it, which is noted but not wired up here.
//!
//! Follows `clawft-tools::spawn_tool`'s child-process pattern for the
//! overall shape; the per-tool dispatch itself just calls the same
//! `pub` direct-executor functions `coreclaw-tools`'s in-process `Tool`
//! impls call when isolation is disabled, so there is exactly one place
//! each tool's real behavior lives.

use std::time::Duration;

use coreclaw_core::tools::registry::ToolError;
use coreclaw_tools::{fs_tools, shell_tool, web_fetch};
use coreclaw_types::config::WebFetchConfig;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Deserialize)]
struct WorkerRequest {
    tool: String,
    payload: Value,
}

/// Reads one request from stdin, dispatches it, and writes the response
/// to stdout. Never returns an `Err` for a tool-level failure — those
/// become `{"ok":false,...}` on stdout, matching `parse_worker_response`'s
/// expectations in `coreclaw_core::isolated`. Only protocol-level
/// failures (can't read stdin, can't parse the request, can't write
/// stdout) return `Err`.
pub async fn run_stdio() -> anyhow::Result<()> {
    let mut input = Vec::new();
    tokio::io::stdin().read_to_end(&mut input).await?;

    let response = match serde_json::from_slice::<WorkerRequest>(&input) {
        Ok(request) => match dispatch(&request).await {
            Ok(result) => json!({ "ok": true, "result": result }),
            Err(e) => json!({ "ok": false, "error": e.to_string() }),
        },
        Err(e) => json!({ "ok": false, "error": format!("invalid worker request: {e}") }),
    };

    let bytes = serde_json::to_vec(&response)?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&bytes).await?;
    stdout.flush().await?;
    Ok(())
}

async fn dispatch(request: &WorkerRequest) -> Result<Value, ToolError> {
    let workspace = std::env::current_dir()
        .map_err(|e| ToolError::ExecutionFailed(format!("cannot read cwd: {e}")))?;

    match request.tool.as_str() {
        "fs.write" => {
            let path = required_str(&request.payload, "path")?;
            let content = required_str(&request.payload, "content")?;
            fs_tools::write_file_direct(&workspace, path, content).await?;
            Ok(json!({ "written": true, "path": path }))
        }
        "shell.exec" => {
            let command = required_str(&request.payload, "command")?;
            let timeout_secs = request
                .payload
                .get("timeoutSecs")
                .and_then(|v| v.as_u64())
                .unwrap_or(30);
            let argv = shell_tool::tokenize(command)?;
            let result =
                shell_tool::run_direct(&argv, &workspace, Duration::from_secs(timeout_secs)).await?;
            Ok(json!({
                "stdout": result.stdout,
                "stderr": result.stderr,
                "exitCode": result.exit_code,
            }))
        }
        "web.fetch" => {
            let url = required_str(&request.payload, "url")?;
            let result = web_fetch::run_direct(url, &WebFetchConfig::default()).await?;
            Ok(json!({
                "status": result.status,
                "headers": result.headers,
                "body": result.body,
                "truncated": result.truncated,
            }))
        }
        other => Err(ToolError::NotFound(other.to_string())),
    }
}

fn required_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidArgs(format!("missing '{field}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_fs_write_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let request = WorkerRequest {
            tool: "fs.write".to_string(),
            payload: json!({ "path": "note.txt", "content": "hi" }),
        };
        let result = dispatch(&request).await.unwrap();
        assert_eq!(result["written"], true);
        assert_eq!(std::fs::read_to_string(dir.path().join("note.txt")).unwrap(), "hi");

        std::env::set_current_dir(original).unwrap();
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_is_not_found() {
        let request = WorkerRequest {
            tool: "mystery.tool".to_string(),
            payload: json!({}),
        };
        let err = dispatch(&request).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }
}
