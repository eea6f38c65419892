//! `shell.exec`: spawns a command directly (no shell interpreter),
//! gated by `allowShell` and an `allowedShellCommands` allowlist on
//! `argv[0]`.
//!
//! Follows `shell_tool::ShellExecTool`'s timeout-then-kill shape
//! (`tokio::time::timeout` racing the child, `child.kill()` on expiry),
//! but the command line itself is no longer handed to `sh -c`: it is
//! tokenized here (quote- and backslash-escape-aware) and spawned as
//! `argv[0]` with the remaining tokens as arguments, per the isolated
//! tool runtime's "spawn without a shell interpreter" requirement. This
//! also removes the class of vulnerability a substring-based
//! `DANGEROUS_PATTERNS` check was papering over: `"; rm -rf /"`
//! tokenizes to a literal argument rather than a second command.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coreclaw_core::isolated::IsolatedToolRuntime;
use coreclaw_core::tools::registry::{Tool, ToolError};
use coreclaw_types::config::Config;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_OUTPUT_BYTES: usize = 200_000;

/// Tokenize a command line the way a POSIX shell would split words,
/// without interpreting any of the shell metacharacters that make a
/// second command possible (`;`, `|`, `&&`, backticks, `$(...)`, etc. are
/// all just literal characters here). Supports single quotes, double
/// quotes, and backslash escapes outside quotes. Returns an error on an
/// unterminated quote.
pub fn tokenize(command: &str) -> Result<Vec<String>, ToolError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\n' if !in_token => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            '\'' => {
                in_token = true;
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '\'' {
                        closed = true;
                        break;
                    }
                    current.push(c);
                }
                if !closed {
                    return Err(ToolError::InvalidArgs("unterminated single quote".into()));
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') if matches!(chars.peek(), Some('"') | Some('\\')) => {
                            current.push(chars.next().unwrap());
                        }
                        Some(c) => current.push(c),
                        None => return Err(ToolError::InvalidArgs("unterminated double quote".into())),
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => return Err(ToolError::InvalidArgs("trailing backslash".into())),
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
        if !in_token && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

pub struct ShellExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Spawn `argv` directly under `workspace`, bounding output and
/// enforcing `timeout`. This is the isolated worker's actual execution
/// logic, reused by the in-process fallback when isolation is off.
pub async fn run_direct(
    argv: &[String],
    workspace: &std::path::Path,
    timeout: Duration,
) -> Result<ShellExecResult, ToolError> {
    let Some((program, rest)) = argv.split_first() else {
        return Err(ToolError::InvalidArgs("empty command".into()));
    };

    let mut command = Command::new(program);
    command
        .args(rest)
        .current_dir(workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn '{program}': {e}")))?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_fut = async {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.take(MAX_OUTPUT_BYTES as u64).read_to_end(&mut stdout).await;
        }
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.take(MAX_OUTPUT_BYTES as u64).read_to_end(&mut stderr).await;
        }
        let status = child.wait().await;
        (stdout, stderr, status)
    };

    match tokio::time::timeout(timeout, read_fut).await {
        Ok((stdout, stderr, status)) => {
            let exit_code = status.ok().and_then(|s| s.code());
            Ok(ShellExecResult {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                exit_code,
            })
        }
        Err(_) => Err(ToolError::Timeout(timeout.as_secs())),
    }
}

fn check_allowlist(config: &Config, argv: &[String]) -> Result<(), ToolError> {
    if !config.allow_shell {
        return Err(ToolError::PermissionDenied {
            tool: "shell.exec".into(),
            reason: "shell execution is disabled".into(),
        });
    }
    let Some(program) = argv.first() else {
        return Err(ToolError::InvalidArgs("empty command".into()));
    };
    if !config.allowed_shell_commands.is_empty()
        && !config.allowed_shell_commands.iter().any(|allowed| allowed == program)
    {
        return Err(ToolError::PermissionDenied {
            tool: "shell.exec".into(),
            reason: format!("'{program}' is not in allowedShellCommands"),
        });
    }
    Ok(())
}

pub struct ShellExecTool {
    workspace: PathBuf,
    config: Arc<Config>,
    isolated: Arc<IsolatedToolRuntime>,
}

impl ShellExecTool {
    pub fn new(workspace: PathBuf, config: Arc<Config>, isolated: Arc<IsolatedToolRuntime>) -> Self {
        ShellExecTool { workspace, config, isolated }
    }
}

#[async_trait]
impl Tool for ShellExecTool {
    fn name(&self) -> &str {
        "shell.exec"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace without a shell interpreter"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string" },
                "timeoutSecs": { "type": "integer" }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs("missing 'command'".into()))?;
        let timeout_secs = args
            .get("timeoutSecs")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let argv = tokenize(command)?;
        check_allowlist(&self.config, &argv)?;

        if self.isolated.handles("shell.exec") {
            let payload = json!({ "command": command, "timeoutSecs": timeout_secs });
            let result = self
                .isolated
                .execute("shell.exec", payload, Some(timeout_secs * 1000))
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            return Ok(result);
        }

        let result = run_direct(&argv, &self.workspace, Duration::from_secs(timeout_secs)).await?;
        Ok(json!({
            "stdout": result.stdout,
            "stderr": result.stderr,
            "exitCode": result.exit_code,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_splits_on_whitespace() {
        assert_eq!(tokenize("echo hi there").unwrap(), vec!["echo", "hi", "there"]);
    }

    #[test]
    fn tokenize_respects_double_quotes() {
        assert_eq!(tokenize(r#"echo "hi there""#).unwrap(), vec!["echo", "hi there"]);
    }

    #[test]
    fn tokenize_respects_single_quotes() {
        assert_eq!(tokenize("echo 'a b; rm -rf /'").unwrap(), vec!["echo", "a b; rm -rf /"]);
    }

    #[test]
    fn tokenize_rejects_unterminated_quote() {
        assert!(tokenize("echo \"unterminated").is_err());
    }

    #[test]
    fn shell_metacharacters_are_literal_arguments() {
        let tokens = tokenize("echo hi; rm -rf /").unwrap();
        assert_eq!(tokens, vec!["echo", "hi;", "rm", "-rf", "/"]);
    }

    #[tokio::test]
    async fn allow_shell_false_denies() {
        let config = Config::default();
        let err = check_allowlist(&config, &["echo".into()]).unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn allowlist_rejects_unlisted_command() {
        let mut config = Config::default();
        config.allow_shell = true;
        config.allowed_shell_commands = vec!["ls".into()];
        let err = check_allowlist(&config, &["rm".into(), "-rf".into(), "/".into()]).unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn run_direct_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_direct(
            &["echo".into(), "hello".into()],
            dir.path(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn run_direct_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_direct(
            &["sleep".into(), "5".into()],
            dir.path(),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }
}
