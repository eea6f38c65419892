//! Isolated Tool Runtime (§4.5): runs a fixed set of high-risk tools
//! (`shell.exec`, `web.fetch`, `fs.write`) in a child process, fed and
//! read back over a JSON stdin/stdout protocol.
//!
//! Grounded on `clawft-tools::spawn_tool`'s child-process-with-a-
//! concurrency-gauge pattern (there an `AtomicUsize`, here a
//! `tokio::sync::Semaphore` since the cap needs to block rather than
//! reject) and `clawft-core::agent::sandbox`'s `Arc<Mutex<_>>`
//! decision-logging idiom, generalized into a per-tool circuit breaker.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use coreclaw_types::config::{Config, IsolationConfig};
use coreclaw_types::error::{CoreclawError, Result};
use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

const OUTPUT_SLACK_CHARS: usize = 4096;
const WORKER_SUBCOMMAND: &str = "__coreclaw-worker";
const ALLOWED_ENV_SYSTEM_KEYS: &[&str] = &["PATH", "HOME", "TMPDIR"];

#[derive(Debug, Default, Clone, Copy)]
struct CircuitState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Serialize)]
struct WorkerRequest<'a> {
    tool: &'a str,
    payload: serde_json::Value,
}

pub struct IsolatedToolRuntime {
    config: Arc<Config>,
    isolation: IsolationConfig,
    semaphore: Arc<Semaphore>,
    circuits: Mutex<HashMap<String, CircuitState>>,
    env_key_pattern: Regex,
}

impl IsolatedToolRuntime {
    pub fn new(config: Arc<Config>) -> Self {
        let isolation = config.isolation.clone();
        let semaphore = Arc::new(Semaphore::new(isolation.max_concurrent_workers.max(1)));
        IsolatedToolRuntime {
            config,
            isolation,
            semaphore,
            circuits: Mutex::new(HashMap::new()),
            env_key_pattern: Regex::new("^[A-Z_][A-Z0-9_]*$").unwrap(),
        }
    }

    pub fn handles(&self, tool_name: &str) -> bool {
        self.isolation.enabled && self.isolation.tool_names.iter().any(|n| n == tool_name)
    }

    /// `command_timeout_ms`, when given, is the caller's own deadline for
    /// the tool call (e.g. `shell.exec`'s `timeoutSecs`); the worker's
    /// process-level deadline is `max(workerTimeoutMs, commandTimeoutMs +
    /// 2000)` so a long-running but legitimate command isn't killed before
    /// it gets to report its own timeout.
    pub async fn execute(
        &self,
        tool_name: &str,
        payload: serde_json::Value,
        command_timeout_ms: Option<u64>,
    ) -> Result<serde_json::Value> {
        self.check_circuit(tool_name).await?;

        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closed");

        let result = self.run_worker(tool_name, payload, command_timeout_ms).await;
        self.record_outcome(tool_name, result.is_ok()).await;
        result
    }

    async fn check_circuit(&self, tool_name: &str) -> Result<()> {
        let circuits = self.circuits.lock().await;
        if let Some(state) = circuits.get(tool_name) {
            if let Some(opened_at) = state.opened_at {
                let reset_after = Duration::from_millis(self.isolation.circuit_reset_ms);
                if opened_at.elapsed() < reset_after {
                    let retry_after_ms = reset_after.saturating_sub(opened_at.elapsed()).as_millis() as u64;
                    return Err(CoreclawError::CircuitOpen {
                        tool: tool_name.to_string(),
                        retry_after_ms,
                    });
                }
            }
        }
        Ok(())
    }

    async fn record_outcome(&self, tool_name: &str, success: bool) {
        let mut circuits = self.circuits.lock().await;
        let state = circuits.entry(tool_name.to_string()).or_default();
        if success {
            state.consecutive_failures = 0;
            state.opened_at = None;
        } else {
            state.consecutive_failures += 1;
            if state.consecutive_failures >= self.isolation.open_circuit_after_failures {
                state.opened_at = Some(Instant::now());
                warn!(tool = tool_name, failures = state.consecutive_failures, "circuit opened");
            }
        }
    }

    async fn run_worker(
        &self,
        tool_name: &str,
        payload: serde_json::Value,
        command_timeout_ms: Option<u64>,
    ) -> Result<serde_json::Value> {
        let exe = std::env::current_exe().map_err(|e| CoreclawError::IsolatedWorkerFailure {
            reason: format!("cannot locate current executable: {e}"),
        })?;

        let mut command = Command::new(exe);
        command
            .arg(WORKER_SUBCOMMAND)
            .current_dir(self.config.workspace_path())
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for key in ALLOWED_ENV_SYSTEM_KEYS {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        for key in &self.config.allowed_env {
            if self.env_key_pattern.is_match(key) {
                if let Ok(value) = std::env::var(key) {
                    command.env(key, value);
                }
            }
        }

        let mut child = command.spawn().map_err(|e| CoreclawError::IsolatedWorkerFailure {
            reason: format!("failed to spawn worker: {e}"),
        })?;

        let request = WorkerRequest {
            tool: tool_name,
            payload,
        };
        let request_bytes = serde_json::to_vec(&request)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&request_bytes)
                .await
                .map_err(|e| CoreclawError::IsolatedWorkerFailure {
                    reason: format!("failed to write worker request: {e}"),
                })?;
        }

        let effective_timeout_ms = match command_timeout_ms {
            Some(cmd_ms) => self.isolation.worker_timeout_ms.max(cmd_ms + 2000),
            None => self.isolation.worker_timeout_ms,
        };
        let timeout = Duration::from_millis(effective_timeout_ms);
        let max_output = self.isolation.max_worker_output_chars + OUTPUT_SLACK_CHARS;

        let read_result = tokio::time::timeout(timeout, read_bounded_stdout(&mut child, max_output)).await;

        let output = match read_result {
            Ok(inner) => inner,
            Err(_) => {
                terminate_worker(&mut child).await;
                return Err(CoreclawError::IsolatedWorkerFailure {
                    reason: format!("worker timed out after {effective_timeout_ms}ms"),
                });
            }
        }?;

        let _ = child.wait().await;

        parse_worker_response(&output, self.isolation.max_worker_output_chars)
    }
}

async fn read_bounded_stdout(child: &mut tokio::process::Child, max_output: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut stdout) = child.stdout.take() {
        let mut chunk = [0u8; 4096];
        loop {
            let n = stdout
                .read(&mut chunk)
                .await
                .map_err(|e| CoreclawError::IsolatedWorkerFailure {
                    reason: format!("failed to read worker output: {e}"),
                })?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.len() > max_output {
                break;
            }
        }
    }
    Ok(buf)
}

async fn terminate_worker(child: &mut tokio::process::Child) {
    if let Some(id) = child.id() {
        info!(pid = id, "terminating isolated worker after timeout");
    }
    let _ = child.start_kill();
    let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
    let _ = child.start_kill();
}

fn parse_worker_response(output: &[u8], max_result_chars: usize) -> Result<serde_json::Value> {
    if output.is_empty() {
        return Err(CoreclawError::IsolatedWorkerFailure {
            reason: "output exceeded limit".to_string(),
        });
    }
    let parsed: serde_json::Value = serde_json::from_slice(output)?;
    let ok = parsed.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
    if ok {
        let result = parsed.get("result").cloned().unwrap_or(serde_json::Value::Null);
        if let Some(s) = result.as_str() {
            if s.chars().count() > max_result_chars {
                let truncated: String = s.chars().take(max_result_chars).collect();
                return Ok(serde_json::Value::String(format!("{truncated}\n...truncated")));
            }
        }
        Ok(result)
    } else {
        let error = parsed
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown worker error")
            .to_string();
        Err(CoreclawError::IsolatedWorkerFailure { reason: error })
    }
}
