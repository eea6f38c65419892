//! Bounded tool-calling loop against a language-model provider (§4.8).
//!
//! Follows `clawft_llm`'s provider-call shape: this loop itself is new
//! (nothing in the reference crates has a bounded tool-calling driver
//! of its own), built directly from `coreclaw_llm::Provider`/
//! `ChatRequest`/`ChatResponse` and the policy-gated `ToolRegistry`.

use std::sync::Arc;
use std::time::Duration;

use coreclaw_llm::{ChatMessage, ChatRequest, FunctionCall, Provider, ProviderError, ToolCall};
use coreclaw_types::config::Config;
use coreclaw_types::error::{CoreclawError, Result};
use coreclaw_types::models::ChatRole;
use tracing::{debug, warn};

use super::context::LlmMessage;
use crate::observability::Observability;
use crate::tools::policy::{PolicyDecision, ToolCallContext, ToolPolicy};
use crate::tools::ToolRegistry;

const EXHAUSTED_SENTINEL: &str = "Unable to complete the request within tool limits.";

/// Result of one completed agent run.
pub struct AgentOutcome {
    /// The final assistant content.
    pub content: String,
    /// Every message appended during the run (assistant tool-call
    /// messages and tool-result messages), for persistence/history.
    pub tool_messages: Vec<LlmMessage>,
}

pub struct AgentRuntime {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    policy: Arc<ToolPolicy>,
    config: Arc<Config>,
    observability: Arc<Observability>,
}

impl AgentRuntime {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        policy: Arc<ToolPolicy>,
        config: Arc<Config>,
        observability: Arc<Observability>,
    ) -> Self {
        AgentRuntime {
            provider,
            tools,
            policy,
            config,
            observability,
        }
    }

    pub async fn run(&self, messages: Vec<LlmMessage>, role: ChatRole) -> Result<AgentOutcome> {
        let mut chat_messages: Vec<ChatMessage> = messages
            .into_iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content,
                tool_call_id: m.tool_call_id,
                tool_calls: None,
            })
            .collect();
        let mut appended: Vec<LlmMessage> = Vec::new();

        for _ in 0..self.config.max_tool_iterations {
            let schemas = self.tools.schemas();
            let request = ChatRequest {
                model: self.config.provider.model.clone(),
                messages: chat_messages.clone(),
                max_tokens: None,
                temperature: Some(self.config.provider.temperature as f64),
                tools: schemas,
            };

            let timeout_ms = self.config.provider.timeout_ms;
            let response = match tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.provider.complete(&request),
            )
            .await
            {
                Ok(Ok(resp)) => resp,
                Ok(Err(e)) => return Err(map_provider_error(e)),
                Err(_) => {
                    return Err(CoreclawError::ProviderTimeout {
                        operation: format!("chat completion timed out after {timeout_ms}ms"),
                    })
                }
            };

            let Some(choice) = response.choices.into_iter().next() else {
                return Err(CoreclawError::ProviderInvalidResponse {
                    reason: "response had no choices".to_string(),
                });
            };
            let message = choice.message;

            if let Some(tool_calls) = message.tool_calls.clone() {
                if !tool_calls.is_empty() {
                    let assistant_msg = ChatMessage {
                        role: "assistant".to_string(),
                        content: message.content.clone(),
                        tool_call_id: None,
                        tool_calls: Some(tool_calls.clone()),
                    };
                    appended.push(LlmMessage {
                        role: assistant_msg.role.clone(),
                        content: assistant_msg.content.clone(),
                        tool_call_id: None,
                    });
                    chat_messages.push(assistant_msg);

                    for call in &tool_calls {
                        let result_content = self.execute_tool_call(call, role).await;
                        let tool_msg = ChatMessage {
                            role: "tool".to_string(),
                            content: result_content.clone(),
                            tool_call_id: Some(call.id.clone()),
                            tool_calls: None,
                        };
                        appended.push(LlmMessage {
                            role: tool_msg.role.clone(),
                            content: tool_msg.content.clone(),
                            tool_call_id: tool_msg.tool_call_id.clone(),
                        });
                        chat_messages.push(tool_msg);
                    }
                    continue;
                }
            }

            return Ok(AgentOutcome {
                content: message.content,
                tool_messages: appended,
            });
        }

        warn!(
            max_iterations = self.config.max_tool_iterations,
            "agent runtime exhausted tool iterations"
        );
        Ok(AgentOutcome {
            content: EXHAUSTED_SENTINEL.to_string(),
            tool_messages: appended,
        })
    }

    async fn execute_tool_call(&self, call: &ToolCall, role: ChatRole) -> String {
        let FunctionCall { name, arguments } = &call.function;
        let args: serde_json::Value = match serde_json::from_str(arguments) {
            Ok(v) => v,
            Err(_) => serde_json::Value::Object(Default::default()),
        };

        let ctx = tool_call_context(name, &args);
        match self.policy.check(name, role, &args, &ctx).await {
            Ok(decision) if !decision.is_allowed() => {
                let reason = match decision {
                    PolicyDecision::Deny { reason } => reason,
                    PolicyDecision::Allow => unreachable!(),
                };
                return format!("Tool error: {reason}");
            }
            Err(e) => return format!("Tool error: {e}"),
            Ok(_) => {}
        }

        debug!(tool = %name, "invoking tool");
        let started = std::time::Instant::now();
        let outcome = self.tools.execute(name, args).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        self.observability.record_tool_call(name, outcome.is_ok(), latency_ms);
        if let Some(server) = name.strip_prefix("mcp.").and_then(|s| s.split('.').next()) {
            self.observability.record_mcp_call(server, outcome.is_ok());
        }

        match outcome {
            Ok(result) => {
                let rendered = result.to_string();
                truncate_tool_output(&rendered, self.config.max_tool_output_chars)
            }
            Err(e) => format!("Tool error: {e}"),
        }
    }
}

fn tool_call_context(tool_name: &str, args: &serde_json::Value) -> ToolCallContext {
    ToolCallContext {
        fs_path: if tool_name == "fs.write" {
            args.get("path").and_then(|v| v.as_str()).map(String::from)
        } else {
            None
        },
        memory_scope: if tool_name == "memory.write" {
            args.get("scope").and_then(|v| v.as_str()).map(String::from)
        } else {
            None
        },
        cross_chat: tool_name == "message.send" && args.get("crossChat").and_then(|v| v.as_bool()).unwrap_or(false),
    }
}

fn truncate_tool_output(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let truncated: String = content.chars().take(max_chars).collect();
    format!("{truncated}\n...truncated")
}

fn map_provider_error(e: ProviderError) -> CoreclawError {
    match e {
        ProviderError::RateLimited { retry_after_ms } => CoreclawError::RateLimited { retry_after_ms },
        ProviderError::Timeout => CoreclawError::ProviderTimeout {
            operation: "chat completion".to_string(),
        },
        other => CoreclawError::ProviderInvalidResponse {
            reason: other.to_string(),
        },
    }
}
