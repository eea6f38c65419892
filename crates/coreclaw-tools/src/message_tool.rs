//! `message.send`: lets the agent proactively publish a reply through
//! the durable message bus, optionally to a chat other than the one the
//! call originated in.
//!
//! Follows `message_tool::MessageTool`'s tool-wraps-a-bus-publish
//! shape, retargeted from that crate's in-memory
//! `clawft_core::bus::MessageBus::dispatch_outbound` to
//! `coreclaw_core::bus::MessageBus::publish_outbound`, which takes a
//! full `OutboundEnvelope` rather than a bare message struct. `id` and
//! `created_at` are synthesized the same way the scheduler and
//! heartbeat source build synthetic envelopes. The `crossChat` argument
//! is read directly by `AgentRuntime::tool_call_context` to populate
//! `ToolCallContext::cross_chat`, which is what `ToolPolicy` uses to
//! require admin role for cross-chat sends (§4.6); this tool does not
//! re-check that itself, it trusts the policy gate already ran.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use coreclaw_core::bus::MessageBus;
use coreclaw_core::tools::registry::{Tool, ToolError};
use coreclaw_types::envelope::OutboundEnvelope;
use serde_json::{json, Value};
use uuid::Uuid;

pub struct MessageTool {
    bus: Arc<MessageBus>,
}

impl MessageTool {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        MessageTool { bus }
    }
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message.send"
    }

    fn description(&self) -> &str {
        "Send a message to a chat through the message bus"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "channel": { "type": "string" },
                "chatId": { "type": "string" },
                "content": { "type": "string" },
                "crossChat": {
                    "type": "boolean",
                    "description": "true if this targets a chat other than the one this tool call originated in"
                }
            },
            "required": ["channel", "chatId", "content"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
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

        let envelope = OutboundEnvelope {
            id: Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        };

        self.bus
            .publish_outbound(&envelope)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        Ok(json!({ "sent": true, "id": envelope.id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coreclaw_storage::Storage;
    use coreclaw_types::config::BusConfig;

    async fn harness() -> MessageTool {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("db.sqlite"), dir.path().join("backups"));
        storage.migrate().await.unwrap();
        std::mem::forget(dir);
        let bus = Arc::new(MessageBus::new(Arc::new(storage), BusConfig::default()));
        MessageTool::new(bus)
    }

    #[tokio::test]
    async fn sends_and_returns_id() {
        let tool = harness().await;
        let result = tool
            .execute(json!({ "channel": "cli", "chatId": "c1", "content": "hi" }))
            .await
            .unwrap();
        assert_eq!(result["sent"], true);
        assert!(result["id"].as_str().unwrap().len() > 0);
    }

    #[tokio::test]
    async fn missing_content_is_invalid_args() {
        let tool = harness().await;
        let err = tool
            .execute(json!({ "channel": "cli", "chatId": "c1" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }
}
