//! `chat.register`: the admin bootstrap protocol's entry point. A chat
//! proves it holds the configured bootstrap key and is promoted to
//! admin role on success.
//!
//! No equivalent exists in the reference crates (none of them has a
//! bootstrap protocol); grounded on `coreclaw_core::tools::policy::ToolPolicy::
//! attempt_bootstrap`, which already implements the single-use,
//! attempt-counter, and lockout rules over `coreclaw_storage::Storage`'s
//! `meta` table. This tool's only job is to call that, then actually
//! perform the role promotion and registration flag `attempt_bootstrap`
//! deliberately leaves to its caller.

use std::sync::Arc;

use async_trait::async_trait;
use coreclaw_core::tools::policy::ToolPolicy;
use coreclaw_core::tools::registry::{Tool, ToolError};
use coreclaw_storage::Storage;
use coreclaw_types::models::ChatRole;
use serde_json::{json, Value};

pub struct ChatRegisterTool {
    policy: Arc<ToolPolicy>,
    storage: Arc<Storage>,
}

impl ChatRegisterTool {
    pub fn new(policy: Arc<ToolPolicy>, storage: Arc<Storage>) -> Self {
        ChatRegisterTool { policy, storage }
    }
}

#[async_trait]
impl Tool for ChatRegisterTool {
    fn name(&self) -> &str {
        "chat.register"
    }

    fn description(&self) -> &str {
        "Redeem the admin bootstrap key to promote this chat to admin role"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "chatFk": { "type": "integer" },
                "key": { "type": "string" }
            },
            "required": ["chatFk", "key"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let chat_fk = args
            .get("chatFk")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ToolError::InvalidArgs("missing 'chatFk'".into()))?;
        let key = args
            .get("key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs("missing 'key'".into()))?;

        let decision = self
            .policy
            .attempt_bootstrap(chat_fk, key)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        if !decision.is_allowed() {
            return Err(ToolError::PermissionDenied {
                tool: "chat.register".into(),
                reason: format!("{decision:?}"),
            });
        }

        self.storage
            .set_chat_role(chat_fk, ChatRole::Admin)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        self.storage
            .set_chat_registered(chat_fk, true)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        Ok(json!({ "promoted": true, "chatFk": chat_fk }))
    }
}
