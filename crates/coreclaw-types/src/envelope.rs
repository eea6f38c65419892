//! Inbound/outbound envelopes carried on the [message bus](crate).
//!
//! These are the durable payloads a channel hands to `publishInbound`/
//! `publishOutbound`; they are serialized as the `payload` column of a
//! `BusQueueRecord` and deserialized again on claim.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Direction a `BusQueueRecord` travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// A message arriving from a channel (real) or synthesized by the
/// scheduler/heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub id: String,
    pub channel: String,
    pub chat_id: String,
    #[serde(default)]
    pub sender_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl InboundEnvelope {
    pub fn is_heartbeat(&self) -> bool {
        self.metadata
            .get("isHeartbeat")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_scheduled_task(&self) -> bool {
        self.metadata
            .get("isScheduledTask")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn scheduled_context_mode(&self) -> Option<&str> {
        self.metadata.get("contextMode").and_then(Value::as_str)
    }

    pub fn task_id(&self) -> Option<&str> {
        self.metadata.get("taskId").and_then(Value::as_str)
    }
}

/// A reply destined for a channel's `send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub id: String,
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// The run mode derived from an inbound envelope, governing prompt
/// assembly and suppression policy (§4.7, §4.9 of the design).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Chat,
    Heartbeat,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    Group,
    Isolated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunMode {
    pub kind: RunKind,
    pub context_mode: ContextMode,
}

impl RunMode {
    /// Include chat history/memory context iff `kind=chat` or the mode
    /// is `group`.
    pub fn includes_chat_context(&self) -> bool {
        matches!(self.kind, RunKind::Chat) || matches!(self.context_mode, ContextMode::Group)
    }

    pub fn derive(envelope: &InboundEnvelope) -> RunMode {
        if envelope.is_heartbeat() {
            return RunMode {
                kind: RunKind::Heartbeat,
                context_mode: ContextMode::Group,
            };
        }
        if envelope.is_scheduled_task() {
            let context_mode = match envelope.scheduled_context_mode() {
                Some("isolated") => ContextMode::Isolated,
                _ => ContextMode::Group,
            };
            return RunMode {
                kind: RunKind::Scheduled,
                context_mode,
            };
        }
        RunMode {
            kind: RunKind::Chat,
            context_mode: ContextMode::Group,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(metadata: HashMap<String, Value>) -> InboundEnvelope {
        InboundEnvelope {
            id: "e1".into(),
            channel: "cli".into(),
            chat_id: "c1".into(),
            sender_id: None,
            content: "hi".into(),
            created_at: Utc::now(),
            metadata,
        }
    }

    #[test]
    fn derive_chat_mode_by_default() {
        let mode = RunMode::derive(&envelope(HashMap::new()));
        assert_eq!(mode.kind, RunKind::Chat);
        assert!(mode.includes_chat_context());
    }

    #[test]
    fn derive_heartbeat_mode() {
        let mut meta = HashMap::new();
        meta.insert("isHeartbeat".into(), Value::Bool(true));
        let mode = RunMode::derive(&envelope(meta));
        assert_eq!(mode.kind, RunKind::Heartbeat);
        assert_eq!(mode.context_mode, ContextMode::Group);
    }

    #[test]
    fn derive_scheduled_isolated_mode() {
        let mut meta = HashMap::new();
        meta.insert("isScheduledTask".into(), Value::Bool(true));
        meta.insert("contextMode".into(), Value::String("isolated".into()));
        let mode = RunMode::derive(&envelope(meta));
        assert_eq!(mode.kind, RunKind::Scheduled);
        assert_eq!(mode.context_mode, ContextMode::Isolated);
        assert!(!mode.includes_chat_context());
    }

    #[test]
    fn scheduled_group_mode_includes_context() {
        let mut meta = HashMap::new();
        meta.insert("isScheduledTask".into(), Value::Bool(true));
        let mode = RunMode::derive(&envelope(meta));
        assert!(mode.includes_chat_context());
    }
}
