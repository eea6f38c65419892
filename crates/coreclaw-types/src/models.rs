//! Row types for the persisted entities described by the data model.
//!
//! These mirror the Storage schema one-to-one; [`crate::storage`] callers
//! map `rusqlite::Row`s into these structs (storage itself lives in the
//! `coreclaw-storage` crate, which depends on this one).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    Admin,
    Normal,
}

impl Default for ChatRole {
    fn default() -> Self {
        ChatRole::Normal
    }
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatRole::Admin => "admin",
            ChatRole::Normal => "normal",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "admin" => ChatRole::Admin,
            _ => ChatRole::Normal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chat {
    pub id: i64,
    pub channel: String,
    pub chat_id: String,
    pub role: ChatRole,
    pub registered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "user" => MessageRole::User,
            "assistant" => MessageRole::Assistant,
            "system" => MessageRole::System,
            "tool" => MessageRole::Tool,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub chat_fk: i64,
    pub role: MessageRole,
    pub sender_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    pub chat_fk: i64,
    pub summary: Option<String>,
    pub enabled_skills: Vec<String>,
    pub last_compact_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Processed,
    DeadLetter,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Processed => "processed",
            QueueStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => QueueStatus::Processing,
            "processed" => QueueStatus::Processed,
            "dead_letter" => QueueStatus::DeadLetter,
            _ => QueueStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusQueueRecord {
    pub id: i64,
    pub direction: crate::envelope::Direction,
    pub payload: String,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    InProgress,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::InProgress => "in_progress",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => ExecutionStatus::Completed,
            "failed" => ExecutionStatus::Failed,
            _ => ExecutionStatus::InProgress,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InboundExecution {
    pub message_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result_content: Option<String>,
    pub outbound_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Cron,
    Interval,
    Once,
}

impl ScheduleType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleType::Cron => "cron",
            ScheduleType::Interval => "interval",
            ScheduleType::Once => "once",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "interval" => ScheduleType::Interval,
            "once" => ScheduleType::Once,
            _ => ScheduleType::Cron,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Done,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "paused" => TaskStatus::Paused,
            "done" => TaskStatus::Done,
            _ => TaskStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskContextMode {
    Group,
    Isolated,
}

impl TaskContextMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskContextMode::Group => "group",
            TaskContextMode::Isolated => "isolated",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "isolated" => TaskContextMode::Isolated,
            _ => TaskContextMode::Group,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub chat_fk: i64,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub context_mode: TaskContextMode,
    pub status: TaskStatus,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct TaskRun {
    pub id: i64,
    pub task_fk: i64,
    pub status: TaskRunStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Ok,
    Denied,
    Error,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditOutcome::Ok => "ok",
            AuditOutcome::Denied => "denied",
            AuditOutcome::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub id: i64,
    pub kind: String,
    pub tool_name: Option<String>,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
    pub args_json: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Applied,
    Failed,
}

#[derive(Debug, Clone)]
pub struct MigrationHistory {
    pub id: String,
    pub status: MigrationStatus,
    pub backup_path: String,
    pub applied_at: DateTime<Utc>,
}
