//! Ordered migration list.
//!
//! Applied in order by [`crate::Storage::migrate`]; each entry's SQL runs
//! inside a single transaction after a pre-migration file backup is taken.

pub struct Migration {
    pub id: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        id: "0001_init",
        sql: r#"
CREATE TABLE IF NOT EXISTS chats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,
    chat_id TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'normal',
    registered INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    UNIQUE(channel, chat_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_fk INTEGER NOT NULL REFERENCES chats(id),
    role TEXT NOT NULL,
    sender_id TEXT,
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_chat_fk ON messages(chat_fk, id);

CREATE TABLE IF NOT EXISTS conversation_state (
    chat_fk INTEGER PRIMARY KEY REFERENCES chats(id),
    summary TEXT,
    enabled_skills TEXT NOT NULL DEFAULT '[]',
    last_compact_at INTEGER
);

CREATE TABLE IF NOT EXISTS bus_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    direction TEXT NOT NULL,
    message_id TEXT NOT NULL,
    channel TEXT NOT NULL,
    chat_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    next_attempt_at INTEGER NOT NULL,
    claimed_at INTEGER,
    last_error TEXT,
    dead_lettered_at INTEGER,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_bus_queue_dispatch
    ON bus_queue(direction, status, next_attempt_at, created_at);
CREATE INDEX IF NOT EXISTS idx_bus_queue_rate
    ON bus_queue(direction, channel, chat_id, created_at);

CREATE TABLE IF NOT EXISTS message_dedupe (
    direction TEXT NOT NULL,
    message_id TEXT NOT NULL,
    queue_id INTEGER NOT NULL REFERENCES bus_queue(id),
    PRIMARY KEY (direction, message_id)
);

CREATE TABLE IF NOT EXISTS inbound_execution (
    message_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    result_content TEXT,
    outbound_id TEXT
);

CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_fk INTEGER NOT NULL REFERENCES chats(id),
    prompt TEXT NOT NULL,
    schedule_type TEXT NOT NULL,
    schedule_value TEXT NOT NULL,
    context_mode TEXT NOT NULL DEFAULT 'group',
    status TEXT NOT NULL DEFAULT 'active',
    next_run_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(status, next_run_at);

CREATE TABLE IF NOT EXISTS task_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_fk INTEGER NOT NULL REFERENCES tasks(id),
    status TEXT NOT NULL,
    error TEXT,
    started_at INTEGER NOT NULL,
    finished_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    tool_name TEXT,
    outcome TEXT NOT NULL,
    reason TEXT,
    args_json TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS migration_history (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    backup_path TEXT NOT NULL,
    applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS meta_kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#,
    },
];
