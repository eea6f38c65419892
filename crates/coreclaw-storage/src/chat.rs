use chrono::Utc;
use coreclaw_types::error::{CoreclawError, Result};
use coreclaw_types::models::{Chat, ChatRole, ConversationState};
use rusqlite::OptionalExtension;

use crate::{spawn_blocking_storage, Storage};

impl Storage {
    /// Look up a chat by (channel, chatId), inserting a fresh `normal`,
    /// unregistered row on first reference. Chats are never deleted.
    pub async fn get_or_create_chat(&self, channel: &str, chat_id: &str) -> Result<Chat> {
        let this = self.clone();
        let channel = channel.to_string();
        let chat_id = chat_id.to_string();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            if let Some(chat) = query_chat(&conn, &channel, &chat_id)? {
                return Ok(chat);
            }
            conn.execute(
                "INSERT INTO chats (channel, chat_id, role, registered, created_at) VALUES (?1, ?2, 'normal', 0, ?3)",
                rusqlite::params![channel, chat_id, Utc::now().timestamp_millis()],
            )
            .map_err(storage_err)?;
            query_chat(&conn, &channel, &chat_id)?.ok_or_else(|| {
                CoreclawError::Storage("chat vanished after insert".into())
            })
        })
        .await
    }

    /// All known chats, oldest first. Used by the heartbeat source to
    /// enumerate wake targets — there is no per-chat opt-out, heartbeat
    /// applies to every chat whenever `heartbeat.enabled` is set.
    pub async fn list_chats(&self) -> Result<Vec<Chat>> {
        let this = self.clone();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            let mut stmt = conn
                .prepare("SELECT id, channel, chat_id, role, registered FROM chats ORDER BY id ASC")
                .map_err(storage_err)?;
            let rows = stmt.query_map([], map_chat_row).map_err(storage_err)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
        .await
    }

    pub async fn get_chat_by_fk(&self, chat_fk: i64) -> Result<Option<Chat>> {
        let this = self.clone();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            conn.query_row(
                "SELECT id, channel, chat_id, role, registered FROM chats WHERE id = ?1",
                [chat_fk],
                map_chat_row,
            )
            .optional()
            .map_err(storage_err)
        })
        .await
    }

    pub async fn set_chat_role(&self, chat_fk: i64, role: ChatRole) -> Result<()> {
        let this = self.clone();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            conn.execute(
                "UPDATE chats SET role = ?1 WHERE id = ?2",
                rusqlite::params![role.as_str(), chat_fk],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    pub async fn set_chat_registered(&self, chat_fk: i64, registered: bool) -> Result<()> {
        let this = self.clone();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            conn.execute(
                "UPDATE chats SET registered = ?1 WHERE id = ?2",
                rusqlite::params![registered as i64, chat_fk],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    /// Whether any chat already holds the admin role; used by the
    /// admin-bootstrap protocol to refuse a second elevation.
    pub async fn any_admin_exists(&self) -> Result<bool> {
        let this = self.clone();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM chats WHERE role = 'admin'",
                    [],
                    |row| row.get(0),
                )
                .map_err(storage_err)?;
            Ok(count > 0)
        })
        .await
    }

    pub async fn get_conversation_state(&self, chat_fk: i64) -> Result<ConversationState> {
        let this = self.clone();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            let row = conn
                .query_row(
                    "SELECT chat_fk, summary, enabled_skills, last_compact_at FROM conversation_state WHERE chat_fk = ?1",
                    [chat_fk],
                    |row| {
                        let skills_json: String = row.get(2)?;
                        let last_compact_ms: Option<i64> = row.get(3)?;
                        Ok(ConversationState {
                            chat_fk: row.get(0)?,
                            summary: row.get(1)?,
                            enabled_skills: serde_json::from_str(&skills_json).unwrap_or_default(),
                            last_compact_at: last_compact_ms.and_then(coreclaw_types::cron::ms_to_datetime),
                        })
                    },
                )
                .optional()
                .map_err(storage_err)?;
            Ok(row.unwrap_or(ConversationState {
                chat_fk,
                ..Default::default()
            }))
        })
        .await
    }

    pub async fn update_conversation_summary(&self, chat_fk: i64, summary: &str) -> Result<()> {
        let this = self.clone();
        let summary = summary.to_string();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            conn.execute(
                "INSERT INTO conversation_state (chat_fk, summary, enabled_skills, last_compact_at)
                 VALUES (?1, ?2, '[]', ?3)
                 ON CONFLICT(chat_fk) DO UPDATE SET summary = excluded.summary, last_compact_at = excluded.last_compact_at",
                rusqlite::params![chat_fk, summary, Utc::now().timestamp_millis()],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    pub async fn set_enabled_skills(&self, chat_fk: i64, skills: &[String]) -> Result<()> {
        let this = self.clone();
        let skills_json = serde_json::to_string(skills)?;
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            conn.execute(
                "INSERT INTO conversation_state (chat_fk, enabled_skills) VALUES (?1, ?2)
                 ON CONFLICT(chat_fk) DO UPDATE SET enabled_skills = excluded.enabled_skills",
                rusqlite::params![chat_fk, skills_json],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }
}

fn query_chat(
    conn: &rusqlite::Connection,
    channel: &str,
    chat_id: &str,
) -> Result<Option<Chat>> {
    conn.query_row(
        "SELECT id, channel, chat_id, role, registered FROM chats WHERE channel = ?1 AND chat_id = ?2",
        rusqlite::params![channel, chat_id],
        map_chat_row,
    )
    .optional()
    .map_err(storage_err)
}

fn map_chat_row(row: &rusqlite::Row) -> rusqlite::Result<Chat> {
    let role: String = row.get(3)?;
    let registered: i64 = row.get(4)?;
    Ok(Chat {
        id: row.get(0)?,
        channel: row.get(1)?,
        chat_id: row.get(2)?,
        role: ChatRole::parse(&role),
        registered: registered != 0,
    })
}

pub(crate) fn storage_err(e: rusqlite::Error) -> CoreclawError {
    CoreclawError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn storage() -> Storage {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("db.sqlite"), dir.path().join("backups"));
        storage.migrate().await.unwrap();
        std::mem::forget(dir); // keep tempdir alive for the test's duration
        storage
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let storage = storage().await;
        let a = storage.get_or_create_chat("cli", "c1").await.unwrap();
        let b = storage.get_or_create_chat("cli", "c1").await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn admin_elevation_is_observable() {
        let storage = storage().await;
        let chat = storage.get_or_create_chat("cli", "c1").await.unwrap();
        assert!(!storage.any_admin_exists().await.unwrap());
        storage.set_chat_role(chat.id, ChatRole::Admin).await.unwrap();
        assert!(storage.any_admin_exists().await.unwrap());
    }

    #[tokio::test]
    async fn conversation_state_round_trips() {
        let storage = storage().await;
        let chat = storage.get_or_create_chat("cli", "c1").await.unwrap();
        storage.update_conversation_summary(chat.id, "summary text").await.unwrap();
        let state = storage.get_conversation_state(chat.id).await.unwrap();
        assert_eq!(state.summary.as_deref(), Some("summary text"));
    }
}
