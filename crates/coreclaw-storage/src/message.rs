use chrono::Utc;
use coreclaw_types::error::Result;
use coreclaw_types::models::{Message, MessageRole};

use crate::chat::storage_err;
use crate::{spawn_blocking_storage, Storage};

impl Storage {
    pub async fn insert_message(
        &self,
        chat_fk: i64,
        role: MessageRole,
        sender_id: Option<&str>,
        content: &str,
    ) -> Result<Message> {
        let this = self.clone();
        let sender_id = sender_id.map(str::to_string);
        let content = content.to_string();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO messages (chat_fk, role, sender_id, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    chat_fk,
                    role.as_str(),
                    sender_id,
                    content,
                    created_at.timestamp_millis()
                ],
            )
            .map_err(storage_err)?;
            let id = conn.last_insert_rowid();
            Ok(Message {
                id,
                chat_fk,
                role,
                sender_id,
                content,
                created_at,
            })
        })
        .await
    }

    /// Last `limit` messages for a chat whose role is `user` or
    /// `assistant` and whose content is non-empty, oldest first.
    pub async fn list_recent_conversational_messages(
        &self,
        chat_fk: i64,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let this = self.clone();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, chat_fk, role, sender_id, content, created_at FROM messages
                     WHERE chat_fk = ?1 AND role IN ('user', 'assistant') AND length(content) > 0
                     ORDER BY id DESC LIMIT ?2",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![chat_fk, limit], map_message_row)
                .map_err(storage_err)?;
            let mut messages: Vec<Message> = rows.filter_map(|r| r.ok()).collect();
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    pub async fn count_messages(&self, chat_fk: i64) -> Result<u64> {
        let this = self.clone();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM messages WHERE chat_fk = ?1",
                    [chat_fk],
                    |row| row.get(0),
                )
                .map_err(storage_err)?;
            Ok(count as u64)
        })
        .await
    }

    /// Delete messages older than the newest `keep_max` rows for this chat.
    pub async fn prune_messages(&self, chat_fk: i64, keep_max: u32) -> Result<u64> {
        let this = self.clone();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            let deleted = conn
                .execute(
                    "DELETE FROM messages WHERE chat_fk = ?1 AND id NOT IN (
                        SELECT id FROM messages WHERE chat_fk = ?1 ORDER BY id DESC LIMIT ?2
                     )",
                    rusqlite::params![chat_fk, keep_max],
                )
                .map_err(storage_err)?;
            Ok(deleted as u64)
        })
        .await
    }
}

fn map_message_row(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let created_at_ms: i64 = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        chat_fk: row.get(1)?,
        role: MessageRole::parse(&role).unwrap_or(MessageRole::User),
        sender_id: row.get(3)?,
        content: row.get(4)?,
        created_at: coreclaw_types::cron::ms_to_datetime(created_at_ms).unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn storage() -> Storage {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("db.sqlite"), dir.path().join("backups"));
        storage.migrate().await.unwrap();
        std::mem::forget(dir);
        storage
    }

    #[tokio::test]
    async fn insert_and_list_recent() {
        let storage = storage().await;
        let chat = storage.get_or_create_chat("cli", "c1").await.unwrap();
        for i in 0..5 {
            storage
                .insert_message(chat.id, MessageRole::User, None, &format!("msg{i}"))
                .await
                .unwrap();
        }
        let recent = storage
            .list_recent_conversational_messages(chat.id, 3)
            .await
            .unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent.last().unwrap().content, "msg4");
    }

    #[tokio::test]
    async fn prune_keeps_newest() {
        let storage = storage().await;
        let chat = storage.get_or_create_chat("cli", "c1").await.unwrap();
        for i in 0..10 {
            storage
                .insert_message(chat.id, MessageRole::User, None, &format!("msg{i}"))
                .await
                .unwrap();
        }
        storage.prune_messages(chat.id, 4).await.unwrap();
        assert_eq!(storage.count_messages(chat.id).await.unwrap(), 4);
    }
}
