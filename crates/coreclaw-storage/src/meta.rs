//! Free-form key/value state: admin-bootstrap lockout counters, heartbeat
//! dedupe windows, scheduler checkpoints — anything that needs to survive
//! a restart but doesn't warrant its own table.

use coreclaw_types::error::Result;
use rusqlite::{params, OptionalExtension};

use crate::chat::storage_err;
use crate::{spawn_blocking_storage, Storage};

impl Storage {
    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let this = self.clone();
        let key = key.to_string();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            conn.query_row("SELECT value FROM meta_kv WHERE key = ?1", [key], |row| row.get(0))
                .optional()
                .map_err(storage_err)
        })
        .await
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let this = self.clone();
        let key = key.to_string();
        let value = value.to_string();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            conn.execute(
                "INSERT INTO meta_kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    pub async fn delete_meta(&self, key: &str) -> Result<()> {
        let this = self.clone();
        let key = key.to_string();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            conn.execute("DELETE FROM meta_kv WHERE key = ?1", [key])
                .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    pub async fn get_meta_i64(&self, key: &str) -> Result<Option<i64>> {
        Ok(self
            .get_meta(key)
            .await?
            .and_then(|v| v.parse::<i64>().ok()))
    }
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
    async fn meta_round_trips_and_deletes() {
        let storage = storage().await;
        assert_eq!(storage.get_meta("admin_bootstrap_failed_attempts").await.unwrap(), None);
        storage.set_meta("admin_bootstrap_failed_attempts", "3").await.unwrap();
        assert_eq!(storage.get_meta_i64("admin_bootstrap_failed_attempts").await.unwrap(), Some(3));
        storage.delete_meta("admin_bootstrap_failed_attempts").await.unwrap();
        assert_eq!(storage.get_meta("admin_bootstrap_failed_attempts").await.unwrap(), None);
    }
}
