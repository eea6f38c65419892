//! # coreclaw-storage
//!
//! The single local SQL store backing the Coreclaw runtime: chats,
//! messages, the durable bus queue, the inbound-execution ledger, tasks,
//! audit events, migration history, and free-form meta key/value state.
//!
//! Grounded on the connection-per-operation pattern used throughout the
//! pack's `hi-youichi-loom` SQLite store: every blocking call opens a
//! fresh `rusqlite::Connection` against a shared file path inside
//! `tokio::task::spawn_blocking`, relying on SQLite's WAL mode for
//! concurrent readers/writers rather than a pooled connection. Storage
//! is the sole writer in the system; every other component only ever
//! holds an `Arc<Storage>`.

mod audit;
mod chat;
mod message;
mod meta;
mod queue;
pub mod schema;
mod task;

pub use audit::*;
pub use chat::*;
pub use message::*;
pub use meta::*;
pub use queue::*;
pub use task::*;

use std::path::{Path, PathBuf};

use chrono::Utc;
use coreclaw_types::error::{CoreclawError, Result};
use coreclaw_types::models::{MigrationHistory, MigrationStatus};
use rusqlite::Connection;
use tracing::{debug, info};

#[derive(Clone)]
pub struct Storage {
    db_path: PathBuf,
    backup_dir: PathBuf,
}

impl Storage {
    pub fn new(db_path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Storage {
            db_path: db_path.into(),
            backup_dir: backup_dir.into(),
        }
    }

    /// Open a connection with WAL journaling and foreign keys enabled.
    /// Every blocking Storage method calls this from inside
    /// `spawn_blocking`; opening per-call keeps the async side free of a
    /// long-lived `Mutex<Connection>`.
    pub(crate) fn open(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Apply pending migrations. Before each migration's SQL runs, the
    /// on-disk database file is copied into `backup_dir` and the path is
    /// recorded in `migration_history`. A failure leaves the backup path
    /// in the returned error so an operator can restore it by hand.
    pub async fn migrate(&self) -> Result<()> {
        let db_path = self.db_path.clone();
        let backup_dir = self.backup_dir.clone();
        tokio::task::spawn_blocking(move || migrate_blocking(&db_path, &backup_dir))
            .await
            .map_err(|e| CoreclawError::Storage(e.to_string()))?
    }
}

fn migrate_blocking(db_path: &Path, backup_dir: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(backup_dir)?;

    // Bootstrap: the migration_history table itself must exist before we
    // can check what's applied, so run the first migration unconditionally
    // if the database file doesn't exist yet.
    let is_fresh = !db_path.exists();
    let conn = Connection::open(db_path)
        .map_err(|e| CoreclawError::Storage(format!("open for migration: {e}")))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| CoreclawError::Storage(e.to_string()))?;

    let already_applied: Vec<String> = if is_fresh {
        Vec::new()
    } else {
        conn.prepare("SELECT id FROM migration_history WHERE status = 'applied'")
            .ok()
            .and_then(|mut stmt| {
                stmt.query_map([], |row| row.get::<_, String>(0))
                    .ok()
                    .map(|rows| rows.filter_map(|r| r.ok()).collect())
            })
            .unwrap_or_default()
    };

    for migration in schema::MIGRATIONS {
        if already_applied.contains(&migration.id.to_string()) {
            continue;
        }

        let backup_path = if is_fresh {
            backup_dir.join(format!("{}_{}_pre-init.sqlite", Utc::now().timestamp_millis(), migration.id))
        } else {
            let path = backup_dir.join(format!(
                "{}_{}.sqlite",
                Utc::now().timestamp_millis(),
                migration.id
            ));
            std::fs::copy(db_path, &path).map_err(|e| CoreclawError::MigrationFailed {
                id: migration.id.into(),
                reason: format!("failed to back up database before migration: {e}"),
                backup_path: path.display().to_string(),
            })?;
            path
        };

        debug!(migration = migration.id, backup = %backup_path.display(), "applying migration");

        let result = conn.execute_batch(migration.sql);
        let now = Utc::now();
        match result {
            Ok(()) => {
                conn.execute(
                    "INSERT INTO migration_history (id, status, backup_path, applied_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET status=excluded.status, backup_path=excluded.backup_path, applied_at=excluded.applied_at",
                    rusqlite::params![
                        migration.id,
                        migration_status_str(MigrationStatus::Applied),
                        backup_path.display().to_string(),
                        now.timestamp_millis(),
                    ],
                )
                .map_err(|e| CoreclawError::Storage(e.to_string()))?;
                info!(migration = migration.id, "migration applied");
            }
            Err(e) => {
                return Err(CoreclawError::MigrationFailed {
                    id: migration.id.into(),
                    reason: e.to_string(),
                    backup_path: backup_path.display().to_string(),
                });
            }
        }
    }
    Ok(())
}

fn migration_status_str(status: MigrationStatus) -> &'static str {
    match status {
        MigrationStatus::Applied => "applied",
        MigrationStatus::Failed => "failed",
    }
}

pub(crate) fn spawn_blocking_storage<F, T>(f: F) -> impl std::future::Future<Output = Result<T>>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    async move {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| CoreclawError::Storage(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("db.sqlite"), dir.path().join("backups"));
        storage.migrate().await.unwrap();
        storage.migrate().await.unwrap(); // idempotent
        let chat = storage.get_or_create_chat("cli", "c1").await.unwrap();
        assert_eq!(chat.channel, "cli");
    }
}
