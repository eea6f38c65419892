use chrono::{DateTime, Utc};
use coreclaw_types::error::Result;
use coreclaw_types::models::{
    ScheduleType, Task, TaskContextMode, TaskRun, TaskRunStatus, TaskStatus,
};
use rusqlite::{params, OptionalExtension};

use crate::chat::storage_err;
use crate::{spawn_blocking_storage, Storage};

impl Storage {
    #[allow(clippy::too_many_arguments)]
    pub async fn create_task(
        &self,
        chat_fk: i64,
        prompt: &str,
        schedule_type: ScheduleType,
        schedule_value: &str,
        context_mode: TaskContextMode,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<Task> {
        let this = self.clone();
        let prompt = prompt.to_string();
        let schedule_value = schedule_value.to_string();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            conn.execute(
                "INSERT INTO tasks (chat_fk, prompt, schedule_type, schedule_value, context_mode, status, next_run_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6)",
                params![
                    chat_fk,
                    prompt,
                    schedule_type.as_str(),
                    schedule_value,
                    context_mode.as_str(),
                    next_run_at.map(|d| d.timestamp_millis()),
                ],
            )
            .map_err(storage_err)?;
            let id = conn.last_insert_rowid();
            query_task(&conn, id)?.ok_or_else(|| {
                coreclaw_types::error::CoreclawError::Storage("task vanished after insert".into())
            })
        })
        .await
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        let this = self.clone();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            query_task(&conn, task_id)
        })
        .await
    }

    pub async fn set_task_status(&self, task_id: i64, status: TaskStatus) -> Result<()> {
        let this = self.clone();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            conn.execute(
                "UPDATE tasks SET status = ?1 WHERE id = ?2",
                params![status.as_str(), task_id],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    /// Due active tasks whose `next_run_at` has elapsed, oldest first.
    pub async fn list_due_tasks(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Task>> {
        let this = self.clone();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, chat_fk, prompt, schedule_type, schedule_value, context_mode, status, next_run_at
                     FROM tasks WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= ?1
                     ORDER BY next_run_at ASC LIMIT ?2",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![now.timestamp_millis(), limit], map_task_row)
                .map_err(storage_err)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
        .await
    }

    /// Atomically advance a task's `next_run_at`, only succeeding if the
    /// task's current `next_run_at` still matches `expected` — guards
    /// against the scheduler double-firing a task two pollers both saw
    /// as due.
    pub async fn advance_task_next_run(
        &self,
        task_id: i64,
        expected: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let this = self.clone();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            let updated = match expected {
                Some(expected) => conn.execute(
                    "UPDATE tasks SET next_run_at = ?1 WHERE id = ?2 AND next_run_at = ?3",
                    params![
                        next_run_at.map(|d| d.timestamp_millis()),
                        task_id,
                        expected.timestamp_millis(),
                    ],
                ),
                None => conn.execute(
                    "UPDATE tasks SET next_run_at = ?1 WHERE id = ?2 AND next_run_at IS NULL",
                    params![next_run_at.map(|d| d.timestamp_millis()), task_id],
                ),
            }
            .map_err(storage_err)?;
            Ok(updated == 1)
        })
        .await
    }

    pub async fn record_task_run(
        &self,
        task_fk: i64,
        status: TaskRunStatus,
        error: Option<&str>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<TaskRun> {
        let this = self.clone();
        let error = error.map(str::to_string);
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            let status_str = match status {
                TaskRunStatus::Success => "success",
                TaskRunStatus::Failure => "failure",
            };
            conn.execute(
                "INSERT INTO task_runs (task_fk, status, error, started_at, finished_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    task_fk,
                    status_str,
                    error,
                    started_at.timestamp_millis(),
                    finished_at.timestamp_millis(),
                ],
            )
            .map_err(storage_err)?;
            Ok(TaskRun {
                id: conn.last_insert_rowid(),
                task_fk,
                status,
                error,
                started_at,
                finished_at,
            })
        })
        .await
    }

    pub async fn list_task_runs(&self, task_fk: i64, limit: i64) -> Result<Vec<TaskRun>> {
        let this = self.clone();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, task_fk, status, error, started_at, finished_at FROM task_runs
                     WHERE task_fk = ?1 ORDER BY id DESC LIMIT ?2",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![task_fk, limit], |row| {
                    let status: String = row.get(2)?;
                    let started_ms: i64 = row.get(4)?;
                    let finished_ms: i64 = row.get(5)?;
                    Ok(TaskRun {
                        id: row.get(0)?,
                        task_fk: row.get(1)?,
                        status: if status == "success" {
                            TaskRunStatus::Success
                        } else {
                            TaskRunStatus::Failure
                        },
                        error: row.get(3)?,
                        started_at: coreclaw_types::cron::ms_to_datetime(started_ms).unwrap_or_else(Utc::now),
                        finished_at: coreclaw_types::cron::ms_to_datetime(finished_ms).unwrap_or_else(Utc::now),
                    })
                })
                .map_err(storage_err)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
        .await
    }
}

fn query_task(conn: &rusqlite::Connection, task_id: i64) -> Result<Option<Task>> {
    conn.query_row(
        "SELECT id, chat_fk, prompt, schedule_type, schedule_value, context_mode, status, next_run_at
         FROM tasks WHERE id = ?1",
        [task_id],
        map_task_row,
    )
    .optional()
    .map_err(storage_err)
}

fn map_task_row(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let schedule_type: String = row.get(3)?;
    let context_mode: String = row.get(5)?;
    let status: String = row.get(6)?;
    let next_run_ms: Option<i64> = row.get(7)?;
    Ok(Task {
        id: row.get(0)?,
        chat_fk: row.get(1)?,
        prompt: row.get(2)?,
        schedule_type: ScheduleType::parse(&schedule_type),
        schedule_value: row.get(4)?,
        context_mode: TaskContextMode::parse(&context_mode),
        status: TaskStatus::parse(&status),
        next_run_at: next_run_ms.and_then(coreclaw_types::cron::ms_to_datetime),
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
    async fn due_tasks_respect_next_run_at() {
        let storage = storage().await;
        let chat = storage.get_or_create_chat("cli", "c1").await.unwrap();
        let now = Utc::now();
        let due = storage
            .create_task(
                chat.id,
                "say hi",
                ScheduleType::Once,
                "",
                TaskContextMode::Group,
                Some(now - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();
        storage
            .create_task(
                chat.id,
                "later",
                ScheduleType::Once,
                "",
                TaskContextMode::Group,
                Some(now + chrono::Duration::hours(1)),
            )
            .await
            .unwrap();
        let tasks = storage.list_due_tasks(now, 10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, due.id);
    }

    #[tokio::test]
    async fn advance_next_run_guards_against_double_fire() {
        let storage = storage().await;
        let chat = storage.get_or_create_chat("cli", "c1").await.unwrap();
        let now = Utc::now();
        let task = storage
            .create_task(
                chat.id,
                "loop",
                ScheduleType::Interval,
                "1000",
                TaskContextMode::Group,
                Some(now),
            )
            .await
            .unwrap();
        let first = storage
            .advance_task_next_run(task.id, Some(now), Some(now + chrono::Duration::seconds(1)))
            .await
            .unwrap();
        assert!(first);
        let second = storage
            .advance_task_next_run(task.id, Some(now), Some(now + chrono::Duration::seconds(2)))
            .await
            .unwrap();
        assert!(!second);
    }

    #[tokio::test]
    async fn task_runs_are_recorded() {
        let storage = storage().await;
        let chat = storage.get_or_create_chat("cli", "c1").await.unwrap();
        let task = storage
            .create_task(chat.id, "p", ScheduleType::Once, "", TaskContextMode::Group, None)
            .await
            .unwrap();
        let now = Utc::now();
        storage
            .record_task_run(task.id, TaskRunStatus::Success, None, now, now)
            .await
            .unwrap();
        let runs = storage.list_task_runs(task.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(matches!(runs[0].status, TaskRunStatus::Success));
    }
}
