//! Task scheduler (§4.3): one periodic tick that dispatches due tasks as
//! synthetic inbound envelopes.
//!
//! Follows `cron_service::mod::CronService::tick`'s shape (get due
//! jobs, fire each, record the run) and its `CancellationToken` +
//! `tokio::select!` tick loop, with that crate's in-memory
//! `CronScheduler`/JSONL persistence replaced by
//! `coreclaw_storage::Storage`'s `tasks`/`task_runs` tables so a crash
//! mid-tick cannot double-fire a task: `advance_task_next_run`'s
//! optimistic-concurrency check is the checkpoint-before-dispatch step.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use coreclaw_core::bus::MessageBus;
use coreclaw_core::observability::Observability;
use coreclaw_storage::Storage;
use coreclaw_types::config::Config;
use coreclaw_types::cron::compute_next_run;
use coreclaw_types::envelope::InboundEnvelope;
use coreclaw_types::error::Result;
use coreclaw_types::models::{Task, TaskRunStatus, TaskStatus};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Due tasks claimed per tick. Keeps a single tick bounded even if a lot
/// of tasks come due at once after downtime.
const BATCH_SIZE: i64 = 100;

pub struct Scheduler {
    storage: Arc<Storage>,
    bus: Arc<MessageBus>,
    observability: Arc<Observability>,
    config: Arc<Config>,
    task: AsyncMutex<Option<(CancellationToken, tokio::task::JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new(
        storage: Arc<Storage>,
        bus: Arc<MessageBus>,
        observability: Arc<Observability>,
        config: Arc<Config>,
    ) -> Self {
        Scheduler {
            storage,
            bus,
            observability,
            config,
            task: AsyncMutex::new(None),
        }
    }

    /// Idempotent: a second call while already running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.task.lock().await;
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let this = Arc::clone(self);
        let child_token = token.clone();
        let join = tokio::spawn(async move { this.run(child_token).await });
        *guard = Some((token, join));
    }

    pub async fn stop(&self) {
        if let Some((token, join)) = self.task.lock().await.take() {
            token.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(5), join).await;
        }
    }

    async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.scheduler.tick_ms));
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        let due = self.storage.list_due_tasks(now, BATCH_SIZE).await?;
        if due.is_empty() {
            return Ok(());
        }
        debug!(count = due.len(), "dispatching due tasks");
        for task in due {
            if let Err(e) = self.dispatch_one(&task, now).await {
                warn!(task_id = task.id, error = %e, "failed to dispatch task");
            }
        }
        Ok(())
    }

    async fn dispatch_one(&self, task: &Task, now: chrono::DateTime<Utc>) -> Result<()> {
        let original_next_run_at = task.next_run_at;
        let next_run_at = compute_next_run(task.schedule_type, &task.schedule_value, now)?;

        // Checkpoint before dispatch: only the poller that wins this
        // compare-and-swap actually fires the task.
        let advanced = self
            .storage
            .advance_task_next_run(task.id, task.next_run_at, next_run_at)
            .await?;
        if !advanced {
            debug!(task_id = task.id, "lost race to advance task, skipping");
            return Ok(());
        }
        if next_run_at.is_none() {
            self.storage.set_task_status(task.id, TaskStatus::Done).await?;
        }

        let chat = self.storage.get_chat_by_fk(task.chat_fk).await?;
        let Some(chat) = chat else {
            warn!(task_id = task.id, chat_fk = task.chat_fk, "task references unknown chat");
            return Ok(());
        };

        let mut metadata = HashMap::new();
        metadata.insert("isScheduledTask".to_string(), Value::Bool(true));
        metadata.insert("taskId".to_string(), Value::from(task.id));
        metadata.insert("contextMode".to_string(), Value::String(task.context_mode.as_str().to_string()));
        metadata.insert("chatFk".to_string(), Value::from(task.chat_fk));

        let envelope = InboundEnvelope {
            id: format!("scheduler:{}:{}", task.id, Uuid::new_v4()),
            channel: chat.channel,
            chat_id: chat.chat_id,
            sender_id: Some("scheduler".to_string()),
            content: task.prompt.clone(),
            created_at: now,
            metadata,
        };

        let started_at = Utc::now();
        let publish_result = self.bus.publish_inbound(&envelope).await;
        let finished_at = Utc::now();

        let delay_ms = original_next_run_at
            .map(|t| (now - t).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        self.observability.record_scheduler_dispatch(delay_ms, 1);

        match publish_result {
            Ok(_) => {
                self.storage
                    .record_task_run(task.id, TaskRunStatus::Success, None, started_at, finished_at)
                    .await?;
            }
            Err(e) => {
                self.storage
                    .record_task_run(task.id, TaskRunStatus::Failure, Some(&e.to_string()), started_at, finished_at)
                    .await?;
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coreclaw_core::bus::MessageBus;
    use coreclaw_core::observability::Observability;
    use coreclaw_types::config::Config;
    use coreclaw_types::models::{ScheduleType, TaskContextMode};

    async fn harness() -> (Arc<Storage>, Arc<MessageBus>, Arc<Observability>, Arc<Config>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path().join("db.sqlite"), dir.path().join("backups")));
        storage.migrate().await.unwrap();
        std::mem::forget(dir);
        let config = Arc::new(Config::default());
        let bus = Arc::new(MessageBus::new(storage.clone(), config.bus.clone()));
        let observability = Arc::new(Observability::new(storage.clone(), config.clone()));
        (storage, bus, observability, config)
    }

    #[tokio::test]
    async fn dispatches_due_once_task_and_marks_done() {
        let (storage, bus, observability, config) = harness().await;
        let chat = storage.get_or_create_chat("cli", "c1").await.unwrap();
        let now = Utc::now();
        let task = storage
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

        let scheduler = Scheduler::new(storage.clone(), bus.clone(), observability, config);
        scheduler.tick().await.unwrap();

        let task = storage.get_task(task.id).await.unwrap().unwrap();
        assert!(matches!(task.status, TaskStatus::Done));
        assert_eq!(storage.count_pending(coreclaw_types::envelope::Direction::Inbound).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn advances_interval_task_instead_of_completing() {
        let (storage, bus, observability, config) = harness().await;
        let chat = storage.get_or_create_chat("cli", "c1").await.unwrap();
        let now = Utc::now();
        let task = storage
            .create_task(
                chat.id,
                "poll",
                ScheduleType::Interval,
                "60000",
                TaskContextMode::Group,
                Some(now - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();

        let scheduler = Scheduler::new(storage.clone(), bus, observability, config);
        scheduler.tick().await.unwrap();

        let task = storage.get_task(task.id).await.unwrap().unwrap();
        assert!(matches!(task.status, TaskStatus::Active));
        assert!(task.next_run_at.unwrap() > now);
    }
}
