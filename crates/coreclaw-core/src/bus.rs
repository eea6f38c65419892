//! The durable message bus (§4.2): one dispatch task per direction,
//! each claiming pending [`coreclaw_storage`] queue records and handing
//! them to the registered handlers in order.
//!
//! Follows the reference crates' in-memory `bus.rs`: that version kept
//! registered handlers in a `Vec` behind a lock and spawned one
//! dispatch task per direction with its own shutdown signal. This
//! version keeps that shape but swaps the in-memory channel for
//! `coreclaw_storage::Storage`'s durable queue, so a crash between
//! claim and completion is recovered on restart instead of losing the
//! message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coreclaw_storage::{PublishOutcome, RateLimit, Storage};
use coreclaw_types::config::BusConfig;
use coreclaw_types::envelope::{Direction, InboundEnvelope, OutboundEnvelope};
use coreclaw_types::error::{CoreclawError, Result};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A handler invoked for every claimed record of one bus direction.
/// Registered handlers run in registration order; the first error or
/// timeout fails the record, driving bus retry/DLQ.
#[async_trait]
pub trait BusHandler<E>: Send + Sync
where
    E: Send + 'static,
{
    async fn handle(&self, envelope: E) -> Result<()>;
}

struct DispatchTask {
    token: CancellationToken,
    join: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DispatchTask {
    fn new(token: CancellationToken, join: tokio::task::JoinHandle<()>) -> Self {
        DispatchTask {
            token,
            join: AsyncMutex::new(Some(join)),
        }
    }

    async fn stop(&self, drain_timeout: Duration) {
        self.token.cancel();
        let mut guard = self.join.lock().await;
        if let Some(handle) = guard.take() {
            if tokio::time::timeout(drain_timeout, handle).await.is_err() {
                warn!("dispatch task did not drain within processingTimeoutMs");
            }
        }
    }
}

/// The durable message bus. Owns no in-memory queue: [`Storage`] is the
/// single source of truth, so this struct is cheap to clone and safe to
/// share across channels, the router, and the scheduler/heartbeat
/// sources that publish synthetic inbound envelopes.
pub struct MessageBus {
    storage: Arc<Storage>,
    config: BusConfig,
    inbound_handlers: std::sync::Mutex<Vec<Arc<dyn BusHandler<InboundEnvelope>>>>,
    outbound_handlers: std::sync::Mutex<Vec<Arc<dyn BusHandler<OutboundEnvelope>>>>,
    inbound_task: AsyncMutex<Option<DispatchTask>>,
    outbound_task: AsyncMutex<Option<DispatchTask>>,
}

impl MessageBus {
    pub fn new(storage: Arc<Storage>, config: BusConfig) -> Self {
        MessageBus {
            storage,
            config,
            inbound_handlers: std::sync::Mutex::new(Vec::new()),
            outbound_handlers: std::sync::Mutex::new(Vec::new()),
            inbound_task: AsyncMutex::new(None),
            outbound_task: AsyncMutex::new(None),
        }
    }

    pub fn register_inbound_handler(&self, handler: Arc<dyn BusHandler<InboundEnvelope>>) {
        self.inbound_handlers.lock().unwrap().push(handler);
    }

    pub fn register_outbound_handler(&self, handler: Arc<dyn BusHandler<OutboundEnvelope>>) {
        self.outbound_handlers.lock().unwrap().push(handler);
    }

    /// Publish contract (§4.2): dedupe-on-insert, queue-overflow, and
    /// per-chat-rate-limit dead-lettering all live in
    /// `coreclaw_storage::Storage::publish`; this just shapes the call.
    pub async fn publish_inbound(&self, envelope: &InboundEnvelope) -> Result<PublishOutcome> {
        let payload = serde_json::to_string(envelope)?;
        self.storage
            .publish(
                Direction::Inbound,
                &envelope.id,
                &envelope.channel,
                &envelope.chat_id,
                &payload,
                self.config.max_pending_inbound as i64,
                self.config.max_attempts as i64,
                Some(RateLimit {
                    window_ms: self.config.per_chat_rate_limit_window_ms as i64,
                    max: self.config.per_chat_rate_limit_max as i64,
                }),
            )
            .await
    }

    pub async fn publish_outbound(&self, envelope: &OutboundEnvelope) -> Result<PublishOutcome> {
        let payload = serde_json::to_string(envelope)?;
        self.storage
            .publish(
                Direction::Outbound,
                &envelope.id,
                &envelope.channel,
                &envelope.chat_id,
                &payload,
                self.config.max_pending_outbound as i64,
                self.config.max_attempts as i64,
                None,
            )
            .await
    }

    /// Runs restart recovery for both directions, then spawns one
    /// dispatch task per direction. Idempotent: calling twice without an
    /// intervening `stop()` is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut guard = self.inbound_task.lock().await;
            if guard.is_some() {
                return Ok(());
            }
            let recovered = self
                .storage
                .recover_stale_processing(Direction::Inbound, self.config.processing_timeout_ms as i64)
                .await?;
            if recovered > 0 {
                info!(recovered, direction = "inbound", "recovered stale processing records");
            }
            let token = CancellationToken::new();
            let this = Arc::clone(self);
            let child_token = token.clone();
            let join = tokio::spawn(async move { this.dispatch_loop_inbound(child_token).await });
            *guard = Some(DispatchTask::new(token, join));
        }
        {
            let mut guard = self.outbound_task.lock().await;
            if guard.is_some() {
                return Ok(());
            }
            let recovered = self
                .storage
                .recover_stale_processing(Direction::Outbound, self.config.processing_timeout_ms as i64)
                .await?;
            if recovered > 0 {
                info!(recovered, direction = "outbound", "recovered stale processing records");
            }
            let token = CancellationToken::new();
            let this = Arc::clone(self);
            let child_token = token.clone();
            let join = tokio::spawn(async move { this.dispatch_loop_outbound(child_token).await });
            *guard = Some(DispatchTask::new(token, join));
        }
        Ok(())
    }

    /// Idempotent: cancels both dispatch tasks and waits up to
    /// `processingTimeoutMs` for in-flight handlers to drain.
    pub async fn stop(&self) {
        let drain = Duration::from_millis(self.config.processing_timeout_ms);
        if let Some(task) = self.inbound_task.lock().await.take() {
            task.stop(drain).await;
        }
        if let Some(task) = self.outbound_task.lock().await.take() {
            task.stop(drain).await;
        }
    }

    async fn dispatch_loop_inbound(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.poll_ms));
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.dispatch_once_inbound().await {
                        error!(error = %e, "inbound dispatch tick failed");
                    }
                }
            }
        }
    }

    async fn dispatch_loop_outbound(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.poll_ms));
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.dispatch_once_outbound().await {
                        error!(error = %e, "outbound dispatch tick failed");
                    }
                }
            }
        }
    }

    async fn dispatch_once_inbound(&self) -> Result<()> {
        self.backpressure_sleep(Direction::Inbound).await?;
        let claimed = self
            .storage
            .claim_batch(Direction::Inbound, self.config.batch_size as i64)
            .await?;
        for record in claimed {
            let envelope: InboundEnvelope = match serde_json::from_str(&record.payload) {
                Ok(e) => e,
                Err(e) => {
                    warn!(queue_id = record.id, error = %e, "dropping unparseable inbound record");
                    self.storage.mark_processed(record.id).await?;
                    continue;
                }
            };
            let handlers: Vec<_> = self.inbound_handlers.lock().unwrap().clone();
            let deadline = Duration::from_millis(self.config.processing_timeout_ms);
            let outcome = run_handlers(handlers, envelope, deadline).await;
            self.finish_record(Direction::Inbound, record.id, record.attempts as i64, outcome)
                .await?;
        }
        Ok(())
    }

    async fn dispatch_once_outbound(&self) -> Result<()> {
        self.backpressure_sleep(Direction::Outbound).await?;
        let claimed = self
            .storage
            .claim_batch(Direction::Outbound, self.config.batch_size as i64)
            .await?;
        for record in claimed {
            let envelope: OutboundEnvelope = match serde_json::from_str(&record.payload) {
                Ok(e) => e,
                Err(e) => {
                    warn!(queue_id = record.id, error = %e, "dropping unparseable outbound record");
                    self.storage.mark_processed(record.id).await?;
                    continue;
                }
            };
            let handlers: Vec<_> = self.outbound_handlers.lock().unwrap().clone();
            let deadline = Duration::from_millis(self.config.processing_timeout_ms);
            let outcome = run_handlers(handlers, envelope, deadline).await;
            self.finish_record(Direction::Outbound, record.id, record.attempts as i64, outcome)
                .await?;
        }
        Ok(())
    }

    async fn backpressure_sleep(&self, direction: Direction) -> Result<()> {
        let pending = self.storage.count_pending(direction).await?;
        if pending > self.config.overload_pending_threshold {
            debug!(pending, direction = direction.as_str(), "bus overloaded, applying backpressure");
            tokio::time::sleep(Duration::from_millis(self.config.overload_backoff_ms)).await;
        }
        Ok(())
    }

    async fn finish_record(
        &self,
        direction: Direction,
        queue_id: i64,
        attempts: i64,
        outcome: Result<()>,
    ) -> Result<()> {
        match outcome {
            Ok(()) => {
                self.storage.mark_processed(queue_id).await?;
            }
            Err(e) => {
                let status = self
                    .storage
                    .mark_retry_or_dead_letter(
                        queue_id,
                        attempts,
                        self.config.max_attempts as i64,
                        self.config.retry_backoff_ms as i64,
                        self.config.max_retry_backoff_ms as i64,
                        &e.to_string(),
                    )
                    .await?;
                warn!(
                    queue_id,
                    direction = direction.as_str(),
                    status = ?status,
                    error = %e,
                    "handler failed"
                );
            }
        }
        Ok(())
    }

    pub async fn list_dead_letter(
        &self,
        direction: Option<Direction>,
        limit: i64,
    ) -> Result<Vec<coreclaw_storage::BusQueueRecord>> {
        self.storage.list_dead_letter(direction, limit).await
    }

    pub async fn replay_dead_letter(
        &self,
        queue_id: Option<i64>,
        direction: Option<Direction>,
        limit: i64,
    ) -> Result<u64> {
        self.storage.replay_dead_letter(queue_id, direction, limit).await
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }
}

/// Runs every registered handler for one record under a single overall
/// deadline, stopping at the first error (§4.2: "awaits completion
/// under an overall deadline"; a handler error fails the record, it
/// does not skip to the next handler).
async fn run_handlers<E, H>(handlers: Vec<Arc<H>>, envelope: E, deadline: Duration) -> Result<()>
where
    E: Clone + Send + 'static,
    H: BusHandler<E> + ?Sized,
{
    let fut = async {
        for handler in &handlers {
            handler.handle(envelope.clone()).await?;
        }
        Ok(())
    };
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(CoreclawError::HandlerTimeout {
            operation: "bus_dispatch".into(),
            timeout_ms: deadline.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn storage() -> Arc<Storage> {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("db.sqlite"), dir.path().join("backups"));
        storage.migrate().await.unwrap();
        std::mem::forget(dir);
        Arc::new(storage)
    }

    fn fast_config() -> BusConfig {
        BusConfig {
            poll_ms: 10,
            batch_size: 10,
            max_attempts: 3,
            retry_backoff_ms: 5,
            max_retry_backoff_ms: 50,
            processing_timeout_ms: 2_000,
            max_pending_inbound: 100,
            max_pending_outbound: 100,
            overload_pending_threshold: 1_000,
            overload_backoff_ms: 10,
            per_chat_rate_limit_window_ms: 60_000,
            per_chat_rate_limit_max: 1_000,
        }
    }

    fn envelope(id: &str) -> InboundEnvelope {
        InboundEnvelope {
            id: id.into(),
            channel: "cli".into(),
            chat_id: "c1".into(),
            sender_id: None,
            content: "hi".into(),
            created_at: chrono::Utc::now(),
            metadata: Default::default(),
        }
    }

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail_until: usize,
    }

    #[async_trait]
    impl BusHandler<InboundEnvelope> for CountingHandler {
        async fn handle(&self, _envelope: InboundEnvelope) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_until {
                return Err(CoreclawError::HandlerError("boom".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn retry_then_succeed() {
        let storage = storage().await;
        let bus = Arc::new(MessageBus::new(storage.clone(), fast_config()));
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register_inbound_handler(Arc::new(CountingHandler {
            calls: calls.clone(),
            fail_until: 1,
        }));
        bus.publish_inbound(&envelope("m1")).await.unwrap();
        bus.start().await.unwrap();
        for _ in 0..50 {
            if calls.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        bus.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(storage.count_pending(Direction::Inbound).await.unwrap(), 0);
        assert_eq!(storage.count_dead_letter(Direction::Inbound).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters() {
        let storage = storage().await;
        let mut config = fast_config();
        config.max_attempts = 2;
        let bus = Arc::new(MessageBus::new(storage.clone(), config));
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register_inbound_handler(Arc::new(CountingHandler {
            calls: calls.clone(),
            fail_until: usize::MAX,
        }));
        bus.publish_inbound(&envelope("m1")).await.unwrap();
        bus.start().await.unwrap();
        for _ in 0..100 {
            if storage.count_dead_letter(Direction::Inbound).await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        bus.stop().await;
        assert_eq!(storage.count_dead_letter(Direction::Inbound).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_publish_runs_handler_once() {
        let storage = storage().await;
        let bus = Arc::new(MessageBus::new(storage.clone(), fast_config()));
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register_inbound_handler(Arc::new(CountingHandler {
            calls: calls.clone(),
            fail_until: 0,
        }));
        bus.publish_inbound(&envelope("X")).await.unwrap();
        bus.publish_inbound(&envelope("X")).await.unwrap();
        bus.start().await.unwrap();
        for _ in 0..50 {
            if calls.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
