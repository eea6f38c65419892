//! Heartbeat source (§4.4): periodic wake envelopes for every known
//! chat, gated by active hours and busy-inbound checks, with
//! ack-token and recent-duplicate suppression on the reply side.
//!
//! Follows `heartbeat::HeartbeatService`'s shape: a single
//! `tokio::time::interval` ticking inside a `CancellationToken`-gated
//! loop that sends one synthetic message per tick. Generalized here
//! from one global chat to every row in `coreclaw_storage::Storage`'s
//! `chats` table (there is no per-chat heartbeat toggle in the data
//! model, so the global `HeartbeatConfig.enabled` flag is the only
//! gate), and extended with debounce/active-hours/busy/dedupe rules
//! that source did not need.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use coreclaw_core::bus::MessageBus;
use coreclaw_core::router::HeartbeatWaker;
use coreclaw_storage::Storage;
use coreclaw_types::config::Config;
use coreclaw_types::envelope::InboundEnvelope;
use coreclaw_types::models::Chat;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Default)]
struct ChatState {
    /// Last time a real (non-heartbeat) turn completed for this chat;
    /// used to coalesce a wake within `wakeDebounceMs` of recent
    /// activity instead of sending a redundant heartbeat right after.
    last_activity: Option<DateTime<Utc>>,
    /// Last assistant content produced for a heartbeat turn and when,
    /// for `dedupeWindowMs` duplicate suppression.
    last_reply: Option<(String, DateTime<Utc>)>,
}

pub struct HeartbeatSource {
    storage: Arc<Storage>,
    bus: Arc<MessageBus>,
    config: Arc<Config>,
    prompt: String,
    state: Mutex<HashMap<i64, ChatState>>,
    task: AsyncMutex<Option<(CancellationToken, tokio::task::JoinHandle<()>)>>,
}

impl HeartbeatSource {
    pub fn new(storage: Arc<Storage>, bus: Arc<MessageBus>, config: Arc<Config>) -> Self {
        let prompt = config
            .heartbeat
            .prompt_path
            .as_deref()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .unwrap_or_else(|| "Is there anything worth proactively flagging right now?".to_string());
        HeartbeatSource {
            storage,
            bus,
            config,
            prompt,
            state: Mutex::new(HashMap::new()),
            task: AsyncMutex::new(None),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        if !self.config.heartbeat.enabled {
            return;
        }
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
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.heartbeat.interval_ms));
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "heartbeat tick failed");
                    }
                }
            }
        }
    }

    async fn tick(&self) -> coreclaw_types::error::Result<()> {
        let chats = self.storage.list_chats().await?;
        let mut dispatched = 0u32;
        let now = Utc::now();
        for chat in chats {
            if dispatched >= self.config.heartbeat.max_dispatch_per_run {
                break;
            }
            if !self.active_hours_allow() {
                continue;
            }
            if self.within_debounce(chat.id, now) {
                continue;
            }
            if self.config.heartbeat.skip_when_inbound_busy
                && self.storage.has_busy_inbound(&chat.channel, &chat.chat_id).await?
            {
                debug!(chat_fk = chat.id, "heartbeat deferred, inbound busy");
                continue;
            }
            self.wake_now(&chat, now).await?;
            dispatched += 1;
        }
        Ok(())
    }

    async fn wake_now(&self, chat: &Chat, now: DateTime<Utc>) -> coreclaw_types::error::Result<()> {
        let mut metadata = HashMap::new();
        metadata.insert("isHeartbeat".to_string(), Value::Bool(true));
        let envelope = InboundEnvelope {
            id: format!("heartbeat:{}:{}", chat.id, Uuid::new_v4()),
            channel: chat.channel.clone(),
            chat_id: chat.chat_id.clone(),
            sender_id: Some("heartbeat".to_string()),
            content: self.prompt.clone(),
            created_at: now,
            metadata,
        };
        if let Err(e) = self.bus.publish_inbound(&envelope).await {
            warn!(chat_fk = chat.id, error = %e, "failed to publish heartbeat wake");
        }
        Ok(())
    }

    fn within_debounce(&self, chat_fk: i64, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().unwrap();
        match state.get(&chat_fk).and_then(|s| s.last_activity) {
            Some(last) => {
                (now - last).num_milliseconds() < self.config.heartbeat.wake_debounce_ms as i64
            }
            None => false,
        }
    }

    /// `HH:mm-HH:mm` in local process time; `None`/empty means always on.
    fn active_hours_allow(&self) -> bool {
        let Some(range) = self.config.heartbeat.active_hours.as_deref().filter(|s| !s.is_empty()) else {
            return true;
        };
        let Some((start, end)) = range.split_once('-') else {
            warn!(range, "malformed active_hours, ignoring");
            return true;
        };
        let (Ok(start), Ok(end)) = (
            NaiveTime::parse_from_str(start.trim(), "%H:%M"),
            NaiveTime::parse_from_str(end.trim(), "%H:%M"),
        ) else {
            warn!(range, "malformed active_hours, ignoring");
            return true;
        };
        let local = chrono::Local::now().time();
        if start <= end {
            local >= start && local <= end
        } else {
            // Wraps midnight, e.g. 22:00-06:00.
            local >= start || local <= end
        }
    }
}

#[async_trait]
impl HeartbeatWaker for HeartbeatSource {
    async fn wake(&self, chat_fk: i64) {
        let mut state = self.state.lock().unwrap();
        state.entry(chat_fk).or_default().last_activity = Some(Utc::now());
    }

    async fn should_suppress_heartbeat_reply(&self, chat_fk: i64, content: &str) -> bool {
        if self.config.heartbeat.suppress_ack && content.trim() == self.config.heartbeat.ack_token {
            return true;
        }
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(chat_fk).or_default();
        if let Some((last_content, last_at)) = &entry.last_reply {
            if last_content == content
                && (now - *last_at).num_milliseconds() < self.config.heartbeat.dedupe_window_ms as i64
            {
                return true;
            }
        }
        entry.last_reply = Some((content.to_string(), now));
        false
    }
}
