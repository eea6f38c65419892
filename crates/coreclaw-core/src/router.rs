//! Conversation Router (§4.9): the single entry point that turns one
//! inbound envelope into an assistant turn and a published outbound
//! reply.
//!
//! Follows the reference crates' dependency-injection style (components
//! take `Arc<P: Platform>`): this router is constructed the same way,
//! with `Arc<Storage>`, `Arc<MessageBus>`, `Arc<ToolRegistry>`, and
//! `Arc<dyn Provider>` standing in for a platform handle.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use coreclaw_llm::{ChatMessage, ChatRequest, Provider};
use coreclaw_storage::{LedgerDecision, Storage};
use coreclaw_types::config::Config;
use coreclaw_types::envelope::{InboundEnvelope, OutboundEnvelope};
use coreclaw_types::error::Result;
use coreclaw_types::models::MessageRole;
use tracing::{info, warn};

use crate::agent::{AgentRuntime, ContextBuilder};
use crate::bus::{BusHandler, MessageBus};

/// A hook the router calls after a heartbeat-originated turn, so the
/// heartbeat source can debounce future wakes for that chat and decide
/// whether the reply should reach the channel at all (ack-token and
/// recent-duplicate suppression, §4.4). Kept as a trait so
/// `coreclaw-core` does not depend on `coreclaw-services`.
#[async_trait]
pub trait HeartbeatWaker: Send + Sync {
    async fn wake(&self, chat_fk: i64);

    /// Called only for envelopes where `is_heartbeat()` is true, with
    /// the content the agent produced. Returning `true` drops the
    /// outbound reply instead of publishing it.
    async fn should_suppress_heartbeat_reply(&self, _chat_fk: i64, _content: &str) -> bool {
        false
    }
}

pub struct NoopHeartbeatWaker;

#[async_trait]
impl HeartbeatWaker for NoopHeartbeatWaker {
    async fn wake(&self, _chat_fk: i64) {}
}

pub struct ConversationRouter {
    storage: Arc<Storage>,
    bus: Arc<MessageBus>,
    context_builder: ContextBuilder,
    agent_runtime: AgentRuntime,
    config: Arc<Config>,
    heartbeat_waker: std::sync::RwLock<Arc<dyn HeartbeatWaker>>,
    provider: Arc<dyn Provider>,
}

impl ConversationRouter {
    pub fn new(
        storage: Arc<Storage>,
        bus: Arc<MessageBus>,
        context_builder: ContextBuilder,
        agent_runtime: AgentRuntime,
        config: Arc<Config>,
        heartbeat_waker: Arc<dyn HeartbeatWaker>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        ConversationRouter {
            storage,
            bus,
            context_builder,
            agent_runtime,
            config,
            heartbeat_waker: std::sync::RwLock::new(heartbeat_waker),
            provider,
        }
    }

    /// Swaps in the real heartbeat source once it is constructed. The
    /// router is wired with [`NoopHeartbeatWaker`] at bootstrap because
    /// the heartbeat source itself needs the router's own `Arc<Storage>`
    /// and `Arc<MessageBus>` handles, which only exist after this router
    /// is built — so the concrete waker is injected post-construction
    /// instead of threaded through the constructor.
    pub fn set_heartbeat_waker(&self, waker: Arc<dyn HeartbeatWaker>) {
        *self.heartbeat_waker.write().unwrap() = waker;
    }

    pub async fn handle_inbound(&self, envelope: InboundEnvelope) -> Result<()> {
        let chat = self
            .storage
            .get_or_create_chat(&envelope.channel, &envelope.chat_id)
            .await?;
        let outbound_id = format!("outbound:{}:{}:{}", envelope.channel, envelope.chat_id, envelope.id);

        let (decision, existing) = self
            .storage
            .claim_inbound_execution(
                &envelope.id,
                self.config.bus.processing_timeout_ms as i64,
                &outbound_id,
            )
            .await?;

        match decision {
            LedgerDecision::InProgressElsewhere => {
                if let Some(execution) = existing {
                    if let Some(content) = execution.result_content {
                        self.publish_outbound(&envelope, &outbound_id, &content).await?;
                    }
                }
                return Ok(());
            }
            LedgerDecision::Claimed => {}
        }

        let persist = chat.registered || self.config.store_full_messages;
        let sender_allowed = self.config.allowed_channel_identities.is_empty()
            || envelope
                .sender_id
                .as_deref()
                .map(|s| self.config.allowed_channel_identities.iter().any(|a| a == s))
                .unwrap_or(true);

        if persist && sender_allowed {
            self.storage
                .insert_message(
                    chat.id,
                    MessageRole::User,
                    envelope.sender_id.as_deref(),
                    &envelope.content,
                )
                .await?;
        }

        let run_result = self.run_turn(chat.id, &envelope).await;

        let content = match run_result {
            Ok(content) => content,
            Err(e) => {
                self.storage.fail_inbound_execution(&envelope.id).await?;
                return Err(e);
            }
        };

        if persist && sender_allowed {
            self.storage
                .insert_message(chat.id, MessageRole::Assistant, None, &content)
                .await?;
        }

        let waker = self.heartbeat_waker.read().unwrap().clone();
        let suppress = envelope.is_heartbeat()
            && waker.should_suppress_heartbeat_reply(chat.id, &content).await;
        if !suppress {
            self.publish_outbound(&envelope, &outbound_id, &content).await?;
        }
        self.storage
            .complete_inbound_execution(&envelope.id, &content)
            .await?;

        if !envelope.is_heartbeat() {
            waker.wake(chat.id).await;
        }

        self.maybe_compact(chat.id).await?;

        Ok(())
    }

    async fn run_turn(&self, chat_fk: i64, envelope: &InboundEnvelope) -> Result<String> {
        let messages = self.context_builder.build_messages(chat_fk, envelope).await?;
        let chat = self.storage.get_chat_by_fk(chat_fk).await?;
        let role = chat.map(|c| c.role).unwrap_or_default();
        let outcome = self.agent_runtime.run(messages, role).await?;
        Ok(outcome.content)
    }

    async fn publish_outbound(
        &self,
        envelope: &InboundEnvelope,
        outbound_id: &str,
        content: &str,
    ) -> Result<()> {
        let outbound = OutboundEnvelope {
            id: outbound_id.to_string(),
            channel: envelope.channel.clone(),
            chat_id: envelope.chat_id.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
            metadata: Default::default(),
        };
        match self.bus.publish_outbound(&outbound).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "failed to publish outbound reply");
                Err(e)
            }
        }
    }

    async fn maybe_compact(&self, chat_fk: i64) -> Result<()> {
        let threshold = self.config.history_max_messages as u64 * 2;
        let count = self.storage.count_messages(chat_fk).await?;
        if count <= threshold {
            return Ok(());
        }
        info!(chat_fk, count, threshold, "running background compaction");

        let history = self
            .storage
            .list_recent_conversational_messages(chat_fk, self.config.history_max_messages)
            .await?;
        let transcript: String = history
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let request = ChatRequest::new(
            self.config.provider.model.clone(),
            vec![
                ChatMessage::system("Summarize the conversation in 150 words or fewer."),
                ChatMessage::user(transcript),
            ],
        );
        match self.provider.complete(&request).await {
            Ok(response) => {
                if let Some(choice) = response.choices.into_iter().next() {
                    self.storage
                        .update_conversation_summary(chat_fk, &choice.message.content)
                        .await?;
                }
            }
            Err(e) => warn!(error = %e, "compaction summary call failed, pruning without summary"),
        }

        self.storage
            .prune_messages(chat_fk, self.config.history_max_messages)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BusHandler<InboundEnvelope> for ConversationRouter {
    async fn handle(&self, envelope: InboundEnvelope) -> Result<()> {
        self.handle_inbound(envelope).await
    }
}
