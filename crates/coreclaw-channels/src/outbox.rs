//! Webhook outbox (§6 "Webhook channel"): an in-memory, per-chat queue
//! of outbound envelopes a polling client drains via
//! `GET {path}/outbound?chatId=...`.
//!
//! Bounded on three axes: `outboxMaxPerChat` entries per chat,
//! `outboxMaxChats` distinct chats total (oldest evicted first), and
//! `outboxChatTtlMs` age — pruned lazily on every push/drain rather than
//! by a background sweep, since nothing in the reference crates shapes
//! a sweep loop this could follow.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use coreclaw_types::config::WebhookConfig;
use coreclaw_types::envelope::OutboundEnvelope;

struct ChatQueue {
    entries: VecDeque<(DateTime<Utc>, OutboundEnvelope)>,
    last_touched: DateTime<Utc>,
}

pub struct Outbox {
    chats: Mutex<HashMap<String, ChatQueue>>,
    max_per_chat: usize,
    max_chats: usize,
    ttl: Duration,
}

impl Outbox {
    pub fn new(config: &WebhookConfig) -> Self {
        Outbox {
            chats: Mutex::new(HashMap::new()),
            max_per_chat: config.outbox_max_per_chat.max(1),
            max_chats: config.outbox_max_chats.max(1),
            ttl: Duration::from_millis(config.outbox_chat_ttl_ms),
        }
    }

    pub fn push(&self, envelope: OutboundEnvelope) {
        let now = Utc::now();
        let mut chats = self.chats.lock().unwrap();
        prune_expired(&mut chats, now, self.ttl);

        if !chats.contains_key(&envelope.chat_id) && chats.len() >= self.max_chats {
            if let Some(oldest) = chats
                .iter()
                .min_by_key(|(_, q)| q.last_touched)
                .map(|(k, _)| k.clone())
            {
                chats.remove(&oldest);
            }
        }

        let queue = chats.entry(envelope.chat_id.clone()).or_insert_with(|| ChatQueue {
            entries: VecDeque::new(),
            last_touched: now,
        });
        queue.last_touched = now;
        queue.entries.push_back((now, envelope));
        while queue.entries.len() > self.max_per_chat {
            queue.entries.pop_front();
        }
    }

    /// Removes and returns up to `limit` entries for `chat_id`, oldest first.
    pub fn drain(&self, chat_id: &str, limit: usize) -> Vec<OutboundEnvelope> {
        let now = Utc::now();
        let mut chats = self.chats.lock().unwrap();
        prune_expired(&mut chats, now, self.ttl);

        let Some(queue) = chats.get_mut(chat_id) else {
            return Vec::new();
        };
        queue.last_touched = now;
        let n = limit.min(queue.entries.len());
        queue.entries.drain(..n).map(|(_, e)| e).collect()
    }
}

fn prune_expired(chats: &mut HashMap<String, ChatQueue>, now: DateTime<Utc>, ttl: Duration) {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
    chats.retain(|_, queue| now - queue.last_touched < ttl);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn envelope(chat_id: &str, content: &str) -> OutboundEnvelope {
        OutboundEnvelope {
            id: uuid::Uuid::new_v4().to_string(),
            channel: "webhook".to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            metadata: StdHashMap::new(),
        }
    }

    #[test]
    fn drains_in_insertion_order() {
        let outbox = Outbox::new(&WebhookConfig::default());
        outbox.push(envelope("c1", "one"));
        outbox.push(envelope("c1", "two"));
        let drained = outbox.drain("c1", 10);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].content, "one");
        assert_eq!(drained[1].content, "two");
    }

    #[test]
    fn drain_removes_entries() {
        let outbox = Outbox::new(&WebhookConfig::default());
        outbox.push(envelope("c1", "one"));
        assert_eq!(outbox.drain("c1", 10).len(), 1);
        assert_eq!(outbox.drain("c1", 10).len(), 0);
    }

    #[test]
    fn bounded_per_chat() {
        let mut config = WebhookConfig::default();
        config.outbox_max_per_chat = 2;
        let outbox = Outbox::new(&config);
        outbox.push(envelope("c1", "one"));
        outbox.push(envelope("c1", "two"));
        outbox.push(envelope("c1", "three"));
        let drained = outbox.drain("c1", 10);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].content, "two");
        assert_eq!(drained[1].content, "three");
    }

    #[test]
    fn bounded_chat_count_evicts_oldest() {
        let mut config = WebhookConfig::default();
        config.outbox_max_chats = 1;
        let outbox = Outbox::new(&config);
        outbox.push(envelope("c1", "one"));
        outbox.push(envelope("c2", "two"));
        assert_eq!(outbox.drain("c1", 10).len(), 0);
        assert_eq!(outbox.drain("c2", 10).len(), 1);
    }
}
