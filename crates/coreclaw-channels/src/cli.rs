//! CLI channel (§6 "CLI channel"): reads stdin line-by-line, publishes
//! each line as an inbound envelope on an implicit single chat, and
//! prints outbound replies for that chat to stdout.
//!
//! Follows the reference crates' `CancellationToken`-gated channel
//! lifecycle shape (registering itself as an outbound handler, then
//! looping until cancelled), though none of them has a stdin-driven
//! channel to port directly from — this is built from the line-reader
//! contract plus the `/dlq` admin commands, which call straight through
//! to `coreclaw_core::bus::MessageBus`'s dead-letter API.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use coreclaw_core::bus::{BusHandler, MessageBus};
use coreclaw_types::envelope::{Direction, InboundEnvelope, OutboundEnvelope};
use coreclaw_types::error::Result;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub const CHANNEL_NAME: &str = "cli";
const DEFAULT_DLQ_LIMIT: i64 = 20;

pub struct CliChannel {
    bus: Arc<MessageBus>,
    chat_id: String,
}

impl CliChannel {
    pub fn new(bus: Arc<MessageBus>) -> Arc<Self> {
        Arc::new(CliChannel {
            bus,
            chat_id: "local".to_string(),
        })
    }

    /// Reads stdin until `/exit`, EOF, or cancellation. Registers
    /// itself as an outbound handler first so replies to this chat are
    /// printed as they arrive.
    pub async fn run(self: &Arc<Self>, token: CancellationToken) -> Result<()> {
        self.bus.register_outbound_handler(self.clone());

        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();

        loop {
            let line = tokio::select! {
                _ = token.cancelled() => break,
                line = lines.next_line() => line,
            };

            let Ok(Some(line)) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "/exit" {
                token.cancel();
                break;
            }
            if let Some(rest) = line.strip_prefix("/dlq ") {
                self.handle_dlq_command(rest.trim()).await;
                continue;
            }

            let envelope = InboundEnvelope {
                id: Uuid::new_v4().to_string(),
                channel: CHANNEL_NAME.to_string(),
                chat_id: self.chat_id.clone(),
                sender_id: Some("cli-user".to_string()),
                content: line.to_string(),
                created_at: Utc::now(),
                metadata: HashMap::new(),
            };
            if let Err(e) = self.bus.publish_inbound(&envelope).await {
                warn!(error = %e, "failed to publish cli inbound message");
            }
        }

        info!("cli channel stopped");
        Ok(())
    }

    async fn handle_dlq_command(&self, rest: &str) {
        let mut parts = rest.split_whitespace();
        match parts.next() {
            Some("list") => {
                let direction = parts.next().and_then(parse_direction_arg);
                let limit = parts
                    .next()
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(DEFAULT_DLQ_LIMIT);
                match self.bus.list_dead_letter(direction, limit).await {
                    Ok(records) => {
                        for r in records {
                            println!(
                                "{}",
                                json!({
                                    "id": r.id,
                                    "direction": r.direction.as_str(),
                                    "attempts": r.attempts,
                                    "lastError": r.last_error,
                                    "payload": r.payload,
                                })
                            );
                        }
                    }
                    Err(e) => eprintln!("{{\"error\": \"{e}\"}}"),
                }
            }
            Some("replay") => {
                let target = parts.next().unwrap_or("all");
                let limit = parts
                    .next()
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(DEFAULT_DLQ_LIMIT);
                let (queue_id, direction) = match target.parse::<i64>() {
                    Ok(id) => (Some(id), None),
                    Err(_) => (None, parse_direction_arg(target)),
                };
                match self.bus.replay_dead_letter(queue_id, direction, limit).await {
                    Ok(replayed) => println!("{}", json!({ "replayed": replayed })),
                    Err(e) => eprintln!("{{\"error\": \"{e}\"}}"),
                }
            }
            _ => eprintln!("usage: /dlq list [inbound|outbound|all] [limit] | /dlq replay <queueId|inbound|outbound|all> [limit]"),
        }
    }
}

fn parse_direction_arg(s: &str) -> Option<Direction> {
    match s {
        "inbound" => Some(Direction::Inbound),
        "outbound" => Some(Direction::Outbound),
        _ => None,
    }
}

#[async_trait]
impl BusHandler<OutboundEnvelope> for CliChannel {
    async fn handle(&self, envelope: OutboundEnvelope) -> Result<()> {
        if envelope.channel == CHANNEL_NAME && envelope.chat_id == self.chat_id {
            println!("{}", envelope.content);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_direction_arg_recognizes_both_directions() {
        assert_eq!(parse_direction_arg("inbound"), Some(Direction::Inbound));
        assert_eq!(parse_direction_arg("outbound"), Some(Direction::Outbound));
    }

    #[test]
    fn parse_direction_arg_treats_anything_else_as_all() {
        assert_eq!(parse_direction_arg("all"), None);
        assert_eq!(parse_direction_arg("42"), None);
        assert_eq!(parse_direction_arg(""), None);
    }

    #[tokio::test]
    async fn handle_drops_replies_for_other_channels_and_chats() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(coreclaw_storage::Storage::new(
            dir.path().join("db.sqlite"),
            dir.path().join("backups"),
        ));
        storage.migrate().await.unwrap();
        let bus = Arc::new(MessageBus::new(storage, coreclaw_types::config::BusConfig::default()));
        let channel = CliChannel::new(bus);

        // Neither call should panic; mismatched channel/chat are silently ignored.
        channel
            .handle(OutboundEnvelope {
                id: "1".to_string(),
                channel: "webhook".to_string(),
                chat_id: "local".to_string(),
                content: "ignored".to_string(),
                created_at: Utc::now(),
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
        channel
            .handle(OutboundEnvelope {
                id: "2".to_string(),
                channel: CHANNEL_NAME.to_string(),
                chat_id: "other".to_string(),
                content: "ignored".to_string(),
                created_at: Utc::now(),
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
    }
}
