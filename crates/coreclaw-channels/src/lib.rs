//! Channels for Coreclaw (§6): the CLI channel (stdin line reader plus
//! `/dlq` admin commands) and the webhook channel (HTTP inbound POST,
//! outbound-drain GET). Both are thin adapters over
//! `coreclaw_core::bus::MessageBus` — all durability, retry, and
//! dead-letter behavior lives there.

pub mod cli;
pub mod outbox;
pub mod webhook;

pub use cli::CliChannel;
pub use outbox::Outbox;
pub use webhook::WebhookChannel;
