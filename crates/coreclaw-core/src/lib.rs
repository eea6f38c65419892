//! # coreclaw-core
//!
//! Core engine for the Coreclaw chat-agent runtime: the durable message
//! bus, the tool registry and its policy gate, the isolated tool
//! runtime, the context builder and bounded agent loop, the
//! conversation router, and the observability surface.
//!
//! Every component here is constructed from an `Arc<coreclaw_storage::Storage>`
//! and wired together by [`app::CoreclawApp`]; there is no global mutable
//! state.

pub mod agent;
pub mod app;
pub mod bus;
pub mod isolated;
pub mod observability;
pub mod router;
pub mod tools;

pub use app::CoreclawApp;
pub use bus::{BusHandler, MessageBus};
pub use router::ConversationRouter;
