//! Agent subsystem: context assembly and the bounded tool-calling loop.

pub mod context;
pub mod runtime;

pub use context::{ContextBuilder, LlmMessage};
pub use runtime::{AgentOutcome, AgentRuntime};
