//! LLM provider abstraction for Coreclaw.
//!
//! This crate calls a single configured OpenAI-compatible chat completion
//! endpoint. It is standalone except for [`coreclaw_types::config::ProviderConfig`],
//! which supplies the base URL, model, API key, and timeout.
//!
//! # Architecture
//!
//! - [`Provider`] trait defines the chat completion interface
//! - [`OpenAiCompatProvider`] is the default implementation
//! - [`RetryPolicy`] wraps any [`Provider`] with exponential backoff
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use coreclaw_llm::{OpenAiCompatProvider, ChatRequest, ChatMessage, Provider};
//! use coreclaw_types::config::ProviderConfig;
//!
//! let provider = OpenAiCompatProvider::new(ProviderConfig::default());
//! let request = ChatRequest::new("gpt-4o-mini", vec![
//!     ChatMessage::system("You are a helpful assistant."),
//!     ChatMessage::user("What is Rust?"),
//! ]);
//! let response = provider.complete(&request).await?;
//! println!("{}", response.choices[0].message.content);
//! ```

pub mod error;
pub mod openai_compat;
pub mod provider;
pub mod retry;
pub mod types;

pub use error::{ProviderError, Result};
pub use openai_compat::OpenAiCompatProvider;
pub use provider::Provider;
pub use retry::{RetryConfig, RetryPolicy};
pub use types::{ChatMessage, ChatRequest, ChatResponse, Choice, FunctionCall, ToolCall, Usage};
