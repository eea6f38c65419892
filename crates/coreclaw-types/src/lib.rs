//! # coreclaw-types
//!
//! Core type definitions for the Coreclaw chat-agent runtime. This crate
//! is the foundation of the dependency graph: storage, the bus, the tool
//! registry, and every crate above them share these types.
//!
//! - **[`error`]** -- [`CoreclawError`]
//! - **[`config`]** -- configuration schema, env overrides, hardened-profile gate
//! - **[`envelope`]** -- inbound/outbound bus envelopes, run-mode derivation
//! - **[`models`]** -- persisted row types (Chat, Message, Task, AuditEvent, ...)
//! - **[`cron`]** -- scheduled-task schedule representation

pub mod config;
pub mod cron;
pub mod envelope;
pub mod error;
pub mod models;

pub use error::{CoreclawError, Result};
