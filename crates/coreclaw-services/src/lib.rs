//! Background services that publish synthetic inbound envelopes onto
//! the [`coreclaw_core::bus::MessageBus`]: the task scheduler (§4.3) and
//! the per-chat heartbeat source (§4.4).
//!
//! Follows `clawft-services::cron_service`/`heartbeat`'s tick-loop shape
//! (a `CancellationToken`-gated `tokio::time::interval` spawned by a
//! `start`/`stop` pair), generalized from that crate's in-memory job
//! table and single mpsc sender to Coreclaw's storage-backed `Task`
//! model and durable bus.

pub mod heartbeat;
pub mod scheduler;

pub use heartbeat::HeartbeatSource;
pub use scheduler::Scheduler;
