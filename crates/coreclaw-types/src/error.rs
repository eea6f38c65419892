//! Error types for the Coreclaw runtime.
//!
//! Provides [`CoreclawError`] as the top-level error type. Variants are
//! grouped into recoverable (retry, timeout, rate-limit) and fatal
//! (config, policy, migration) categories to guide callers on whether
//! retrying is worthwhile. Both the bus dispatch loop and the tool-calling
//! loop inspect this grouping to decide retry vs. dead-letter.

use thiserror::Error;

/// Top-level error type for the Coreclaw runtime.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreclawError {
    // ── Recoverable ──────────────────────────────────────────────────
    /// A transient failure that may succeed on retry.
    #[error("retry required: {source} (attempt {attempts})")]
    Retry {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
        attempts: u32,
    },

    /// A handler exceeded its deadline.
    #[error("handler timed out after {timeout_ms}ms: {operation}")]
    HandlerTimeout { operation: String, timeout_ms: u64 },

    /// A registered bus handler returned an error.
    #[error("handler error: {0}")]
    HandlerError(String),

    /// The LLM provider did not respond within its deadline.
    #[error("provider timed out: {operation}")]
    ProviderTimeout { operation: String },

    /// The LLM provider responded but the response could not be parsed
    /// into the expected shape.
    #[error("provider returned an invalid response: {reason}")]
    ProviderInvalidResponse { reason: String },

    /// The provider is throttling requests.
    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// A bus queue rejected a publish because it is at capacity.
    #[error("queue overflow: {queue} has {depth} pending (limit {limit})")]
    QueueOverflow {
        queue: String,
        depth: u64,
        limit: u64,
    },

    /// A tool circuit breaker is currently open.
    #[error("circuit open for tool {tool}, retry after {retry_after_ms}ms")]
    CircuitOpen { tool: String, retry_after_ms: u64 },

    /// The isolated worker process failed to execute a tool call.
    #[error("isolated worker failure: {reason}")]
    IsolatedWorkerFailure { reason: String },

    // ── Fatal ────────────────────────────────────────────────────────
    /// Configuration is malformed or semantically invalid.
    #[error("invalid config: {reason}")]
    ConfigInvalid { reason: String },

    /// A database migration failed partway through.
    #[error("migration {id} failed: {reason} (pre-migration backup at {backup_path})")]
    MigrationFailed {
        id: String,
        reason: String,
        backup_path: String,
    },

    /// Arguments supplied to a tool or API call were malformed.
    #[error("bad arguments: {reason}")]
    BadArgs { reason: String },

    /// A tool/policy check denied an operation.
    #[error("policy denied: {reason}")]
    PolicyDenied { reason: String },

    /// A path resolved outside its workspace sandbox.
    #[error("workspace escape: {path} is outside {workspace}")]
    WorkspaceEscape { path: String, workspace: String },

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying SQLite storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A channel-layer error bubbled up.
    #[error("channel error: {0}")]
    Channel(String),
}

impl CoreclawError {
    /// Whether this error class is worth retrying (bus redelivery,
    /// provider call, tool invocation) or should be treated as terminal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreclawError::Retry { .. }
                | CoreclawError::HandlerTimeout { .. }
                | CoreclawError::HandlerError(_)
                | CoreclawError::ProviderTimeout { .. }
                | CoreclawError::RateLimited { .. }
                | CoreclawError::QueueOverflow { .. }
                | CoreclawError::CircuitOpen { .. }
        )
    }
}

/// A convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreclawError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_timeout_display() {
        let err = CoreclawError::HandlerTimeout {
            operation: "bus_dispatch".into(),
            timeout_ms: 5_000,
        };
        assert_eq!(
            err.to_string(),
            "handler timed out after 5000ms: bus_dispatch"
        );
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: CoreclawError = io_err.into();
        assert!(matches!(err, CoreclawError::Io(_)));
    }

    #[test]
    fn error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let err: CoreclawError = json_err.into();
        assert!(matches!(err, CoreclawError::Json(_)));
    }

    #[test]
    fn recoverable_classification() {
        assert!(CoreclawError::RateLimited { retry_after_ms: 10 }.is_recoverable());
        assert!(!CoreclawError::ConfigInvalid {
            reason: "bad".into()
        }
        .is_recoverable());
        assert!(!CoreclawError::WorkspaceEscape {
            path: "/tmp/x".into(),
            workspace: "/ws".into()
        }
        .is_recoverable());
    }

    #[test]
    fn result_alias_works() {
        fn ok_fn() -> Result<i32> {
            Ok(42)
        }
        fn err_fn() -> Result<i32> {
            Err(CoreclawError::BadArgs {
                reason: "boom".into(),
            })
        }
        assert_eq!(ok_fn().unwrap(), 42);
        assert!(err_fn().is_err());
    }
}
