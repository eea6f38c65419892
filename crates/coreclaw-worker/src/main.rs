//! Standalone `coreclaw-worker` binary: a slimmer sandbox image for
//! deployments that don't want to ship the full `coreclaw-cli`
//! executable into the child-process sandbox. Speaks the same
//! stdin/stdout protocol as `coreclaw-cli`'s hidden `__coreclaw-worker`
//! subcommand (`coreclaw_worker::run_stdio`).

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    coreclaw_worker::run_stdio().await
}
