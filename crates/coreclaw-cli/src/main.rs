//! `coreclaw` binary entry point.
//!
//! Two modes, selected before `clap` ever runs:
//! - `coreclaw __coreclaw-worker` — the hidden isolated-tool-runtime
//!   child process (§4.5). Not advertised in `--help`; `IsolatedToolRuntime`
//!   always re-invokes `std::env::current_exe()` with exactly this
//!   argument, so it has to be checked before normal argument parsing
//!   can reject it as an unknown subcommand.
//! - everything else — the supervisor: load config, bootstrap
//!   [`coreclaw_core::app::CoreclawApp`], start the scheduler, the
//!   heartbeat source, and the CLI/webhook channels, and run until
//!   interrupted.
//!
//! Follows `clawft-cli::main`'s overall shape (`clap` derive, a
//! `tracing-subscriber` init gated on `--verbose`, `#[tokio::main]`),
//! trimmed to the handful of concerns this runtime actually has — most
//! of that binary's subcommand surface (skills, agents, workspace,
//! onboarding, security scans) has no counterpart here.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use coreclaw_channels::{CliChannel, WebhookChannel};
use coreclaw_core::app::CoreclawApp;
use coreclaw_core::tools::ToolRegistry;
use coreclaw_services::{HeartbeatSource, Scheduler};
use coreclaw_types::config::Config;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const WORKER_SUBCOMMAND: &str = "__coreclaw-worker";

#[derive(Parser, Debug)]
#[command(name = "coreclaw", about = "Coreclaw chat-agent runtime")]
struct Cli {
    /// Path to the JSON config file. Defaults to ~/.coreclaw/config.json.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().nth(1).as_deref() == Some(WORKER_SUBCOMMAND) {
        return coreclaw_worker::run_stdio().await;
    }

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .init();

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = load_or_default_config(&config_path)?;

    let app = bootstrap(config).await?;
    app.start().await?;
    app.serve_observability().await?;

    let scheduler = Arc::new(Scheduler::new(
        app.storage().clone(),
        app.bus().clone(),
        app.observability().clone(),
        app.config().clone(),
    ));
    scheduler.start().await;

    let heartbeat = Arc::new(HeartbeatSource::new(
        app.storage().clone(),
        app.bus().clone(),
        app.config().clone(),
    ));
    app.router().set_heartbeat_waker(heartbeat.clone());
    heartbeat.start().await;

    let webhook = WebhookChannel::new(app.bus().clone(), app.config().webhook.clone());
    webhook.serve().await?;

    let cli_token = CancellationToken::new();
    let cli_channel = CliChannel::new(app.bus().clone());
    let cli_task = {
        let token = cli_token.clone();
        tokio::spawn(async move { cli_channel.run(token).await })
    };

    wait_for_shutdown_signal().await;
    info!("shutting down");

    cli_token.cancel();
    let _ = cli_task.await;
    heartbeat.stop().await;
    scheduler.stop().await;
    app.stop().await;

    Ok(())
}

async fn bootstrap(config: Config) -> anyhow::Result<Arc<CoreclawApp>> {
    let tools_config = Arc::new(config.clone());
    let app = CoreclawApp::new(config, move |storage, bus, policy, isolated| {
        let mut registry = ToolRegistry::new();
        coreclaw_tools::register_all(
            &mut registry,
            tools_config.workspace_path(),
            tools_config.clone(),
            policy.clone(),
            isolated.clone(),
            bus.clone(),
            storage.clone(),
        );
        registry
    })
    .await?;
    Ok(Arc::new(app))
}

fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".coreclaw")
        .join("config.json")
}

fn load_or_default_config(path: &std::path::Path) -> anyhow::Result<Config> {
    if path.exists() {
        Ok(Config::load(path)?)
    } else {
        warn!(path = %path.display(), "no config file found, using defaults");
        Ok(Config::default())
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_path_lives_under_dot_coreclaw() {
        let path = default_config_path();
        assert!(path.ends_with(".coreclaw/config.json"));
    }

    #[test]
    fn load_or_default_config_falls_back_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let config = load_or_default_config(&missing).unwrap();
        assert_eq!(config.workspace_dir, Config::default().workspace_dir);
    }

    #[test]
    fn load_or_default_config_reads_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"workspace_dir": "/tmp/custom-workspace"}"#).unwrap();
        let config = load_or_default_config(&path).unwrap();
        assert_eq!(config.workspace_dir, "/tmp/custom-workspace");
    }

    #[test]
    fn worker_subcommand_constant_matches_isolated_runtime_contract() {
        assert_eq!(WORKER_SUBCOMMAND, "__coreclaw-worker");
    }
}
