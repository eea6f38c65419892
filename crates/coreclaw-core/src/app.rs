//! Application bootstrap and dependency wiring (§9).
//!
//! Follows `bootstrap::AppContext`'s shape: a single numbered
//! constructor that wires every component from a [`Config`], an
//! `into_*` style `start`/`stop` pair instead of `into_agent_loop`
//! (there is no separate loop object here, just the bus's own dispatch
//! tasks), and accessor methods so callers (channels, CLI, worker) can
//! reach the pieces they need after construction.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use coreclaw_llm::{OpenAiCompatProvider, Provider, RetryConfig, RetryPolicy};
use coreclaw_storage::Storage;
use coreclaw_types::config::Config;
use coreclaw_types::error::Result;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::agent::{AgentRuntime, ContextBuilder};
use crate::bus::MessageBus;
use crate::isolated::IsolatedToolRuntime;
use crate::observability::Observability;
use crate::router::{ConversationRouter, HeartbeatWaker, NoopHeartbeatWaker};
use crate::tools::{ToolPolicy, ToolRegistry};

/// Fully wired application. Owns every long-lived component and the
/// background tasks they spawn.
pub struct CoreclawApp {
    config: Arc<Config>,
    storage: Arc<Storage>,
    bus: Arc<MessageBus>,
    tools: Arc<ToolRegistry>,
    policy: Arc<ToolPolicy>,
    isolated: Arc<IsolatedToolRuntime>,
    provider: Arc<dyn Provider>,
    router: Arc<ConversationRouter>,
    observability: Arc<Observability>,
    slo_task: tokio::sync::Mutex<Option<(CancellationToken, tokio::task::JoinHandle<()>)>>,
}

impl CoreclawApp {
    /// Wire every component from configuration.
    ///
    /// `build_tools` is called once storage, the bus, the policy gate,
    /// and the isolated runtime all exist, and must return a populated
    /// [`ToolRegistry`] (the `coreclaw-tools` crate registers the
    /// concrete `Tool` implementations) so this crate never depends on
    /// them directly. Building tools from the *real* components here,
    /// rather than having the caller build them beforehand, matters:
    /// tools like `message.send` hold an `Arc<MessageBus>`, and that
    /// has to be the bus this app actually starts.
    pub async fn new<F>(config: Config, build_tools: F) -> Result<Self>
    where
        F: FnOnce(&Arc<Storage>, &Arc<MessageBus>, &Arc<ToolPolicy>, &Arc<IsolatedToolRuntime>) -> ToolRegistry,
    {
        let config = Arc::new(config);
        info!("bootstrapping coreclaw application");

        // 1. Storage: open and migrate the local SQLite database.
        let storage = Arc::new(Storage::new(
            config.sqlite_path(),
            config.data_path().join("backups"),
        ));
        storage.migrate().await?;
        debug!("storage migrated");

        // 2. Durable message bus.
        let bus = Arc::new(MessageBus::new(storage.clone(), config.bus.clone()));
        debug!("message bus created");

        // 3. Tool policy gate.
        let policy = Arc::new(ToolPolicy::new(config.clone(), storage.clone()));
        debug!("tool policy gate created");

        // 4. Isolated tool runtime (shell.exec / web.fetch / fs.write workers).
        let isolated = Arc::new(IsolatedToolRuntime::new(config.clone()));
        debug!(enabled = config.isolation.enabled, "isolated tool runtime created");

        // 5. Tool registry, built by the caller against the real storage/bus/policy/isolated.
        let tools = Arc::new(build_tools(&storage, &bus, &policy, &isolated));

        // 6. LLM provider, wrapped in retry/backoff.
        let base_provider = OpenAiCompatProvider::new(config.provider.clone());
        let provider: Arc<dyn Provider> = Arc::new(RetryPolicy::new(base_provider, RetryConfig::default()));
        debug!(model = %config.provider.model, "llm provider created");

        // 7. Observability/SLO surface, built before the agent runtime so
        // every tool call it makes can be recorded.
        let observability = Arc::new(Observability::new(storage.clone(), config.clone()));

        // 8. Context builder and bounded agent loop.
        let context_builder = ContextBuilder::new(config.clone(), storage.clone());
        let agent_runtime = AgentRuntime::new(
            provider.clone(),
            tools.clone(),
            policy.clone(),
            config.clone(),
            observability.clone(),
        );

        // 9. Conversation router, registered as the bus's inbound handler.
        let heartbeat_waker: Arc<dyn HeartbeatWaker> = Arc::new(NoopHeartbeatWaker);
        let router = Arc::new(ConversationRouter::new(
            storage.clone(),
            bus.clone(),
            context_builder,
            agent_runtime,
            config.clone(),
            heartbeat_waker,
            provider.clone(),
        ));
        bus.register_inbound_handler(router.clone());
        debug!("conversation router wired as inbound handler");

        info!("bootstrap complete");

        Ok(CoreclawApp {
            config,
            storage,
            bus,
            tools,
            policy,
            isolated,
            provider,
            router,
            observability,
            slo_task: tokio::sync::Mutex::new(None),
        })
    }

    /// Starts the bus dispatch tasks and the periodic SLO check. Safe to
    /// call once; a second call on an already-started app is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.bus.start().await?;

        let mut guard = self.slo_task.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let token = CancellationToken::new();
        let this = Arc::clone(self);
        let child_token = token.clone();
        let join = tokio::spawn(async move { this.slo_loop(child_token).await });
        *guard = Some((token, join));
        Ok(())
    }

    /// Stops the bus dispatch tasks and the SLO check, draining
    /// in-flight work within the bus's processing timeout.
    pub async fn stop(&self) {
        self.bus.stop().await;
        if let Some((token, join)) = self.slo_task.lock().await.take() {
            token.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(5), join).await;
        }
    }

    async fn slo_loop(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.observability.check_slo().await {
                        warn!(error = %e, "slo check failed");
                    }
                }
            }
        }
    }

    /// Builds the `axum` router serving `/metrics`, `/status`, and the
    /// `/health/{live,ready,startup}` probes (§6, §4.10). Channels that
    /// need their own HTTP surface (the webhook channel) nest their own
    /// router alongside this one rather than merging into it.
    pub fn observability_router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/status", get(status_handler))
            .route("/health/live", get(|| async { "ok" }))
            .route("/health/ready", get(ready_handler))
            .route("/health/startup", get(|| async { "ok" }))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Binds and serves the observability HTTP surface if
    /// `observability.http.enabled` is set.
    pub async fn serve_observability(self: &Arc<Self>) -> Result<()> {
        let http = &self.config.observability.http;
        if !http.enabled {
            return Ok(());
        }
        let addr: SocketAddr = format!("{}:{}", http.host, http.port)
            .parse()
            .map_err(|e| coreclaw_types::error::CoreclawError::ConfigInvalid {
                reason: format!("invalid observability bind address: {e}"),
            })?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "observability http surface listening");
        let router = self.observability_router();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "observability http server exited");
            }
        });
        Ok(())
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn policy(&self) -> &Arc<ToolPolicy> {
        &self.policy
    }

    pub fn isolated(&self) -> &Arc<IsolatedToolRuntime> {
        &self.isolated
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn router(&self) -> &Arc<ConversationRouter> {
        &self.router
    }

    pub fn observability(&self) -> &Arc<Observability> {
        &self.observability
    }
}

async fn metrics_handler(State(app): State<Arc<CoreclawApp>>) -> impl IntoResponse {
    match app.observability.snapshot().await {
        Ok(snapshot) => Observability::render_prometheus(&snapshot),
        Err(e) => {
            warn!(error = %e, "failed to render metrics snapshot");
            String::new()
        }
    }
}

async fn status_handler(State(app): State<Arc<CoreclawApp>>) -> impl IntoResponse {
    match app.observability.snapshot().await {
        Ok(snapshot) => axum::Json(snapshot).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to render status snapshot");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn ready_handler(State(app): State<Arc<CoreclawApp>>) -> impl IntoResponse {
    match app.storage.get_meta("schema_version").await {
        Ok(_) => axum::http::StatusCode::OK,
        Err(_) => axum::http::StatusCode::SERVICE_UNAVAILABLE,
    }
}
