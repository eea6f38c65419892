//! Webhook channel (§6 "Webhook channel"): a small `axum` surface that
//! accepts inbound messages over HTTP and lets a polling client drain
//! outbound replies from an in-memory per-chat [`Outbox`].
//!
//! Grounded on `coreclaw_core::app::CoreclawApp::observability_router`
//! for the `axum` + `tower-http` (`CorsLayer`, `TraceLayer`) server
//! shape; request body size is bounded with
//! `tower_http::limit::RequestBodyLimitLayer` rather than hand-rolled
//! byte counting.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use coreclaw_core::bus::{BusHandler, MessageBus};
use coreclaw_types::config::WebhookConfig;
use coreclaw_types::envelope::{InboundEnvelope, OutboundEnvelope};
use coreclaw_types::error::{CoreclawError, Result};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::outbox::Outbox;

pub const CHANNEL_NAME: &str = "webhook";
const DEFAULT_OUTBOUND_LIMIT: usize = 50;
const MAX_OUTBOUND_LIMIT: usize = 200;

#[derive(Deserialize)]
struct InboundBody {
    #[serde(rename = "chatId")]
    chat_id: String,
    content: String,
    #[serde(rename = "senderId")]
    sender_id: Option<String>,
    id: Option<String>,
    #[serde(rename = "createdAt")]
    created_at: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    metadata: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct OutboundQuery {
    #[serde(rename = "chatId")]
    chat_id: String,
    limit: Option<usize>,
}

pub struct WebhookChannel {
    bus: Arc<MessageBus>,
    config: WebhookConfig,
    outbox: Outbox,
}

impl WebhookChannel {
    pub fn new(bus: Arc<MessageBus>, config: WebhookConfig) -> Arc<Self> {
        let outbox = Outbox::new(&config);
        Arc::new(WebhookChannel { bus, config, outbox })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        let outbound_path = format!("{}/outbound", self.config.path);
        Router::new()
            .route(&self.config.path, post(inbound_handler))
            .route(&outbound_path, get(outbound_handler))
            .layer(RequestBodyLimitLayer::new(self.config.max_body_bytes))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Binds and serves the webhook surface if `webhook.enabled` is set.
    /// Returns immediately (serving happens on a spawned task) once the
    /// listener is bound, or immediately with `Ok(())` if disabled.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        self.bus.register_outbound_handler(self.clone());
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| CoreclawError::ConfigInvalid {
                reason: format!("invalid webhook bind address: {e}"),
            })?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, path = %self.config.path, "webhook channel listening");
        let router = self.router();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "webhook server exited");
            }
        });
        Ok(())
    }

    fn authorize(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.config.auth_token.as_deref() else {
            return true;
        };
        if let Some(value) = headers.get("x-coreclaw-token").and_then(|v| v.to_str().ok()) {
            if value == expected {
                return true;
            }
        }
        if let Some(value) = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return token == expected;
            }
        }
        false
    }
}

#[async_trait]
impl BusHandler<OutboundEnvelope> for WebhookChannel {
    async fn handle(&self, envelope: OutboundEnvelope) -> Result<()> {
        if envelope.channel == CHANNEL_NAME {
            self.outbox.push(envelope);
        }
        Ok(())
    }
}

async fn inbound_handler(
    State(channel): State<Arc<WebhookChannel>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if !channel.authorize(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"ok": false, "error": "unauthorized"}))).into_response();
    }

    let parsed: InboundBody = match serde_json::from_slice(&body) {
        Ok(b) => b,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"ok": false, "error": format!("invalid body: {e}")})),
            )
                .into_response();
        }
    };
    if parsed.content.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "content must not be empty"})),
        )
            .into_response();
    }

    let envelope = InboundEnvelope {
        id: parsed.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        channel: CHANNEL_NAME.to_string(),
        chat_id: parsed.chat_id,
        sender_id: parsed.sender_id,
        content: parsed.content,
        created_at: parsed.created_at.unwrap_or_else(Utc::now),
        metadata: parsed.metadata,
    };

    match channel.bus.publish_inbound(&envelope).await {
        Ok(_) => (StatusCode::ACCEPTED, Json(json!({"ok": true, "id": envelope.id}))).into_response(),
        Err(e) => {
            warn!(error = %e, "webhook publish failed");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"ok": false, "error": e.to_string()})),
            )
                .into_response()
        }
    }
}

async fn outbound_handler(
    State(channel): State<Arc<WebhookChannel>>,
    Query(query): Query<OutboundQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_OUTBOUND_LIMIT).clamp(1, MAX_OUTBOUND_LIMIT);
    let drained = channel.outbox.drain(&query.chat_id, limit);
    Json(json!({ "messages": drained })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    async fn spawn_channel(mut config: WebhookConfig) -> (Arc<WebhookChannel>, String) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(coreclaw_storage::Storage::new(
            dir.path().join("db.sqlite"),
            dir.path().join("backups"),
        ));
        storage.migrate().await.unwrap();
        let bus = Arc::new(MessageBus::new(storage, coreclaw_types::config::BusConfig::default()));

        config.host = "127.0.0.1".to_string();
        config.port = 0;
        let channel = WebhookChannel::new(bus, config);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = channel.router();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        std::mem::forget(dir);
        (channel, format!("http://{addr}"))
    }

    #[tokio::test]
    async fn inbound_accepts_valid_body() {
        let (_, base) = spawn_channel(WebhookConfig::default()).await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/webhook"))
            .json(&json!({"chatId": "c1", "content": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn inbound_rejects_empty_content() {
        let (_, base) = spawn_channel(WebhookConfig::default()).await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/webhook"))
            .json(&json!({"chatId": "c1", "content": ""}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn inbound_requires_matching_token_when_configured() {
        let mut config = WebhookConfig::default();
        config.auth_token = Some("secret".to_string());
        let (_, base) = spawn_channel(config).await;
        let client = reqwest::Client::new();

        let unauthorized = client
            .post(format!("{base}/webhook"))
            .json(&json!({"chatId": "c1", "content": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(unauthorized.status(), 401);

        let authorized = client
            .post(format!("{base}/webhook"))
            .header("x-coreclaw-token", "secret")
            .json(&json!({"chatId": "c1", "content": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(authorized.status(), 202);
    }

    #[tokio::test]
    async fn outbound_drains_pushed_envelope() {
        let (channel, base) = spawn_channel(WebhookConfig::default()).await;
        channel
            .handle(OutboundEnvelope {
                id: "1".to_string(),
                channel: CHANNEL_NAME.to_string(),
                chat_id: "c1".to_string(),
                content: "reply".to_string(),
                created_at: Utc::now(),
                metadata: Default::default(),
            })
            .await
            .unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("{base}/webhook/outbound?chatId=c1"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["content"], "reply");
    }
}
