//! Observability/SLO surface (§4.10): in-memory metric counters, a
//! Prometheus-text and JSON snapshot, and threshold-triggered webhook
//! alerts.
//!
//! Grounded on `clawft-core::agent::sandbox`'s `Arc<Mutex<Vec<_>>>`
//! idiom for shared mutable state without `parking_lot` (that crate
//! only reaches for `parking_lot` in its clustering feature), and on
//! `clawft-services::api` for the `axum`/`tower-http` HTTP surface used
//! by the routes built on top of this module.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use coreclaw_storage::Storage;
use coreclaw_types::config::Config;
use coreclaw_types::envelope::Direction;
use coreclaw_types::error::Result;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Default, Clone, Serialize)]
pub struct ToolMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
    pub max_latency_ms: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SchedulerMetrics {
    pub dispatches: u64,
    pub tasks: u64,
    pub total_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct McpMetrics {
    pub calls: u64,
    pub failures: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BusMetrics {
    pub pending: u64,
    pub processing: u64,
    pub dead_letter: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct ObservabilitySnapshot {
    pub tools: HashMap<String, ToolMetrics>,
    pub scheduler: SchedulerMetrics,
    pub mcp: HashMap<String, McpMetrics>,
    pub bus_inbound: BusMetrics,
    pub bus_outbound: BusMetrics,
}

#[derive(Default)]
struct MetricsState {
    tools: HashMap<String, ToolMetrics>,
    scheduler: SchedulerMetrics,
    mcp: HashMap<String, McpMetrics>,
}

pub struct Observability {
    storage: Arc<Storage>,
    config: Arc<Config>,
    state: Mutex<MetricsState>,
    last_alert: Mutex<HashMap<String, Instant>>,
    http_client: reqwest::Client,
}

impl Observability {
    pub fn new(storage: Arc<Storage>, config: Arc<Config>) -> Self {
        Observability {
            storage,
            config,
            state: Mutex::new(MetricsState::default()),
            last_alert: Mutex::new(HashMap::new()),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn record_tool_call(&self, tool_name: &str, success: bool, latency_ms: u64) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        let entry = state.tools.entry(tool_name.to_string()).or_default();
        entry.calls += 1;
        if !success {
            entry.failures += 1;
        }
        entry.total_latency_ms += latency_ms;
        entry.max_latency_ms = entry.max_latency_ms.max(latency_ms);
    }

    pub fn record_scheduler_dispatch(&self, delay_ms: u64, task_count: u64) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.scheduler.dispatches += 1;
        state.scheduler.tasks += task_count;
        state.scheduler.total_delay_ms += delay_ms;
        state.scheduler.max_delay_ms = state.scheduler.max_delay_ms.max(delay_ms);
    }

    pub fn record_mcp_call(&self, server: &str, success: bool) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        let entry = state.mcp.entry(server.to_string()).or_default();
        entry.calls += 1;
        if !success {
            entry.failures += 1;
        }
    }

    pub async fn snapshot(&self) -> Result<ObservabilitySnapshot> {
        let (tools, scheduler, mcp) = {
            let state = self.state.lock().expect("metrics mutex poisoned");
            (state.tools.clone(), state.scheduler.clone(), state.mcp.clone())
        };

        let bus_inbound = BusMetrics {
            pending: self.storage.count_pending(Direction::Inbound).await?,
            processing: self.storage.count_processing(Direction::Inbound).await?,
            dead_letter: self.storage.count_dead_letter(Direction::Inbound).await?,
        };
        let bus_outbound = BusMetrics {
            pending: self.storage.count_pending(Direction::Outbound).await?,
            processing: self.storage.count_processing(Direction::Outbound).await?,
            dead_letter: self.storage.count_dead_letter(Direction::Outbound).await?,
        };

        Ok(ObservabilitySnapshot {
            tools,
            scheduler,
            mcp,
            bus_inbound,
            bus_outbound,
        })
    }

    pub fn render_prometheus(snapshot: &ObservabilitySnapshot) -> String {
        let mut out = String::new();
        for (name, metrics) in &snapshot.tools {
            out.push_str(&format!(
                "coreclaw_tool_calls_total{{tool=\"{name}\"}} {}\n",
                metrics.calls
            ));
            out.push_str(&format!(
                "coreclaw_tool_failures_total{{tool=\"{name}\"}} {}\n",
                metrics.failures
            ));
            out.push_str(&format!(
                "coreclaw_tool_max_latency_ms{{tool=\"{name}\"}} {}\n",
                metrics.max_latency_ms
            ));
        }
        out.push_str(&format!("coreclaw_scheduler_dispatches_total {}\n", snapshot.scheduler.dispatches));
        out.push_str(&format!("coreclaw_scheduler_max_delay_ms {}\n", snapshot.scheduler.max_delay_ms));
        out.push_str(&format!("coreclaw_bus_pending{{direction=\"inbound\"}} {}\n", snapshot.bus_inbound.pending));
        out.push_str(&format!("coreclaw_bus_pending{{direction=\"outbound\"}} {}\n", snapshot.bus_outbound.pending));
        out.push_str(&format!("coreclaw_bus_dead_letter{{direction=\"inbound\"}} {}\n", snapshot.bus_inbound.dead_letter));
        out.push_str(&format!("coreclaw_bus_dead_letter{{direction=\"outbound\"}} {}\n", snapshot.bus_outbound.dead_letter));
        for (server, metrics) in &snapshot.mcp {
            out.push_str(&format!("coreclaw_mcp_calls_total{{server=\"{server}\"}} {}\n", metrics.calls));
            out.push_str(&format!("coreclaw_mcp_failures_total{{server=\"{server}\"}} {}\n", metrics.failures));
        }
        out
    }

    /// Checks configured thresholds against the current snapshot and
    /// posts a cooldown-gated alert for each breach.
    pub async fn check_slo(&self) -> Result<()> {
        let snapshot = self.snapshot().await?;
        let slo = &self.config.slo;

        let mut breaches = Vec::new();
        if snapshot.bus_inbound.pending > slo.max_pending_queue
            || snapshot.bus_outbound.pending > slo.max_pending_queue
        {
            breaches.push("max_pending_queue".to_string());
        }
        if snapshot.bus_inbound.dead_letter > slo.max_dead_letter_queue
            || snapshot.bus_outbound.dead_letter > slo.max_dead_letter_queue
        {
            breaches.push("max_dead_letter_queue".to_string());
        }
        if snapshot.scheduler.max_delay_ms > slo.max_scheduler_delay_ms {
            breaches.push("max_scheduler_delay_ms".to_string());
        }
        for (name, metrics) in &snapshot.tools {
            if metrics.calls > 0 {
                let rate = metrics.failures as f64 / metrics.calls as f64;
                if rate > slo.max_tool_failure_rate {
                    breaches.push(format!("max_tool_failure_rate:{name}"));
                }
            }
        }
        for (server, metrics) in &snapshot.mcp {
            if metrics.calls > 0 {
                let rate = metrics.failures as f64 / metrics.calls as f64;
                if rate > slo.max_mcp_failure_rate {
                    breaches.push(format!("max_mcp_failure_rate:{server}"));
                }
            }
        }

        for breach in breaches {
            self.maybe_alert(&breach).await;
        }
        Ok(())
    }

    async fn maybe_alert(&self, breach: &str) {
        let Some(url) = self.config.slo.alert_webhook_url.as_deref() else {
            return;
        };

        {
            let mut last_alert = self.last_alert.lock().expect("alert mutex poisoned");
            let cooldown = Duration::from_millis(self.config.slo.alert_cooldown_ms);
            if let Some(last) = last_alert.get(breach) {
                if last.elapsed() < cooldown {
                    return;
                }
            }
            last_alert.insert(breach.to_string(), Instant::now());
        }

        let body = serde_json::json!({ "breach": breach });
        if let Err(e) = self.http_client.post(url).json(&body).send().await {
            warn!(error = %e, breach, "failed to post SLO alert");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_tool_call_accumulates() {
        let state = Mutex::new(MetricsState::default());
        {
            let mut s = state.lock().unwrap();
            let entry = s.tools.entry("shell.exec".to_string()).or_default();
            entry.calls += 1;
            entry.max_latency_ms = entry.max_latency_ms.max(50);
        }
        let s = state.lock().unwrap();
        assert_eq!(s.tools["shell.exec"].calls, 1);
        assert_eq!(s.tools["shell.exec"].max_latency_ms, 50);
    }

    #[tokio::test]
    async fn snapshot_reports_processing_count_from_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path().join("db.sqlite"), dir.path().join("backups")));
        storage.migrate().await.unwrap();
        std::mem::forget(dir);

        storage
            .publish(Direction::Inbound, "m1", "cli", "c1", "{}", 100, 5, None)
            .await
            .unwrap();
        storage.claim_batch(Direction::Inbound, 10).await.unwrap();

        let observability = Observability::new(storage, Arc::new(Config::default()));
        let snapshot = observability.snapshot().await.unwrap();
        assert_eq!(snapshot.bus_inbound.processing, 1);
        assert_eq!(snapshot.bus_inbound.pending, 0);
    }

    #[test]
    fn render_prometheus_includes_tool_lines() {
        let mut snapshot = ObservabilitySnapshot::default();
        snapshot.tools.insert(
            "shell.exec".to_string(),
            ToolMetrics {
                calls: 3,
                failures: 1,
                total_latency_ms: 300,
                max_latency_ms: 150,
            },
        );
        let rendered = Observability::render_prometheus(&snapshot);
        assert!(rendered.contains("coreclaw_tool_calls_total{tool=\"shell.exec\"} 3"));
        assert!(rendered.contains("coreclaw_tool_failures_total{tool=\"shell.exec\"} 1"));
    }
}
