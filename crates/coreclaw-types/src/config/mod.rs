//! Configuration schema for the Coreclaw runtime.
//!
//! Loaded from a JSON file and overlaid with environment variables
//! (`CORECLAW_*`). All nested sections carry `#[serde(default)]` so a
//! minimal or empty config file is valid and every option has a sane
//! default, mirroring `clawft_types::config`'s convention.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

/// Root configuration for the Coreclaw runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub workspace_dir: String,
    pub data_dir: String,
    pub sqlite_path: String,
    #[serde(default = "default_history_max_messages")]
    pub history_max_messages: u32,
    #[serde(default)]
    pub store_full_messages: bool,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
    #[serde(default = "default_max_tool_output_chars")]
    pub max_tool_output_chars: usize,

    pub provider: ProviderConfig,
    pub bus: BusConfig,
    pub scheduler: SchedulerConfig,
    pub heartbeat: HeartbeatConfig,
    pub isolation: IsolationConfig,

    #[serde(default)]
    pub allow_shell: bool,
    #[serde(default)]
    pub allowed_shell_commands: Vec<String>,
    #[serde(default)]
    pub allowed_env: Vec<String>,
    #[serde(default)]
    pub allowed_web_domains: Vec<String>,
    #[serde(default)]
    pub allowed_web_ports: Vec<u16>,
    #[serde(default)]
    pub blocked_web_ports: Vec<u16>,
    #[serde(default)]
    pub allowed_channel_identities: Vec<String>,
    /// Allowlist for `mcp.*` tool calls. Each entry may name a server
    /// (`"server"`, matching any tool on it), a `server.tool` or
    /// `server/tool` pair, or the full raw tool name. Empty means no
    /// restriction beyond the admin-role check.
    #[serde(default)]
    pub allowed_mcp_tools: Vec<String>,

    pub admin_bootstrap_key: Option<String>,
    #[serde(default)]
    pub admin_bootstrap_single_use: bool,
    #[serde(default = "default_admin_bootstrap_max_attempts")]
    pub admin_bootstrap_max_attempts: u32,
    #[serde(default = "default_admin_bootstrap_lockout_minutes")]
    pub admin_bootstrap_lockout_minutes: u32,

    pub webhook: WebhookConfig,
    pub observability: ObservabilityConfig,
    pub slo: SloConfig,
    pub web_fetch: WebFetchConfig,

    #[serde(default)]
    pub security_profile: SecurityProfile,
}

fn default_history_max_messages() -> u32 {
    40
}
fn default_max_tool_iterations() -> u32 {
    8
}
fn default_max_tool_output_chars() -> usize {
    4_000
}
fn default_admin_bootstrap_max_attempts() -> u32 {
    5
}
fn default_admin_bootstrap_lockout_minutes() -> u32 {
    15
}

impl Config {
    /// Load from a JSON file, then apply `CORECLAW_*` environment
    /// variable overrides for the handful of keys operators most
    /// commonly need to override without touching the file.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Config> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CORECLAW_WORKSPACE_DIR") {
            self.workspace_dir = v;
        }
        if let Ok(v) = std::env::var("CORECLAW_DATA_DIR") {
            self.data_dir = v;
        }
        if let Ok(v) = std::env::var("CORECLAW_SQLITE_PATH") {
            self.sqlite_path = v;
        }
        if let Ok(v) = std::env::var("CORECLAW_PROVIDER_BASE_URL") {
            self.provider.base_url = v;
        }
        if let Ok(v) = std::env::var("CORECLAW_PROVIDER_API_KEY") {
            self.provider.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("CORECLAW_ADMIN_BOOTSTRAP_KEY") {
            self.admin_bootstrap_key = Some(v);
        }
        if let Ok(v) = std::env::var("CORECLAW_SECURITY_PROFILE") {
            self.security_profile = match v.as_str() {
                "hardened" => SecurityProfile::Hardened,
                _ => SecurityProfile::Default,
            };
        }
    }

    /// Expand a leading `~/` against the user's home directory.
    pub fn workspace_path(&self) -> PathBuf {
        expand_home(&self.workspace_dir)
    }

    pub fn data_path(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }

    pub fn sqlite_path(&self) -> PathBuf {
        expand_home(&self.sqlite_path)
    }

    /// Enforce the hardened-profile startup gate (§6): rejects
    /// permissive settings outright rather than silently downgrading
    /// them, so misconfiguration fails loud at boot.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.security_profile == SecurityProfile::Hardened {
            if self.allow_shell {
                return Err(crate::error::CoreclawError::ConfigInvalid {
                    reason: "hardened profile forbids allowShell=true".into(),
                });
            }
            if self.allowed_web_domains.is_empty() {
                return Err(crate::error::CoreclawError::ConfigInvalid {
                    reason: "hardened profile requires allowedWebDomains to be non-empty".into(),
                });
            }
            if self.webhook.enabled {
                if !is_loopback_host(&self.webhook.host) {
                    return Err(crate::error::CoreclawError::ConfigInvalid {
                        reason: "hardened profile requires webhook.host to be loopback".into(),
                    });
                }
                if self.webhook.auth_token.is_none() {
                    return Err(crate::error::CoreclawError::ConfigInvalid {
                        reason: "hardened profile requires webhook.authToken when webhook is enabled"
                            .into(),
                    });
                }
            }
            if self.observability.http.enabled && !is_loopback_host(&self.observability.http.host)
            {
                return Err(crate::error::CoreclawError::ConfigInvalid {
                    reason: "hardened profile requires observability.http.host to be loopback"
                        .into(),
                });
            }
        }
        Ok(())
    }
}

fn is_loopback_host(host: &str) -> bool {
    matches!(host, "127.0.0.1" | "::1" | "localhost")
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProfile {
    #[default]
    Default,
    Hardened,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub timeout_ms: u64,
    pub max_input_tokens: u32,
    pub reserve_output_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key: None,
            temperature: 0.7,
            timeout_ms: 30_000,
            max_input_tokens: 8_000,
            reserve_output_tokens: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub poll_ms: u64,
    pub batch_size: u32,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    pub processing_timeout_ms: u64,
    pub max_pending_inbound: u64,
    pub max_pending_outbound: u64,
    pub overload_pending_threshold: u64,
    pub overload_backoff_ms: u64,
    pub per_chat_rate_limit_window_ms: u64,
    pub per_chat_rate_limit_max: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            poll_ms: 250,
            batch_size: 10,
            max_attempts: 5,
            retry_backoff_ms: 1_000,
            max_retry_backoff_ms: 60_000,
            processing_timeout_ms: 30_000,
            max_pending_inbound: 1_000,
            max_pending_outbound: 1_000,
            overload_pending_threshold: 200,
            overload_backoff_ms: 100,
            per_chat_rate_limit_window_ms: 60_000,
            per_chat_rate_limit_max: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { tick_ms: 1_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub wake_debounce_ms: u64,
    pub wake_retry_ms: u64,
    pub prompt_path: Option<String>,
    pub active_hours: Option<String>,
    pub skip_when_inbound_busy: bool,
    pub ack_token: String,
    pub suppress_ack: bool,
    pub dedupe_window_ms: u64,
    pub max_dispatch_per_run: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            enabled: false,
            interval_ms: 3_600_000,
            wake_debounce_ms: 2_000,
            wake_retry_ms: 30_000,
            prompt_path: None,
            active_hours: None,
            skip_when_inbound_busy: true,
            ack_token: "[[NO_RESPONSE]]".into(),
            suppress_ack: true,
            dedupe_window_ms: 300_000,
            max_dispatch_per_run: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub enabled: bool,
    pub tool_names: Vec<String>,
    pub worker_timeout_ms: u64,
    pub max_worker_output_chars: usize,
    pub max_concurrent_workers: usize,
    pub open_circuit_after_failures: u32,
    pub circuit_reset_ms: u64,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        IsolationConfig {
            enabled: true,
            tool_names: vec!["shell.exec".into(), "web.fetch".into(), "fs.write".into()],
            worker_timeout_ms: 15_000,
            max_worker_output_chars: 20_000,
            max_concurrent_workers: 4,
            open_circuit_after_failures: 5,
            circuit_reset_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub auth_token: Option<String>,
    pub max_body_bytes: usize,
    pub outbox_max_per_chat: usize,
    pub outbox_max_chats: usize,
    pub outbox_chat_ttl_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        WebhookConfig {
            enabled: false,
            host: "127.0.0.1".into(),
            port: 8787,
            path: "/webhook".into(),
            auth_token: None,
            max_body_bytes: 65_536,
            outbox_max_per_chat: 100,
            outbox_max_chats: 500,
            outbox_chat_ttl_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub http: ObservabilityHttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityHttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ObservabilityHttpConfig {
    fn default() -> Self {
        ObservabilityHttpConfig {
            enabled: false,
            host: "127.0.0.1".into(),
            port: 9100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SloConfig {
    pub max_pending_queue: u64,
    pub max_dead_letter_queue: u64,
    pub max_tool_failure_rate: f64,
    pub max_scheduler_delay_ms: u64,
    pub max_mcp_failure_rate: f64,
    pub alert_webhook_url: Option<String>,
    pub alert_cooldown_ms: u64,
}

impl Default for SloConfig {
    fn default() -> Self {
        SloConfig {
            max_pending_queue: 500,
            max_dead_letter_queue: 50,
            max_tool_failure_rate: 0.5,
            max_scheduler_delay_ms: 60_000,
            max_mcp_failure_rate: 0.5,
            alert_webhook_url: None,
            alert_cooldown_ms: 300_000,
        }
    }
}

/// Bounds and timeout for the `web.fetch` tool (§4.5/§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebFetchConfig {
    pub max_response_chars: usize,
    pub timeout_ms: u64,
}

impl Default for WebFetchConfig {
    fn default() -> Self {
        WebFetchConfig {
            max_response_chars: 20_000,
            timeout_ms: 10_000,
        }
    }
}
