//! `web.fetch`: vets a target URL against [`ToolPolicy::check_url`], then
//! against the same address space via DNS resolution, before making a
//! single non-redirecting request.
//!
//! Follows `web_fetch::WebFetchTool`'s overall shape (basic scheme
//! check, body-size cap, `{status, body, ...}`
//! response), and on `url_safety::validate_url`'s
//! `to_socket_addrs()`-based resolution step for the one SSRF gap
//! `ToolPolicy::check_url` leaves open: that function only rejects
//! literal IP hosts in blocked ranges, it never resolves a domain name.
//! This tool performs that resolution itself as defense-in-depth before
//! handing the URL to `reqwest`.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coreclaw_core::isolated::IsolatedToolRuntime;
use coreclaw_core::tools::policy::ToolPolicy;
use coreclaw_core::tools::registry::{Tool, ToolError};
use coreclaw_types::config::WebFetchConfig;
use serde_json::{json, Value};
use url::Url;

/// Best-effort check that none of a hostname's resolved addresses land
/// in a private/reserved range. Resolution failures are not treated as
/// rejections: the downstream HTTP client will simply fail to connect,
/// the same behavior `url_safety::validate_url` relies on.
pub fn resolved_addresses_are_safe(host: &str, port: u16) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return true;
    };
    !addrs
        .map(|addr| addr.ip())
        .any(|ip| ip.is_loopback() || ip.is_unspecified() || is_private_or_reserved(&ip))
}

fn is_private_or_reserved(ip: &std::net::IpAddr) -> bool {
    match ip {
        std::net::IpAddr::V4(v4) => v4.is_private() || v4.is_link_local() || v4.octets()[0] == 0,
        std::net::IpAddr::V6(v6) => v6.is_unique_local() || v6.is_unicast_link_local(),
    }
}

pub struct FetchResult {
    pub status: u16,
    pub headers: serde_json::Map<String, Value>,
    pub body: String,
    pub truncated: bool,
}

/// Make the actual request. Reused by both the in-process `Tool` impl
/// and the `coreclaw-worker` binary's `web.fetch` isolated path; the
/// caller is responsible for running URL policy checks first.
pub async fn run_direct(url: &str, config: &WebFetchConfig) -> Result<FetchResult, ToolError> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_millis(config.timeout_ms))
        .build()
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to build HTTP client: {e}")))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("request failed: {e}")))?;

    let status = response.status().as_u16();
    let mut headers = serde_json::Map::new();
    for (name, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.to_string(), Value::String(v.to_string()));
        }
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to read response body: {e}")))?;
    let body_full = String::from_utf8_lossy(&bytes);
    let truncated = body_full.chars().count() > config.max_response_chars;
    let body = if truncated {
        body_full.chars().take(config.max_response_chars).collect()
    } else {
        body_full.into_owned()
    };

    Ok(FetchResult { status, headers, body, truncated })
}

pub struct WebFetchTool {
    policy: Arc<ToolPolicy>,
    config: WebFetchConfig,
    isolated: Arc<IsolatedToolRuntime>,
}

impl WebFetchTool {
    pub fn new(policy: Arc<ToolPolicy>, config: WebFetchConfig, isolated: Arc<IsolatedToolRuntime>) -> Self {
        WebFetchTool { policy, config, isolated }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web.fetch"
    }

    fn description(&self) -> &str {
        "Fetch the contents of an http(s) URL"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "url": { "type": "string" } },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let url_str = args
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs("missing 'url'".into()))?;

        let decision = self
            .policy
            .check_url(url_str)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        if !decision.is_allowed() {
            return Err(ToolError::PermissionDenied {
                tool: "web.fetch".into(),
                reason: format!("{decision:?}"),
            });
        }

        let url = Url::parse(url_str).map_err(|e| ToolError::InvalidArgs(format!("invalid URL: {e}")))?;
        if let Some(host) = url.host_str() {
            let port = url.port_or_known_default().unwrap_or(443);
            if !resolved_addresses_are_safe(host, port) {
                return Err(ToolError::PermissionDenied {
                    tool: "web.fetch".into(),
                    reason: "resolved address is private or reserved".into(),
                });
            }
        }

        if self.isolated.handles("web.fetch") {
            let payload = json!({ "url": url_str });
            let result = self
                .isolated
                .execute("web.fetch", payload, Some(self.config.timeout_ms))
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            return Ok(result);
        }

        let result = run_direct(url_str, &self.config).await?;
        Ok(json!({
            "status": result.status,
            "headers": result.headers,
            "body": result.body,
            "truncated": result.truncated,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_resolution_is_unsafe() {
        assert!(!resolved_addresses_are_safe("localhost", 80));
    }

    #[test]
    fn unresolvable_host_defaults_to_safe() {
        assert!(resolved_addresses_are_safe("this-host-should-not-exist.invalid", 80));
    }
}
