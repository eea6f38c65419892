//! Tool policy gate: decides whether a chat may invoke a given tool,
//! enforces the admin bootstrap protocol, and vets outbound URLs for
//! `web.fetch`.
//!
//! Follows `check_tool_permission`'s shape (a denylist then allowlist
//! then permission-level cascade over a flat `UserPermissions` struct):
//! this version keeps the cascade shape but
//! replaces the flat permission level with the two-role model
//! (`ChatRole::Admin` / `ChatRole::Normal`) and a small table of named
//! per-tool rules, since nothing in this system needs more than two
//! roles.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use coreclaw_storage::Storage;
use coreclaw_types::config::Config;
use coreclaw_types::error::Result;
use coreclaw_types::models::{AuditOutcome, ChatRole};
use ipnet::IpNet;
use serde_json::Value;
use tracing::warn;
use url::Url;

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

const META_BOOTSTRAP_ATTEMPTS: &str = "admin_bootstrap_attempts";
const META_BOOTSTRAP_LOCKED_UNTIL: &str = "admin_bootstrap_locked_until_ms";
const META_BOOTSTRAP_CONSUMED: &str = "admin_bootstrap_consumed";

/// The set of request shapes a tool call needs scrutiny for, beyond a
/// flat name-to-role lookup.
#[derive(Debug, Default, Clone)]
pub struct ToolCallContext {
    /// For `fs.write`: the path argument, already joined to the workspace.
    pub fs_path: Option<String>,
    /// For `memory.write`: the `scope` argument (`"chat"` or `"global"`).
    pub memory_scope: Option<String>,
    /// For `message.send`: true if the target chat differs from the
    /// chat the tool call originated in.
    pub cross_chat: bool,
}

pub struct ToolPolicy {
    config: Arc<Config>,
    storage: Arc<Storage>,
}

impl ToolPolicy {
    pub fn new(config: Arc<Config>, storage: Arc<Storage>) -> Self {
        ToolPolicy { config, storage }
    }

    /// Check whether `tool_name` may be invoked by a chat with the
    /// given role, recording an audit event for the outcome.
    pub async fn check(
        &self,
        tool_name: &str,
        role: ChatRole,
        args: &Value,
        ctx: &ToolCallContext,
    ) -> Result<PolicyDecision> {
        let decision = evaluate_policy(&self.config, tool_name, role, ctx);
        let outcome = if decision.is_allowed() {
            AuditOutcome::Ok
        } else {
            AuditOutcome::Denied
        };
        let reason = match &decision {
            PolicyDecision::Allow => None,
            PolicyDecision::Deny { reason } => Some(reason.as_str()),
        };
        self.storage
            .record_audit_event("tool_call", Some(tool_name), outcome, reason, Some(args))
            .await?;
        Ok(decision)
    }

    /// Attempt to redeem an admin bootstrap key for `chat_fk`, gated by
    /// an attempt counter and lockout window stored in the `meta`
    /// table. Returns `Allow` on success (caller is responsible for
    /// actually promoting the chat's role) or `Deny` with a reason
    /// otherwise.
    pub async fn attempt_bootstrap(
        &self,
        chat_fk: i64,
        provided_key: &str,
    ) -> Result<PolicyDecision> {
        let Some(configured_key) = self.config.admin_bootstrap_key.as_deref() else {
            return Ok(deny("admin bootstrap is not configured"));
        };

        if self.storage.any_admin_exists().await? {
            return Ok(deny("an admin chat already exists"));
        }

        if self.config.admin_bootstrap_single_use {
            if let Some(consumed) = self.storage.get_meta(META_BOOTSTRAP_CONSUMED).await? {
                if consumed == "true" {
                    return Ok(deny("admin bootstrap key has already been used"));
                }
            }
        }

        let now_ms = Utc::now().timestamp_millis();
        if let Some(locked_until) = self.storage.get_meta_i64(META_BOOTSTRAP_LOCKED_UNTIL).await? {
            if now_ms < locked_until {
                return Ok(deny("too many failed bootstrap attempts, try again later"));
            }
        }

        if provided_key != configured_key {
            let attempts = self
                .storage
                .get_meta_i64(META_BOOTSTRAP_ATTEMPTS)
                .await?
                .unwrap_or(0)
                + 1;
            self.storage
                .set_meta(META_BOOTSTRAP_ATTEMPTS, &attempts.to_string())
                .await?;
            if attempts >= self.config.admin_bootstrap_max_attempts as i64 {
                let lockout_ms =
                    (self.config.admin_bootstrap_lockout_minutes as i64) * 60 * 1000;
                self.storage
                    .set_meta(
                        META_BOOTSTRAP_LOCKED_UNTIL,
                        &(now_ms + lockout_ms).to_string(),
                    )
                    .await?;
                warn!(chat_fk, attempts, "admin bootstrap locked out after too many failures");
            }
            return Ok(deny("invalid bootstrap key"));
        }

        self.storage.delete_meta(META_BOOTSTRAP_ATTEMPTS).await?;
        self.storage.delete_meta(META_BOOTSTRAP_LOCKED_UNTIL).await?;
        if self.config.admin_bootstrap_single_use {
            self.storage.set_meta(META_BOOTSTRAP_CONSUMED, "true").await?;
        }
        Ok(PolicyDecision::Allow)
    }

    /// Vet a `web.fetch` target URL against scheme, domain, port, and
    /// private/CGNAT address rules.
    pub fn check_url(&self, raw_url: &str) -> Result<PolicyDecision> {
        let url = match Url::parse(raw_url) {
            Ok(u) => u,
            Err(e) => return Ok(deny(&format!("invalid URL: {e}"))),
        };

        if url.scheme() != "http" && url.scheme() != "https" {
            return Ok(deny("only http/https URLs are allowed"));
        }

        let Some(host) = url.host_str() else {
            return Ok(deny("URL has no host"));
        };

        if !self.config.allowed_web_domains.is_empty()
            && !self
                .config
                .allowed_web_domains
                .iter()
                .any(|d| host == d || host.ends_with(&format!(".{d}")))
        {
            return Ok(deny("host is not in the allowed domain list"));
        }

        if let Some(port) = url.port_or_known_default() {
            if self.config.blocked_web_ports.contains(&port) {
                return Ok(deny("port is blocked"));
            }
            if !self.config.allowed_web_ports.is_empty()
                && !self.config.allowed_web_ports.contains(&port)
            {
                return Ok(deny("port is not in the allowed port list"));
            }
        }

        if host.ends_with(".localhost") || host == "localhost" {
            return Ok(deny("localhost targets are blocked"));
        }

        if let Ok(ip) = IpAddr::from_str(host) {
            if is_blocked_ip(&ip) {
                return Ok(deny("target resolves to a private or reserved address"));
            }
        }

        Ok(PolicyDecision::Allow)
    }
}

/// Pure rule cascade: denylist-style named rules, then a default
/// allow. Kept free of I/O so it can be unit tested without a
/// [`Storage`] instance.
fn evaluate_policy(
    config: &Config,
    tool_name: &str,
    role: ChatRole,
    ctx: &ToolCallContext,
) -> PolicyDecision {
    let is_admin = role == ChatRole::Admin;

    match tool_name {
        "shell.exec" if !is_admin => deny("shell.exec requires admin role"),
        // `chat.register` is how the first admin comes to exist at all, so it
        // can't be gated on already holding the admin role — `attempt_bootstrap`
        // itself enforces the key check, single-admin rule, and lockout.
        "fs.write" => {
            if let Some(path) = &ctx.fs_path {
                if !is_admin && is_protected_path(path) {
                    return deny("writing to this path requires admin role");
                }
            }
            PolicyDecision::Allow
        }
        "memory.write" => {
            if ctx.memory_scope.as_deref() == Some("global") && !is_admin {
                deny("writing global memory requires admin role")
            } else {
                PolicyDecision::Allow
            }
        }
        "message.send" => {
            if ctx.cross_chat && !is_admin {
                deny("sending to another chat requires admin role")
            } else {
                PolicyDecision::Allow
            }
        }
        name if name.starts_with("mcp.") => {
            if !is_admin {
                return deny("MCP tools require admin role");
            }
            if !mcp_tool_allowed(&config.allowed_mcp_tools, name) {
                return deny("MCP tool is not in the allowlist");
            }
            PolicyDecision::Allow
        }
        _ => PolicyDecision::Allow,
    }
}

/// Checks a raw `mcp.<server>.<tool>` name against the allowlist.
/// An empty allowlist permits everything. Entries may match the full
/// raw name, the `server.tool` suffix, its `server/tool` alias, or
/// just the server name on its own (allowing the whole server).
fn mcp_tool_allowed(allowed: &[String], name: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let suffix = name.strip_prefix("mcp.").unwrap_or(name);
    let slash_alias = suffix.replacen('.', "/", 1);
    let server = suffix.split('.').next().unwrap_or(suffix);
    allowed
        .iter()
        .any(|a| a == name || a == suffix || *a == slash_alias || a == server)
}

fn deny(reason: &str) -> PolicyDecision {
    PolicyDecision::Deny {
        reason: reason.to_string(),
    }
}

fn is_protected_path(path: &str) -> bool {
    const PROTECTED_FILES: &[&str] = &["IDENTITY.md", "TOOLS.md", "USER.md", ".mcp.json"];
    PROTECTED_FILES.contains(&path) || path.starts_with("skills/")
}

fn is_blocked_ip(ip: &IpAddr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_private() || v4.is_link_local() || v4.octets()[0] == 0 {
                return true;
            }
            const CGNAT: &str = "100.64.0.0/10";
            CGNAT
                .parse::<IpNet>()
                .map(|net| net.contains(v4))
                .unwrap_or(false)
        }
        IpAddr::V6(v6) => v6.is_unique_local() || v6.is_unicast_link_local(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_exec_denied_for_normal_role() {
        let config = Config::default();
        let ctx = ToolCallContext::default();
        let decision = evaluate_policy(&config, "shell.exec", ChatRole::Normal, &ctx);
        assert!(!decision.is_allowed());
    }

    #[test]
    fn shell_exec_allowed_for_admin_role() {
        let config = Config::default();
        let ctx = ToolCallContext::default();
        let decision = evaluate_policy(&config, "shell.exec", ChatRole::Admin, &ctx);
        assert!(decision.is_allowed());
    }

    #[test]
    fn protected_fs_write_denied_for_normal_role() {
        let config = Config::default();
        let ctx = ToolCallContext {
            fs_path: Some("IDENTITY.md".to_string()),
            ..Default::default()
        };
        let decision = evaluate_policy(&config, "fs.write", ChatRole::Normal, &ctx);
        assert!(!decision.is_allowed());
    }

    #[test]
    fn skills_dir_write_denied_for_normal_role() {
        let config = Config::default();
        let ctx = ToolCallContext {
            fs_path: Some("skills/foo/SKILL.md".to_string()),
            ..Default::default()
        };
        let decision = evaluate_policy(&config, "fs.write", ChatRole::Normal, &ctx);
        assert!(!decision.is_allowed());
    }

    #[test]
    fn unprotected_fs_write_allowed_for_normal_role() {
        let config = Config::default();
        let ctx = ToolCallContext {
            fs_path: Some("notes/todo.md".to_string()),
            ..Default::default()
        };
        let decision = evaluate_policy(&config, "fs.write", ChatRole::Normal, &ctx);
        assert!(decision.is_allowed());
    }

    #[test]
    fn cross_chat_message_send_denied_for_normal_role() {
        let config = Config::default();
        let ctx = ToolCallContext {
            cross_chat: true,
            ..Default::default()
        };
        let decision = evaluate_policy(&config, "message.send", ChatRole::Normal, &ctx);
        assert!(!decision.is_allowed());
    }

    #[test]
    fn mcp_tool_allowed_empty_allowlist_permits_everything() {
        assert!(mcp_tool_allowed(&[], "mcp.filesystem.read"));
    }

    #[test]
    fn mcp_tool_allowed_matches_server_tool_suffix() {
        let allowed = vec!["filesystem.read".to_string()];
        assert!(mcp_tool_allowed(&allowed, "mcp.filesystem.read"));
        assert!(!mcp_tool_allowed(&allowed, "mcp.filesystem.write"));
    }

    #[test]
    fn mcp_tool_allowed_matches_slash_alias() {
        let allowed = vec!["filesystem/read".to_string()];
        assert!(mcp_tool_allowed(&allowed, "mcp.filesystem.read"));
    }

    #[test]
    fn mcp_tool_allowed_matches_server_only_entry() {
        let allowed = vec!["filesystem".to_string()];
        assert!(mcp_tool_allowed(&allowed, "mcp.filesystem.read"));
        assert!(mcp_tool_allowed(&allowed, "mcp.filesystem.write"));
        assert!(!mcp_tool_allowed(&allowed, "mcp.github.create_issue"));
    }

    #[test]
    fn mcp_tool_denied_when_not_in_nonempty_allowlist() {
        let config = Config::default();
        let mut config = config;
        config.allowed_mcp_tools = vec!["filesystem.read".to_string()];
        let ctx = ToolCallContext::default();
        let decision = evaluate_policy(&config, "mcp.github.create_issue", ChatRole::Admin, &ctx);
        assert!(!decision.is_allowed());
    }

    #[test]
    fn is_blocked_ip_catches_cgnat() {
        let ip: IpAddr = "100.64.5.5".parse().unwrap();
        assert!(is_blocked_ip(&ip));
    }

    #[test]
    fn is_blocked_ip_allows_public_address() {
        let ip: IpAddr = "93.184.216.34".parse().unwrap();
        assert!(!is_blocked_ip(&ip));
    }
}
