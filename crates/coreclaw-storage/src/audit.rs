use chrono::Utc;
use coreclaw_types::error::Result;
use coreclaw_types::models::{AuditEvent, AuditOutcome};
use rusqlite::params;

use crate::chat::storage_err;
use crate::{spawn_blocking_storage, Storage};

/// Keys whose values must never reach the audit log in plaintext.
const REDACTED_KEYS: &[&str] = &["bootstrapkey", "authtoken", "apikey"];

/// Replace sensitive argument values with `"[REDACTED]"` before
/// persisting, matching on key name case-insensitively and also on any
/// key containing "secret" or "password".
pub fn redact_args(args: &serde_json::Value) -> serde_json::Value {
    match args {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                let lower = key.to_lowercase();
                let sensitive = REDACTED_KEYS.contains(&lower.as_str())
                    || lower.contains("secret")
                    || lower.contains("password");
                if sensitive {
                    out.insert(key.clone(), serde_json::Value::String("[REDACTED]".into()));
                } else {
                    out.insert(key.clone(), redact_args(value));
                }
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(redact_args).collect())
        }
        other => other.clone(),
    }
}

impl Storage {
    pub async fn record_audit_event(
        &self,
        kind: &str,
        tool_name: Option<&str>,
        outcome: AuditOutcome,
        reason: Option<&str>,
        args: Option<&serde_json::Value>,
    ) -> Result<AuditEvent> {
        let this = self.clone();
        let kind = kind.to_string();
        let tool_name = tool_name.map(str::to_string);
        let reason = reason.map(str::to_string);
        let args_json = args.map(|a| redact_args(a).to_string());
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO audit_events (kind, tool_name, outcome, reason, args_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    kind,
                    tool_name,
                    outcome.as_str(),
                    reason,
                    args_json,
                    created_at.timestamp_millis(),
                ],
            )
            .map_err(storage_err)?;
            Ok(AuditEvent {
                id: conn.last_insert_rowid(),
                kind,
                tool_name,
                outcome,
                reason,
                args_json,
                created_at,
            })
        })
        .await
    }

    pub async fn list_recent_audit_events(&self, limit: i64) -> Result<Vec<AuditEvent>> {
        let this = self.clone();
        spawn_blocking_storage(move || {
            let conn = this.open().map_err(storage_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, kind, tool_name, outcome, reason, args_json, created_at
                     FROM audit_events ORDER BY id DESC LIMIT ?1",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map([limit], |row| {
                    let outcome: String = row.get(3)?;
                    let created_ms: i64 = row.get(6)?;
                    Ok(AuditEvent {
                        id: row.get(0)?,
                        kind: row.get(1)?,
                        tool_name: row.get(2)?,
                        outcome: match outcome.as_str() {
                            "denied" => AuditOutcome::Denied,
                            "error" => AuditOutcome::Error,
                            _ => AuditOutcome::Ok,
                        },
                        reason: row.get(4)?,
                        args_json: row.get(5)?,
                        created_at: coreclaw_types::cron::ms_to_datetime(created_ms).unwrap_or_else(Utc::now),
                    })
                })
                .map_err(storage_err)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn storage() -> Storage {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("db.sqlite"), dir.path().join("backups"));
        storage.migrate().await.unwrap();
        std::mem::forget(dir);
        storage
    }

    #[test]
    fn redacts_sensitive_keys_recursively() {
        let args = json!({
            "path": "foo.txt",
            "apiKey": "sk-abc",
            "nested": { "authToken": "xyz", "ok": "kept" },
        });
        let redacted = redact_args(&args);
        assert_eq!(redacted["path"], "foo.txt");
        assert_eq!(redacted["apiKey"], "[REDACTED]");
        assert_eq!(redacted["nested"]["authToken"], "[REDACTED]");
        assert_eq!(redacted["nested"]["ok"], "kept");
    }

    #[tokio::test]
    async fn audit_events_persist_and_list() {
        let storage = storage().await;
        storage
            .record_audit_event(
                "tool_call",
                Some("shell.exec"),
                AuditOutcome::Denied,
                Some("shell disabled"),
                Some(&json!({"command": "ls"})),
            )
            .await
            .unwrap();
        let events = storage.list_recent_audit_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].outcome, AuditOutcome::Denied));
    }
}
