//! Context builder: assembles the system prompt and message history for
//! one inbound turn under a token budget.
//!
//! Follows `ContextBuilder`'s shape (system prompt + skills + memory +
//! history, in that fixed order) and `LlmMessage`, carried over
//! near-verbatim. That builder read its sources through a `Platform`
//! abstraction backed by a `Session`; this version reads workspace files
//! directly off disk and pulls history from `coreclaw_storage::Storage`
//! instead, since there is no session/platform layer in this system.

use std::path::{Path, PathBuf};

use coreclaw_storage::Storage;
use coreclaw_types::config::Config;
use coreclaw_types::envelope::{InboundEnvelope, RunKind, RunMode};
use coreclaw_types::error::Result;
use tracing::debug;

/// An LLM message with role and content.
#[derive(Debug, Clone)]
pub struct LlmMessage {
    /// Message role: `"system"`, `"user"`, `"assistant"`, or `"tool"`.
    pub role: String,
    pub content: String,
    /// Set on tool-result messages.
    pub tool_call_id: Option<String>,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        LlmMessage {
            role: "system".to_string(),
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        LlmMessage {
            role: "user".to_string(),
            content: content.into(),
            tool_call_id: None,
        }
    }
}

const IDENTITY_FILE: &str = "IDENTITY.md";
const TOOL_POLICY_FILE: &str = "TOOLS.md";
const USER_PROFILE_FILE: &str = "USER.md";
pub const GLOBAL_MEMORY_FILE: &str = "memory/global.md";
const MIN_BUDGET_TOKENS: f64 = 256.0;
const MIN_SYSTEM_PROMPT_TOKENS: f64 = 64.0;
const MIN_LAST_MESSAGE_TOKENS: f64 = 32.0;
const TRUNCATION_SUFFIX: &str = "\n...[truncated by token budget]";

/// A loaded `skills/<name>/SKILL.md` entry.
#[derive(Debug, Clone)]
struct SkillEntry {
    name: String,
    description: String,
    always: bool,
    body: String,
}

pub struct ContextBuilder {
    config: std::sync::Arc<Config>,
    storage: std::sync::Arc<Storage>,
}

impl ContextBuilder {
    pub fn new(config: std::sync::Arc<Config>, storage: std::sync::Arc<Storage>) -> Self {
        ContextBuilder { config, storage }
    }

    /// Build the full message list for one inbound turn: system prompt,
    /// history (if the run mode includes chat context), and the final
    /// user message, trimmed to fit the provider's token budget.
    pub async fn build_messages(
        &self,
        chat_fk: i64,
        envelope: &InboundEnvelope,
    ) -> Result<Vec<LlmMessage>> {
        let run_mode = RunMode::derive(envelope);
        let include_chat = run_mode.includes_chat_context();

        let system_prompt = self.build_system_prompt(chat_fk, &run_mode, include_chat).await?;
        let mut messages = vec![LlmMessage::system(system_prompt)];

        if include_chat {
            let history = self
                .storage
                .list_recent_conversational_messages(chat_fk, self.config.history_max_messages)
                .await?;
            for m in history {
                messages.push(LlmMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content,
                    tool_call_id: None,
                });
            }
        }

        let user_content = if run_mode.kind == RunKind::Scheduled {
            format!("[Scheduled Task] {}", envelope.content)
        } else {
            envelope.content.clone()
        };
        messages.push(LlmMessage::user(user_content));

        let budget = (self.config.provider.max_input_tokens as f64
            - self.config.provider.reserve_output_tokens as f64)
            .max(MIN_BUDGET_TOKENS);
        Ok(apply_token_budget(messages, budget))
    }

    async fn build_system_prompt(
        &self,
        chat_fk: i64,
        run_mode: &RunMode,
        include_chat: bool,
    ) -> Result<String> {
        let workspace = self.config.workspace_path();
        let mut sections: Vec<String> = Vec::new();

        if let Some(identity) = read_workspace_file(&workspace, IDENTITY_FILE).await {
            sections.push(identity);
        }
        if let Some(policy) = read_workspace_file(&workspace, TOOL_POLICY_FILE).await {
            sections.push(policy);
        }
        if let Some(profile) = read_workspace_file(&workspace, USER_PROFILE_FILE).await {
            sections.push(profile);
        }
        if let Some(global_memory) = read_workspace_file(&workspace, GLOBAL_MEMORY_FILE).await {
            sections.push(global_memory);
        }

        if include_chat {
            if let Some(chat) = self.storage.get_chat_by_fk(chat_fk).await? {
                let filename = chat_memory_filename(&chat.channel, &chat.chat_id);
                if let Some(chat_memory) = read_workspace_file(&workspace, &filename).await {
                    sections.push(chat_memory);
                }
            }
        }

        let skills = load_skills(&workspace).await;
        if !skills.is_empty() {
            let mut index = String::from("Skills:");
            for skill in &skills {
                let flags = if skill.always { " [always]" } else { "" };
                index.push_str(&format!("\n- {}{}: {}", skill.name, flags, skill.description));
            }
            sections.push(index);

            for skill in skills.iter().filter(|s| s.always) {
                sections.push(skill.body.clone());
            }

            if include_chat {
                let state = self.storage.get_conversation_state(chat_fk).await?;
                for skill in skills
                    .iter()
                    .filter(|s| !s.always && state.enabled_skills.iter().any(|n| n == &s.name))
                {
                    sections.push(skill.body.clone());
                }
            }
        }

        if include_chat {
            let state = self.storage.get_conversation_state(chat_fk).await?;
            if let Some(summary) = state.summary {
                if !summary.is_empty() {
                    sections.push(format!("Conversation summary: {summary}"));
                }
            }
        }

        Ok(sections.join("\n\n"))
    }
}

async fn read_workspace_file(workspace: &Path, relative: &str) -> Option<String> {
    let path = workspace.join(relative);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) if !contents.trim().is_empty() => Some(contents),
        Ok(_) => None,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "workspace file not read");
            None
        }
    }
}

async fn load_skills(workspace: &Path) -> Vec<SkillEntry> {
    let skills_dir = workspace.join("skills");
    let mut entries = Vec::new();
    let Ok(mut read_dir) = tokio::fs::read_dir(&skills_dir).await else {
        return entries;
    };
    while let Ok(Some(dir_entry)) = read_dir.next_entry().await {
        let skill_path = dir_entry.path().join("SKILL.md");
        if let Ok(raw) = tokio::fs::read_to_string(&skill_path).await {
            if let Some(skill) = parse_skill(&raw) {
                entries.push(skill);
            }
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

fn parse_skill(raw: &str) -> Option<SkillEntry> {
    let raw = raw.trim_start();
    if !raw.starts_with("---") {
        return None;
    }
    let rest = &raw[3..];
    let end = rest.find("---")?;
    let frontmatter = &rest[..end];
    let body = rest[end + 3..].trim_start().to_string();

    let mut name = None;
    let mut description = String::new();
    let mut always = false;
    for line in frontmatter.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"');
        match key {
            "name" => name = Some(value.to_string()),
            "description" => description = value.to_string(),
            "always" => always = value == "true",
            _ => {}
        }
    }

    Some(SkillEntry {
        name: name?,
        description,
        always,
        body,
    })
}

/// `memory/{channel}_{sanitized(chatId)}.md` per the workspace path
/// resolution rules: percent-encode, fold `%` into `_`, strip control
/// characters, cap at 120 characters.
///
/// Public so the `memory.write`/`memory.read` tools can target the same
/// file the context builder reads from, without duplicating the
/// sanitization rule.
pub fn chat_memory_filename(channel: &str, chat_id: &str) -> String {
    format!("memory/{}_{}.md", channel, sanitize_chat_id(chat_id))
}

pub fn sanitize_chat_id(chat_id: &str) -> String {
    let mut percent_encoded = String::new();
    for c in chat_id.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
            percent_encoded.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).as_bytes() {
                percent_encoded.push('%');
                percent_encoded.push_str(&format!("{byte:02X}"));
            }
        }
    }
    let folded: String = percent_encoded
        .chars()
        .map(|c| if c == '%' { '_' } else { c })
        .collect();
    let stripped: String = folded.chars().filter(|c| !c.is_control()).collect();
    stripped.chars().take(120).collect()
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x309F  // Hiragana
        | 0x30A0..=0x30FF // Katakana
        | 0x4E00..=0x9FFF // CJK Unified Ideographs
        | 0x3400..=0x4DBF // CJK Extension A
        | 0xAC00..=0xD7A3 // Hangul syllables
        | 0x1100..=0x11FF // Hangul Jamo
    )
}

fn estimate_tokens(text: &str) -> f64 {
    text.chars()
        .map(|c| if is_cjk(c) { 1.0 } else { 0.25 })
        .sum()
}

fn estimate_message_tokens(msg: &LlmMessage) -> f64 {
    4.0 + estimate_tokens(&msg.content)
}

fn total_tokens(messages: &[LlmMessage]) -> f64 {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Applies the three-step eviction: drop oldest non-system messages,
/// then truncate the system prompt, then truncate the last message.
fn apply_token_budget(mut messages: Vec<LlmMessage>, budget: f64) -> Vec<LlmMessage> {
    // Step 1: drop oldest non-system messages (index 1) while more
    // than the system message plus one tail message remain.
    while total_tokens(&messages) > budget && messages.len() > 2 {
        messages.remove(1);
    }

    if total_tokens(&messages) <= budget {
        return messages;
    }

    // Step 2: truncate the system prompt.
    if let Some(system) = messages.first_mut() {
        let others: f64 = messages[1..].iter().map(estimate_message_tokens).sum();
        let available = (budget - others - 4.0).max(MIN_SYSTEM_PROMPT_TOKENS);
        system.content = truncate_to_tokens(&system.content, available, TRUNCATION_SUFFIX);
    }

    if total_tokens(&messages) <= budget {
        return messages;
    }

    // Step 3: truncate the last message.
    let system_and_head_tokens: f64 = {
        let len = messages.len();
        messages[..len.saturating_sub(1)]
            .iter()
            .map(estimate_message_tokens)
            .sum()
    };
    if let Some(last) = messages.last_mut() {
        let available = (budget - system_and_head_tokens - 4.0).max(MIN_LAST_MESSAGE_TOKENS);
        last.content = truncate_to_tokens(&last.content, available, TRUNCATION_SUFFIX);
    }

    messages
}

/// Truncates `text` so its estimated token cost plus `suffix`'s fits in
/// `budget_tokens`, preferring to cut at a character boundary.
fn truncate_to_tokens(text: &str, budget_tokens: f64, suffix: &str) -> String {
    let suffix_tokens = estimate_tokens(suffix);
    let content_budget = (budget_tokens - suffix_tokens).max(0.0);

    let mut kept = String::new();
    let mut used = 0.0;
    for c in text.chars() {
        let cost = if is_cjk(c) { 1.0 } else { 0.25 };
        if used + cost > content_budget {
            break;
        }
        used += cost;
        kept.push(c);
    }
    if kept.len() == text.len() {
        return text.to_string();
    }
    kept.push_str(suffix);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tokens_ascii() {
        assert_eq!(estimate_tokens("abcd"), 1.0);
    }

    #[test]
    fn estimate_tokens_cjk() {
        assert_eq!(estimate_tokens("日本語"), 3.0);
    }

    #[test]
    fn sanitize_chat_id_encodes_slash() {
        let sanitized = sanitize_chat_id("a/b");
        assert!(!sanitized.contains('/'));
        assert!(sanitized.contains("_2F"));
    }

    #[test]
    fn sanitize_chat_id_caps_length() {
        let long_id = "a".repeat(500);
        let sanitized = sanitize_chat_id(&long_id);
        assert!(sanitized.chars().count() <= 120);
    }

    #[test]
    fn budget_drops_oldest_messages_first() {
        let messages = vec![
            LlmMessage::system("sys"),
            LlmMessage::user("first message that is old"),
            LlmMessage::user("second message that is old"),
            LlmMessage::user("final message"),
        ];
        let result = apply_token_budget(messages, 10.0);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].role, "system");
        assert_eq!(result[1].content, "final message");
    }

    #[test]
    fn budget_truncates_system_prompt_when_needed() {
        let messages = vec![
            LlmMessage::system(&"x".repeat(2000)),
            LlmMessage::user("final message"),
        ];
        let result = apply_token_budget(messages, 30.0);
        assert!(result[0].content.ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn parse_skill_reads_frontmatter() {
        let raw = "---\nname: weather\ndescription: gets weather\nalways: true\n---\nBody text";
        let skill = parse_skill(raw).unwrap();
        assert_eq!(skill.name, "weather");
        assert_eq!(skill.description, "gets weather");
        assert!(skill.always);
        assert_eq!(skill.body, "Body text");
    }

    #[test]
    fn parse_skill_without_frontmatter_is_none() {
        assert!(parse_skill("just some text").is_none());
    }
}
