//! Immutable record model: [`Session`], [`Message`], [`Checkpoint`], [`Compaction`].
//!
//! Every persisted object has an `id`, an optional `parent_id` linking into a
//! per-session chain, and a `timestamp` that is monotonic per session. Within
//! a session, ids are totally ordered by timestamp (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeSet;
use uuid::Uuid;

/// The canonical session key for the owner's ongoing conversation.
pub const PRIMARY_SESSION_KEY: &str = "primary";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    Session,
    Message,
    Checkpoint,
    Compaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolUse,
    ToolResult,
    System,
}

impl Role {
    /// True for `tool_use`/`tool_result` — the roles that may never become a
    /// compaction boundary on their own (spec §4.5 step 5).
    pub fn is_tool(self) -> bool {
        matches!(self, Role::ToolUse | Role::ToolResult)
    }
}

/// A media reference carried by a message — images/audio are referenced, not
/// inlined by value (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    /// Opaque locator (file path, blob store key, or URL) owned by the caller.
    pub reference: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Audio,
}

/// Third-party override audit trail on a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Supervision {
    pub supervisor: String,
    pub intervention_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub parent_id: Option<String>,
    pub session_key: String,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,

    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<Json>,

    pub thinking: Option<String>,
    pub supervision: Option<Supervision>,
    /// Origin channel (e.g. "telegram", "tui", "cli") — opaque to the core.
    pub source: Option<String>,
    pub media: Vec<MediaRef>,
}

impl Message {
    pub fn new(session_key: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            session_key: session_key.into(),
            timestamp: Utc::now(),
            role,
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
            tool_input: None,
            thinking: None,
            supervision: None,
            source: None,
            media: Vec::new(),
        }
    }

    pub fn tool_use(
        session_key: impl Into<String>,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_input: Json,
    ) -> Self {
        let mut msg = Self::new(session_key, Role::ToolUse, String::new());
        msg.tool_call_id = Some(tool_call_id.into());
        msg.tool_name = Some(tool_name.into());
        msg.tool_input = Some(tool_input);
        msg
    }

    pub fn tool_result(
        session_key: impl Into<String>,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(session_key, Role::ToolResult, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// The 50-char content prefix used as the lossy half of the foreign-log
    /// dedup key (spec §9 "External log inheritance").
    pub fn content_prefix_50(&self) -> &str {
        let max = self.content.len().min(50);
        // content_prefix is used purely for dedup, never re-serialized for
        // display, so byte-truncation on a non-char-boundary is acceptable
        // here only because we immediately re-validate with `is_char_boundary`.
        let mut end = max;
        while end > 0 && !self.content.is_char_boundary(end) {
            end -= 1;
        }
        &self.content[..end]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub parent_id: Option<String>,
    pub session_key: String,
    pub timestamp: DateTime<Utc>,

    pub summary: String,
    pub topics: Vec<String>,
    pub key_decisions: Vec<String>,
    pub open_questions: Vec<String>,
    pub tokens_at_checkpoint: u32,
    pub message_count_at_checkpoint: usize,
    pub generated_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compaction {
    pub id: String,
    pub parent_id: Option<String>,
    pub session_key: String,
    pub timestamp: DateTime<Utc>,

    pub summary: String,
    pub first_kept_entry_id: String,
    pub tokens_before: u32,
    /// Resolved Open Question 1 (DESIGN.md): recomputed and persisted after
    /// truncation. `None` only for compactions written through the JSONL
    /// compatibility store, which cannot persist it.
    pub tokens_after: Option<u32>,
    pub needs_summary_retry: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub session_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub model: String,
    pub max_tokens: u32,
    pub compaction_count: u32,
    /// Advisory cache — may be recomputed from messages at any time.
    pub total_tokens: u32,
    pub flushed_thresholds: BTreeSet<u32>,
    pub flush_actioned: bool,
    /// Marks how far the foreign-log watcher has indexed external records;
    /// resolves Open Question 2 (DESIGN.md) by making re-import impossible
    /// for anything at or before this timestamp.
    pub transcript_indexed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(session_key: impl Into<String>, model: impl Into<String>, max_tokens: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_key: session_key.into(),
            created_at: now,
            updated_at: now,
            model: model.into(),
            max_tokens,
            compaction_count: 0,
            total_tokens: 0,
            flushed_thresholds: BTreeSet::new(),
            flush_actioned: false,
            transcript_indexed_at: None,
        }
    }

    pub fn primary(model: impl Into<String>, max_tokens: u32) -> Self {
        Self::new(PRIMARY_SESSION_KEY, model, max_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_prefix_is_safe_on_multibyte_boundary() {
        let msg = Message::new("primary", Role::User, "a".repeat(49) + "€€€");
        // Must not panic slicing mid-UTF8-sequence.
        let _ = msg.content_prefix_50();
    }

    #[test]
    fn tool_roles_are_flagged() {
        assert!(Role::ToolUse.is_tool());
        assert!(Role::ToolResult.is_tool());
        assert!(!Role::User.is_tool());
        assert!(!Role::Assistant.is_tool());
        assert!(!Role::System.is_tool());
    }
}
