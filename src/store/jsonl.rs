//! Append-only JSONL compatibility store (spec §4.1, §9 "External log
//! inheritance").
//!
//! One file per session, named `<session_key>.jsonl`; sessions are
//! discovered by scanning the directory for that extension
//! ([`JsonlStore::list_sessions`], [`discover_foreign_sessions`]) rather than
//! through a separate index file. Every line is a JSON object carrying a
//! `type` discriminator (`session | message | checkpoint | compaction`).
//! Read support is mandatory — this is how a foreign writer's transcript gets
//! inherited into the primary session. Write support is best-effort: callers
//! that need retry/range queries or provider-state should use
//! [`super::SqliteStore`] instead, which is why those operations return
//! [`StoreError::Unsupported`] here.

use super::{GetMessagesOpts, SessionStore, StoreError};
use crate::records::{Checkpoint, Compaction, Message, Role, Session};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LogLine {
    Session(Session),
    Message(Message),
    Checkpoint(Checkpoint),
    Compaction(Compaction),
    /// Foreign writers emit raw tool-result lines without the full envelope;
    /// normalized into a `tool_result` message on read.
    ToolResult {
        id: String,
        session_key: String,
        timestamp: DateTime<Utc>,
        tool_call_id: String,
        content: String,
    },
}

pub struct JsonlStore {
    dir: PathBuf,
    /// In-process cache, since a JSONL file has no query engine of its own.
    /// Guarded by a blocking mutex: rebuilt wholesale on every mutation,
    /// which is acceptable for a compatibility shim, not the primary store.
    cache: Mutex<HashMap<String, Vec<LogLine>>>,
}

impl JsonlStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn session_path(&self, session_key: &str) -> PathBuf {
        self.dir.join(format!("{session_key}.jsonl"))
    }

    async fn read_lines(&self, session_key: &str) -> Result<Vec<LogLine>, StoreError> {
        let path = self.session_path(session_key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut out = Vec::new();
        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogLine>(&line) {
                Ok(entry) => out.push(entry),
                Err(e) => {
                    tracing::warn!("skipping malformed jsonl line in {:?}: {e}", path);
                }
            }
        }
        Ok(out)
    }

    async fn append_line(&self, session_key: &str, line: &LogLine) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.session_path(session_key);
        let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
        let mut serialized = serde_json::to_string(line)?;
        serialized.push('\n');
        file.write_all(serialized.as_bytes()).await?;
        self.cache.lock().unwrap().remove(session_key);
        Ok(())
    }

    async fn lines_cached(&self, session_key: &str) -> Result<Vec<LogLine>, StoreError> {
        if let Some(cached) = self.cache.lock().unwrap().get(session_key) {
            return Ok(cached.clone());
        }
        let lines = self.read_lines(session_key).await?;
        self.cache
            .lock()
            .unwrap()
            .insert(session_key.to_string(), lines.clone());
        Ok(lines)
    }

    fn messages_of(lines: &[LogLine]) -> Vec<Message> {
        lines
            .iter()
            .filter_map(|l| match l {
                LogLine::Message(m) => Some(m.clone()),
                LogLine::ToolResult {
                    id,
                    session_key,
                    timestamp,
                    tool_call_id,
                    content,
                } => {
                    let mut m = Message::tool_result(session_key.clone(), tool_call_id.clone(), content.clone());
                    m.id = id.clone();
                    m.timestamp = *timestamp;
                    Some(m)
                }
                _ => None,
            })
            .collect()
    }
}

/// Scans an external transcript directory for session files not yet known
/// to this process, used by the session manager to inherit a foreign
/// writer's log (spec §9 "External log inheritance").
pub async fn discover_foreign_sessions(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            out.push(path);
        }
    }
    Ok(out)
}

#[async_trait]
impl SessionStore for JsonlStore {
    async fn get_session(&self, session_key: &str) -> Result<Option<Session>, StoreError> {
        let lines = self.lines_cached(session_key).await?;
        Ok(lines.into_iter().rev().find_map(|l| match l {
            LogLine::Session(s) => Some(s),
            _ => None,
        }))
    }

    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.append_line(&session.session_key, &LogLine::Session(session.clone()))
            .await
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        self.append_line(&session.session_key, &LogLine::Session(session.clone()))
            .await
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && let Some(session) = self.get_session(stem).await?
            {
                out.push(session);
            }
        }
        Ok(out)
    }

    async fn append_message(&self, msg: &Message) -> Result<(), StoreError> {
        self.append_line(&msg.session_key, &LogLine::Message(msg.clone())).await
    }

    async fn get_messages(
        &self,
        session_key: &str,
        opts: GetMessagesOpts,
    ) -> Result<Vec<Message>, StoreError> {
        let lines = self.lines_cached(session_key).await?;
        let mut messages = Self::messages_of(&lines);
        messages.sort_by_key(|m| m.timestamp);

        if let Some(after_id) = &opts.after_id
            && let Some(pos) = messages.iter().position(|m| &m.id == after_id)
        {
            messages = messages.split_off(pos + 1);
        } else if let Some(after_time) = opts.after_time {
            messages.retain(|m| m.timestamp > after_time);
        }

        if let Some(roles) = &opts.roles_only {
            messages.retain(|m| roles.contains(&m.role));
        }

        if let Some(limit) = opts.limit {
            messages.truncate(limit);
        }

        Ok(messages)
    }

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.append_line(&checkpoint.session_key, &LogLine::Checkpoint(checkpoint.clone()))
            .await
    }

    async fn get_latest_checkpoint(
        &self,
        session_key: &str,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let lines = self.lines_cached(session_key).await?;
        Ok(lines.into_iter().rev().find_map(|l| match l {
            LogLine::Checkpoint(c) => Some(c),
            _ => None,
        }))
    }

    async fn get_checkpoints(&self, session_key: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let lines = self.lines_cached(session_key).await?;
        let mut out: Vec<Checkpoint> = lines
            .into_iter()
            .filter_map(|l| match l {
                LogLine::Checkpoint(c) => Some(c),
                _ => None,
            })
            .collect();
        out.sort_by_key(|c| c.timestamp);
        Ok(out)
    }

    async fn append_compaction(&self, compaction: &Compaction) -> Result<(), StoreError> {
        self.append_line(&compaction.session_key, &LogLine::Compaction(compaction.clone()))
            .await
    }

    async fn get_compactions(&self, session_key: &str) -> Result<Vec<Compaction>, StoreError> {
        let lines = self.lines_cached(session_key).await?;
        let mut out: Vec<Compaction> = lines
            .into_iter()
            .filter_map(|l| match l {
                LogLine::Compaction(c) => Some(c),
                _ => None,
            })
            .collect();
        out.sort_by_key(|c| c.timestamp);
        Ok(out)
    }

    async fn get_latest_compaction(
        &self,
        session_key: &str,
    ) -> Result<Option<Compaction>, StoreError> {
        Ok(self.get_compactions(session_key).await?.pop())
    }

    async fn get_pending_summary_retry(&self) -> Result<Option<Compaction>, StoreError> {
        Err(StoreError::Unsupported(
            "cross-session retry scan requires the sqlite store",
        ))
    }

    async fn update_compaction_summary(&self, _id: &str, _summary: &str) -> Result<(), StoreError> {
        Err(StoreError::Unsupported(
            "in-place compaction update requires the sqlite store",
        ))
    }

    async fn get_messages_in_range(
        &self,
        session_key: &str,
        start_after_id: Option<&str>,
        end_before_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let messages = self
            .get_messages(session_key, GetMessagesOpts::default())
            .await?;
        let start = match start_after_id {
            Some(id) => messages.iter().position(|m| m.id == id).map(|p| p + 1).unwrap_or(0),
            None => 0,
        };
        let end = messages
            .iter()
            .position(|m| m.id == end_before_id)
            .unwrap_or(messages.len());
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(messages[start..end].to_vec())
    }

    async fn get_previous_compaction(
        &self,
        session_key: &str,
        before_timestamp: DateTime<Utc>,
    ) -> Result<Option<Compaction>, StoreError> {
        let compactions = self.get_compactions(session_key).await?;
        Ok(compactions
            .into_iter()
            .filter(|c| c.timestamp < before_timestamp)
            .next_back())
    }

    async fn delete_orphaned_tool_messages(&self, _session_key: &str) -> Result<u64, StoreError> {
        Err(StoreError::Unsupported(
            "destructive rewrite of an append-only log is not supported",
        ))
    }

    async fn get_provider_state(
        &self,
        _session_key: &str,
        _provider: &str,
    ) -> Result<Option<Json>, StoreError> {
        Err(StoreError::Unsupported(
            "provider state requires the sqlite store",
        ))
    }

    async fn set_provider_state(
        &self,
        _session_key: &str,
        _provider: &str,
        _state: Json,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unsupported(
            "provider state requires the sqlite store",
        ))
    }

    async fn delete_provider_states(&self, _session_key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unsupported(
            "provider state requires the sqlite store",
        ))
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Role;

    #[tokio::test]
    async fn append_and_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path());

        let session = Session::primary("gpt-5", 200_000);
        store.create_session(&session).await.unwrap();
        store
            .append_message(&Message::new("primary", Role::User, "hello"))
            .await
            .unwrap();
        store
            .append_message(&Message::new("primary", Role::Assistant, "hi there"))
            .await
            .unwrap();

        let messages = store
            .get_messages("primary", GetMessagesOpts::default())
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hello");
    }

    #[tokio::test]
    async fn foreign_tool_result_line_normalizes_into_a_message() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path());
        let line = LogLine::ToolResult {
            id: "abc".into(),
            session_key: "primary".into(),
            timestamp: Utc::now(),
            tool_call_id: "call-1".into(),
            content: "42".into(),
        };
        store.append_line("primary", &line).await.unwrap();

        let messages = store
            .get_messages("primary", GetMessagesOpts::default())
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::ToolResult);
        assert_eq!(messages[0].content, "42");
    }

    #[tokio::test]
    async fn pending_summary_retry_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path());
        assert!(matches!(
            store.get_pending_summary_retry().await,
            Err(StoreError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn malformed_line_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        let path = dir.path().join("primary.jsonl");
        tokio::fs::write(&path, b"not json\n{\"type\":\"message\",\"id\":\"x\"}\n")
            .await
            .unwrap();

        let store = JsonlStore::new(dir.path());
        let messages = store
            .get_messages("primary", GetMessagesOpts::default())
            .await
            .unwrap();
        assert!(messages.is_empty());
    }
}
