//! Process-wide session manager (spec §4.2).
//!
//! Owns the [`crate::store::SessionStore`] and the in-memory map of live
//! sessions. Every mutation goes through here so the store and the
//! in-memory view never drift apart.

use super::{LiveSession, SharedSession};
use crate::records::{Checkpoint, Compaction, Message, Role, Session, PRIMARY_SESSION_KEY};
use crate::store::{GetMessagesOpts, SessionStore, StoreError};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Foreign log lines are never read past this many bytes at once (spec
/// §4.2 "Lines up to 10 MiB must be accepted").
const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    sessions: Mutex<HashMap<String, SharedSession>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, session_key: &str) -> Option<SharedSession> {
        self.sessions.lock().await.get(session_key).cloned()
    }

    /// Reads the latest compaction for `"primary"`, reconstructs the live
    /// message window from `first_kept_entry_id` onward, prepends a
    /// synthetic summary message, and recomputes the token total.
    pub async fn load_primary(&self) -> Result<SharedSession, StoreError> {
        let session = match self.store.get_session(PRIMARY_SESSION_KEY).await? {
            Some(s) => s,
            None => {
                let fresh = Session::primary("gpt-5", 200_000);
                self.store.create_session(&fresh).await?;
                fresh
            }
        };

        let mut live = LiveSession::new(session);

        let latest_compaction = self.store.get_latest_compaction(PRIMARY_SESSION_KEY).await?;
        let mut opts = GetMessagesOpts::default();
        if let Some(compaction) = &latest_compaction {
            opts = opts.after_id(compaction.first_kept_entry_id.clone());
        }
        let mut messages = self.store.get_messages(PRIMARY_SESSION_KEY, opts).await?;

        if let Some(compaction) = &latest_compaction {
            let mut summary_msg = Message::new(PRIMARY_SESSION_KEY, Role::User, compaction.summary.clone());
            summary_msg.source = Some("compaction-summary".to_string());
            messages.insert(0, summary_msg);
        }

        live.last_checkpoint = self.store.get_latest_checkpoint(PRIMARY_SESSION_KEY).await?;
        live.last_record_id = messages.last().map(|m| m.id.clone());
        live.messages = messages;
        live.recompute_tokens();

        let shared = Arc::new(Mutex::new(live));
        self.sessions
            .lock()
            .await
            .insert(PRIMARY_SESSION_KEY.to_string(), shared.clone());
        Ok(shared)
    }

    /// Imports a foreign writer's append-only log into the primary session:
    /// dedups by `(timestamp, role, content_prefix)` against what we already
    /// have, tags imported messages with their origin, and records how far
    /// we've read so re-running this never double-imports (spec §9, §4.2,
    /// and the `transcript_indexed_at` Open Question 2 resolution).
    pub async fn inherit_foreign(
        &self,
        foreign_dir: &Path,
        foreign_key: &str,
    ) -> Result<usize, StoreError> {
        let path = foreign_dir.join(format!("{foreign_key}.jsonl"));
        if !path.exists() {
            return Ok(0);
        }

        let contents = tokio::fs::read_to_string(&path).await?;
        let existing = self
            .store
            .get_messages(PRIMARY_SESSION_KEY, GetMessagesOpts::default())
            .await?;
        let seen: std::collections::HashSet<(i64, Role, String)> = existing
            .iter()
            .map(|m| (m.timestamp.timestamp(), m.role, m.content_prefix_50().to_string()))
            .collect();

        // A record at or before transcript_indexed_at was already seen and
        // possibly locally deleted since; never resurrect it (DESIGN.md Open
        // Question 2).
        let already_indexed = self
            .store
            .get_session(PRIMARY_SESSION_KEY)
            .await?
            .and_then(|s| s.transcript_indexed_at);

        let mut imported = 0usize;
        let mut latest_ts = None;
        for line in contents.lines() {
            if line.len() > MAX_LINE_BYTES || line.trim().is_empty() {
                continue;
            }
            let Ok(mut msg) = serde_json::from_str::<Message>(line) else {
                continue;
            };
            if let Some(indexed_at) = already_indexed
                && msg.timestamp <= indexed_at
            {
                continue;
            }
            let key = (msg.timestamp.timestamp(), msg.role, msg.content_prefix_50().to_string());
            if seen.contains(&key) {
                continue;
            }
            msg.id = format!("oc-{}", msg.id);
            msg.session_key = PRIMARY_SESSION_KEY.to_string();
            msg.source = Some(foreign_key.to_string());
            latest_ts = Some(msg.timestamp.max(latest_ts.unwrap_or(msg.timestamp)));
            self.store.append_message(&msg).await?;
            imported += 1;
        }

        if let Some(ts) = latest_ts
            && let Some(mut session) = self.store.get_session(PRIMARY_SESSION_KEY).await?
        {
            session.transcript_indexed_at = Some(ts);
            self.store.update_session(&session).await?;
        }

        Ok(imported)
    }

    /// Watches `file` for appends via `notify`, importing qualifying
    /// messages and invoking `callback` for each newly observed line.
    /// Truncation (file shrinking) resets the byte offset to zero.
    pub async fn start_watching<F>(
        self: Arc<Self>,
        file: PathBuf,
        mut callback: F,
    ) -> notify::Result<()>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Event>(64);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    let _ = tx.blocking_send(event);
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(&file, RecursiveMode::NonRecursive)?;

        let manager = self.clone();
        tokio::spawn(async move {
            // Keeps the watcher alive for the task's lifetime.
            let _watcher = watcher;
            let mut offset: u64 = 0;
            loop {
                let Some(event) = rx.recv().await else { break };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }

                let Ok(metadata) = tokio::fs::metadata(&file).await else {
                    continue;
                };
                if metadata.len() < offset {
                    offset = 0;
                }

                let Ok(contents) = tokio::fs::read_to_string(&file).await else {
                    continue;
                };
                let start = offset.min(contents.len() as u64) as usize;
                let new_bytes = &contents[start..];
                offset = contents.len() as u64;

                for line in new_bytes.lines() {
                    if line.len() > MAX_LINE_BYTES || line.trim().is_empty() {
                        continue;
                    }
                    if let Ok(msg) = serde_json::from_str::<Message>(line) {
                        let _ = manager.store.append_message(&msg).await;
                        callback(msg);
                    }
                }
            }
        });

        Ok(())
    }

    pub async fn persist_message(&self, msg: &Message) -> Result<(), StoreError> {
        if self.store.get_session(&msg.session_key).await?.is_none() {
            self.store
                .create_session(&Session::new(msg.session_key.clone(), "unknown", 200_000))
                .await?;
        }
        self.store.append_message(msg).await
    }

    pub async fn persist_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        if self.store.get_session(&checkpoint.session_key).await?.is_none() {
            self.store
                .create_session(&Session::new(checkpoint.session_key.clone(), "unknown", 200_000))
                .await?;
        }
        self.store.append_checkpoint(checkpoint).await
    }

    pub async fn persist_compaction(&self, compaction: &Compaction) -> Result<(), StoreError> {
        if self.store.get_session(&compaction.session_key).await?.is_none() {
            self.store
                .create_session(&Session::new(compaction.session_key.clone(), "unknown", 200_000))
                .await?;
        }
        self.store.append_compaction(compaction).await
    }

    pub async fn clean_orphaned_tool_messages(&self, session_key: &str) -> Result<u64, StoreError> {
        let deleted = self.store.delete_orphaned_tool_messages(session_key).await?;
        if let Some(shared) = self.get(session_key).await {
            let mut live = shared.lock().await;
            live.messages.retain(|m| !m.role.is_tool());
            live.recompute_tokens();
        }
        Ok(deleted)
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    async fn manager() -> (SessionManager, tempfile::TempDir) {
        let (store, dir) = SqliteStore::open_temp().await;
        (SessionManager::new(Arc::new(store)), dir)
    }

    #[tokio::test]
    async fn load_primary_creates_session_when_missing() {
        let (manager, _dir) = manager().await;
        let shared = manager.load_primary().await.unwrap();
        let live = shared.lock().await;
        assert_eq!(live.session.session_key, PRIMARY_SESSION_KEY);
        assert!(live.messages.is_empty());
    }

    #[tokio::test]
    async fn load_primary_prepends_compaction_summary() {
        let (manager, _dir) = manager().await;
        manager
            .store
            .create_session(&Session::primary("gpt-5", 200_000))
            .await
            .unwrap();

        let kept = Message::new(PRIMARY_SESSION_KEY, Role::User, "kept message");
        manager.store.append_message(&kept).await.unwrap();

        let compaction = Compaction {
            id: "c1".into(),
            parent_id: None,
            session_key: PRIMARY_SESSION_KEY.into(),
            timestamp: chrono::Utc::now(),
            summary: "earlier conversation summarized here".into(),
            first_kept_entry_id: kept.id.clone(),
            tokens_before: 1000,
            tokens_after: Some(200),
            needs_summary_retry: false,
        };
        manager.store.append_compaction(&compaction).await.unwrap();

        let shared = manager.load_primary().await.unwrap();
        let live = shared.lock().await;
        assert_eq!(live.messages.len(), 1);
        assert_eq!(live.messages[0].content, "earlier conversation summarized here");
    }

    #[tokio::test]
    async fn clean_orphaned_tool_messages_clears_in_memory_state_too() {
        let (manager, _dir) = manager().await;
        let shared = manager.load_primary().await.unwrap();
        {
            let mut live = shared.lock().await;
            live.push_message(Message::tool_use(PRIMARY_SESSION_KEY, "t1", "search", serde_json::json!({})));
        }
        manager
            .store
            .append_message(&Message::tool_use(PRIMARY_SESSION_KEY, "t1", "search", serde_json::json!({})))
            .await
            .unwrap();

        manager.clean_orphaned_tool_messages(PRIMARY_SESSION_KEY).await.unwrap();
        let live = shared.lock().await;
        assert!(live.messages.iter().all(|m| !m.role.is_tool()));
    }
}
