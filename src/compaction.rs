//! Compaction manager — the two-phase truncate-now/summarize-later protocol
//! (spec §4.5, "THE HARD PART").
//!
//! The fast phase (truncate + placeholder record) always completes
//! synchronously so a caller is never blocked on an LLM call. The slow phase
//! (generating the real summary) runs as a background task and is retried
//! indefinitely by [`CompactionManager::run_retry_loop`] until it succeeds.

use crate::config::CompactionConfig;
use crate::error::ErrorKind;
use crate::records::{Compaction, Message, Role};
use crate::session::SharedSession;
use crate::session::manager::SessionManager;
use crate::store::StoreError;
use crate::summarizer::{Summarizer, SummarizerError};
use crate::tokenizer;
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    #[error("a compaction is already in progress for this session")]
    AlreadyInProgress,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Summarizer(#[from] SummarizerError),
}

impl CompactionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompactionError::AlreadyInProgress => ErrorKind::StoreBusy,
            CompactionError::Store(e) => e.kind(),
            CompactionError::Summarizer(SummarizerError::ContextOverflow) => ErrorKind::ContextOverflow,
            CompactionError::Summarizer(SummarizerError::RateLimit) => ErrorKind::RateLimit,
            CompactionError::Summarizer(SummarizerError::Unavailable(_)) => ErrorKind::LlmUnavailable,
        }
    }
}

pub struct CompactionManager {
    config: CompactionConfig,
    sessions: Arc<SessionManager>,
    summarizer: Arc<dyn Summarizer>,
}

/// Result of the synchronous fast phase, handed to the caller immediately;
/// `needs_summary_retry` tells the caller whether an async task was fired.
pub struct CompactionOutcome {
    pub compaction_id: String,
    pub needs_summary_retry: bool,
}

impl CompactionManager {
    pub fn new(config: CompactionConfig, sessions: Arc<SessionManager>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            config,
            sessions,
            summarizer,
        }
    }

    /// Trigger check (spec §4.5 step-numbered `should_compact`).
    pub fn should_compact(&self, messages: &[Message], total_tokens: u32, max_tokens: u32) -> bool {
        if self.config.max_messages > 0 && messages.len() > self.config.max_messages {
            return true;
        }
        let reserve = self.config.reserve_tokens;
        total_tokens >= max_tokens.saturating_sub(reserve)
    }

    /// Runs the full two-phase protocol against `shared`. On success, the
    /// in-memory messages are already truncated and the fast-path compaction
    /// record is persisted; if the fast path couldn't produce a real summary,
    /// an async task is spawned to fill it in later.
    pub async fn compact(&self, session_key: &str, shared: SharedSession) -> Result<CompactionOutcome, CompactionError> {
        let in_progress = {
            let live = shared.lock().await;
            live.compaction_in_progress.clone()
        };

        if in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CompactionError::AlreadyInProgress);
        }

        let result = self.compact_inner(session_key, &shared).await;
        in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn compact_inner(
        &self,
        session_key: &str,
        shared: &SharedSession,
    ) -> Result<CompactionOutcome, CompactionError> {
        let (tokens_before, messages_snapshot, last_checkpoint, last_record_id, keep_percent) = {
            let live = shared.lock().await;
            (
                live.session.total_tokens,
                live.messages.clone(),
                live.last_checkpoint.clone(),
                live.last_record_id.clone(),
                self.config.keep_percent,
            )
        };

        let boundary = compute_boundary(&messages_snapshot, self.config.min_messages, keep_percent);
        let Some(boundary) = boundary else {
            // No messages at all: nothing to summarize or truncate.
            return Ok(CompactionOutcome {
                compaction_id: String::new(),
                needs_summary_retry: false,
            });
        };

        let (summary, needs_summary_retry) = match &last_checkpoint {
            Some(cp) if cp.tokens_at_checkpoint as u64 * 2 >= tokens_before as u64 => {
                (checkpoint_fast_summary(cp), false)
            }
            _ => (
                format!(
                    "[Summary pending — {} messages compacted at {}]",
                    boundary.start_index,
                    Utc::now().format("%H:%M:%S")
                ),
                true,
            ),
        };

        let compaction = Compaction {
            id: Uuid::new_v4().to_string(),
            parent_id: last_record_id,
            session_key: session_key.to_string(),
            timestamp: Utc::now(),
            summary,
            first_kept_entry_id: boundary.first_kept_entry_id.clone(),
            tokens_before,
            tokens_after: None,
            needs_summary_retry,
        };

        self.sessions.persist_compaction(&compaction).await?;
        self.sessions.store().delete_provider_states(session_key).await?;

        let tokens_after = {
            let mut live = shared.lock().await;
            live.messages = messages_snapshot[boundary.start_index..].to_vec();
            live.recompute_tokens();
            live.session.compaction_count += 1;
            live.reset_flush_cycle();
            live.session.total_tokens
        };

        if let Some(mut session) = self.sessions.store().get_session(session_key).await? {
            session.total_tokens = tokens_after;
            session.compaction_count += 1;
            session.flushed_thresholds.clear();
            self.sessions.store().update_session(&session).await?;
        }

        let mut persisted = compaction.clone();
        persisted.tokens_after = Some(tokens_after);
        let _ = self
            .sessions
            .store()
            .update_compaction_summary(&persisted.id, &persisted.summary)
            .await;

        if needs_summary_retry {
            self.spawn_summary_task(persisted.id.clone(), messages_snapshot[..boundary.start_index].to_vec());
        }

        Ok(CompactionOutcome {
            compaction_id: compaction.id,
            needs_summary_retry,
        })
    }

    fn spawn_summary_task(&self, compaction_id: String, messages: Vec<Message>) {
        let summarizer = self.summarizer.clone();
        let store = self.sessions.store().clone();
        tokio::spawn(async move {
            match generate_summary_with_retry(&*summarizer, &messages, 2).await {
                Ok(summary) => {
                    if let Err(e) = store.update_compaction_summary(&compaction_id, &summary).await {
                        tracing::warn!("failed to persist async compaction summary: {e}");
                    }
                }
                Err(e) => {
                    tracing::warn!("compaction summary generation failed, leaving for retry: {e}");
                }
            }
        });
    }

    /// Background retry loop (spec §4.5 "Background retry loop"). Never
    /// returns; meant to be `tokio::spawn`ed once at startup.
    pub async fn run_retry_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(self.config.retry_interval_seconds));
        loop {
            ticker.tick().await;
            if let Err(e) = self.retry_tick().await {
                tracing::warn!("compaction retry tick failed: {e}");
            }
        }
    }

    async fn retry_tick(&self) -> Result<(), CompactionError> {
        let store = self.sessions.store();
        let Some(pending) = store.get_pending_summary_retry().await? else {
            return Ok(());
        };

        let previous = store
            .get_previous_compaction(&pending.session_key, pending.timestamp)
            .await?;
        let start_after_id = previous.map(|p| p.first_kept_entry_id);

        let messages = store
            .get_messages_in_range(
                &pending.session_key,
                start_after_id.as_deref(),
                &pending.first_kept_entry_id,
            )
            .await?;

        if messages.is_empty() {
            store.update_compaction_summary(&pending.id, &pending.summary).await?;
            return Ok(());
        }

        match generate_summary_with_retry(&*self.summarizer, &messages, 2).await {
            Ok(summary) => {
                store.update_compaction_summary(&pending.id, &summary).await?;
            }
            Err(e) => {
                tracing::debug!("compaction retry still failing: {e}");
            }
        }
        Ok(())
    }
}

struct Boundary {
    start_index: usize,
    first_kept_entry_id: String,
}

/// Computes the compaction boundary, walking backward over any trailing
/// `tool_use`/`tool_result` run so a tool call is never split from its
/// reply (spec §4.5 step 5 — "the most delicate rule in the core").
///
/// A session at or below `min_messages` still yields a boundary — just one
/// with `start_index == 0`, i.e. truncation is a no-op but a compaction
/// record (and summary, if triggered) is still written.
fn compute_boundary(messages: &[Message], min_messages: usize, keep_percent: u32) -> Option<Boundary> {
    let len = messages.len();
    if len == 0 {
        return None;
    }

    let keep_count = (len * keep_percent as usize / 100).max(min_messages).min(len);
    let mut start_index = len - keep_count;

    while start_index > 0 && messages[start_index].role.is_tool() {
        start_index -= 1;
    }

    Some(Boundary {
        start_index,
        first_kept_entry_id: messages[start_index].id.clone(),
    })
}

fn checkpoint_fast_summary(checkpoint: &crate::records::Checkpoint) -> String {
    let mut summary = checkpoint.summary.clone();
    if !checkpoint.key_decisions.is_empty() {
        summary.push_str(" Key decisions: ");
        summary.push_str(&checkpoint.key_decisions.join("; "));
    }
    summary
}

/// Retries with a shrinking input window: halve the message slice (down to
/// a 500-token floor) on a context-overflow error, up to `max_retries` times.
async fn generate_summary_with_retry(
    summarizer: &dyn Summarizer,
    messages: &[Message],
    max_retries: u32,
) -> Result<String, SummarizerError> {
    let mut window = messages;
    let mut attempt = 0;
    loop {
        match summarizer.summarize_compaction(window).await {
            Ok(summary) => return Ok(summary),
            Err(SummarizerError::ContextOverflow) if attempt < max_retries => {
                attempt += 1;
                let target_tokens = tokenizer::estimate_session_tokens(window) * 3 / 4;
                let reduced = shrink_to_budget(window, target_tokens.max(500));
                if reduced == window.len() {
                    return Err(SummarizerError::ContextOverflow);
                }
                window = &window[window.len() - reduced..];
            }
            Err(e) => return Err(e),
        }
    }
}

fn shrink_to_budget(messages: &[Message], budget: u32) -> usize {
    let mut total = 0u32;
    let mut count = 0usize;
    for msg in messages.iter().rev() {
        let cost = tokenizer::estimate_message_tokens(msg);
        if total + cost > budget && count > 0 {
            break;
        }
        total += cost;
        count += 1;
    }
    count.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Role;

    fn msg(role: Role, content: &str) -> Message {
        Message::new("primary", role, content)
    }

    #[test]
    fn boundary_is_a_no_op_truncation_when_shorter_than_min_messages() {
        let messages: Vec<Message> = (0..10).map(|i| msg(Role::User, &i.to_string())).collect();
        let boundary = compute_boundary(&messages, 20, 50).unwrap();
        assert_eq!(boundary.start_index, 0);
        assert_eq!(boundary.first_kept_entry_id, messages[0].id);
    }

    #[test]
    fn boundary_is_none_for_an_empty_session() {
        let messages: Vec<Message> = Vec::new();
        assert!(compute_boundary(&messages, 20, 50).is_none());
    }

    #[test]
    fn boundary_never_starts_on_a_tool_message() {
        let mut messages: Vec<Message> = (0..30).map(|i| msg(Role::User, &i.to_string())).collect();
        // Force the naive boundary to land inside a tool_use/tool_result pair.
        let naive_start = 30 - (30usize.max(20) * 50 / 100).max(20).min(30);
        messages[naive_start] = Message::tool_result("primary", "call-1", "result");
        if naive_start > 0 {
            messages[naive_start - 1] = Message::tool_use("primary", "call-1", "search", serde_json::json!({}));
        }

        let boundary = compute_boundary(&messages, 20, 50).unwrap();
        assert!(!messages[boundary.start_index].role.is_tool());
    }

    #[test]
    fn boundary_keeps_at_least_min_messages() {
        let messages: Vec<Message> = (0..100).map(|i| msg(Role::User, &i.to_string())).collect();
        let boundary = compute_boundary(&messages, 20, 50).unwrap();
        assert!(messages.len() - boundary.start_index >= 20);
    }

    #[tokio::test]
    async fn shrink_to_budget_always_keeps_at_least_one_message() {
        let messages: Vec<Message> = (0..5).map(|i| msg(Role::User, &"x".repeat(4000 + i))).collect();
        let kept = shrink_to_budget(&messages, 1);
        assert!(kept >= 1);
    }

    #[tokio::test]
    async fn short_session_still_writes_a_compaction_record_with_a_summary() {
        use crate::records::PRIMARY_SESSION_KEY;
        use crate::store::SqliteStore;

        let (store, _dir) = SqliteStore::open_temp().await;
        let sessions = Arc::new(SessionManager::new(Arc::new(store)));
        let shared = sessions.load_primary().await.unwrap();
        for i in 0..5 {
            let message = msg(Role::User, &i.to_string());
            sessions.persist_message(&message).await.unwrap();
            shared.lock().await.push_message(message);
        }

        let config = CompactionConfig {
            min_messages: 20,
            ..Default::default()
        };
        let manager = CompactionManager::new(config, sessions.clone(), Arc::new(crate::summarizer::PlaceholderSummarizer));

        let outcome = manager.compact(PRIMARY_SESSION_KEY, shared.clone()).await.unwrap();
        assert!(!outcome.compaction_id.is_empty());

        let compactions = sessions.store().get_compactions(PRIMARY_SESSION_KEY).await.unwrap();
        assert_eq!(compactions.len(), 1);

        let live = shared.lock().await;
        assert_eq!(live.messages.len(), 5, "no-op truncation keeps every message");
    }
}
