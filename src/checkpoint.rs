//! Checkpoint generator (spec §4.4).
//!
//! A checkpoint is a best-effort summary snapshot used by the compaction
//! manager's fast path; generation never blocks a caller and never fails
//! loudly — on any LLM trouble it just logs and leaves the session
//! unchanged.

use crate::config::CheckpointConfig;
use crate::records::{Checkpoint, Message};
use crate::session::manager::SessionManager;
use crate::summarizer::Summarizer;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const GENERATED_BY: &str = "clawcore";

pub struct CheckpointGenerator {
    config: CheckpointConfig,
    sessions: Arc<SessionManager>,
    summarizer: Arc<dyn Summarizer>,
}

impl CheckpointGenerator {
    pub fn new(config: CheckpointConfig, sessions: Arc<SessionManager>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            config,
            sessions,
            summarizer,
        }
    }

    /// Policy check (spec §4.4): usage-threshold trigger OR turn-count
    /// trigger, whichever fires first.
    pub fn should_checkpoint(
        &self,
        total_tokens: u32,
        max_tokens: u32,
        user_turns_since_last_checkpoint: u32,
        last_checkpoint_tokens: Option<u32>,
    ) -> bool {
        let threshold_tokens = max_tokens * self.config.threshold_percent / 100;
        let usage_trigger = total_tokens >= threshold_tokens
            && last_checkpoint_tokens.map(|t| t < threshold_tokens).unwrap_or(true);

        let turn_trigger = user_turns_since_last_checkpoint >= self.config.turn_threshold
            && total_tokens >= self.config.min_tokens_for_gen;

        usage_trigger || turn_trigger
    }

    /// Spawns the background generation task (spec §4.4 "runs on a
    /// background task ... 10-minute timeout"). Best-effort: failures are
    /// logged, not propagated.
    pub fn spawn_generate(&self, session_key: String, messages: Vec<Message>, message_count: usize, tokens: u32) {
        let sessions = self.sessions.clone();
        let summarizer = self.summarizer.clone();
        let timeout = Duration::from_secs(self.config.timeout_secs);

        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, summarizer.summarize_checkpoint(&messages)).await;

            let summary = match result {
                Ok(Ok(summary)) => summary,
                Ok(Err(e)) => {
                    tracing::warn!("checkpoint generation failed for {session_key}: {e}");
                    return;
                }
                Err(_) => {
                    tracing::warn!("checkpoint generation timed out for {session_key}");
                    return;
                }
            };

            let checkpoint = Checkpoint {
                id: Uuid::new_v4().to_string(),
                parent_id: None,
                session_key: session_key.clone(),
                timestamp: Utc::now(),
                summary: summary.summary,
                topics: summary.topics,
                key_decisions: summary.key_decisions,
                open_questions: summary.open_questions,
                tokens_at_checkpoint: tokens,
                message_count_at_checkpoint: message_count,
                generated_by: GENERATED_BY.to_string(),
            };

            if let Err(e) = sessions.persist_checkpoint(&checkpoint).await {
                tracing::warn!("failed to persist checkpoint for {session_key}: {e}");
                return;
            }

            if let Some(shared) = sessions.get(&session_key).await {
                let mut live = shared.lock().await;
                live.last_checkpoint = Some(checkpoint);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_threshold_triggers_when_not_already_covered() {
        let config = CheckpointConfig {
            threshold_percent: 50,
            turn_threshold: 10,
            min_tokens_for_gen: 2_000,
            timeout_secs: 600,
        };
        let gen = PolicyOnly(config);
        assert!(gen.should_checkpoint(60_000, 100_000, 0, None));
        assert!(!gen.should_checkpoint(60_000, 100_000, 0, Some(55_000)));
    }

    #[test]
    fn turn_threshold_requires_minimum_tokens() {
        let config = CheckpointConfig {
            threshold_percent: 50,
            turn_threshold: 10,
            min_tokens_for_gen: 2_000,
            timeout_secs: 600,
        };
        let gen = PolicyOnly(config);
        assert!(!gen.should_checkpoint(1_000, 100_000, 12, None));
        assert!(gen.should_checkpoint(3_000, 100_000, 12, None));
    }

    /// Thin wrapper exposing only the pure policy method, avoiding the need
    /// to construct a full `CheckpointGenerator` (which needs a live
    /// `SessionManager` + `Summarizer`) just to unit-test arithmetic.
    struct PolicyOnly(CheckpointConfig);

    impl PolicyOnly {
        fn should_checkpoint(
            &self,
            total_tokens: u32,
            max_tokens: u32,
            user_turns_since_last_checkpoint: u32,
            last_checkpoint_tokens: Option<u32>,
        ) -> bool {
            let threshold_tokens = max_tokens * self.0.threshold_percent / 100;
            let usage_trigger = total_tokens >= threshold_tokens
                && last_checkpoint_tokens.map(|t| t < threshold_tokens).unwrap_or(true);
            let turn_trigger = user_turns_since_last_checkpoint >= self.0.turn_threshold
                && total_tokens >= self.0.min_tokens_for_gen;
            usage_trigger || turn_trigger
        }
    }
}
