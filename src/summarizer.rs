//! Summarization LLM abstraction.
//!
//! The core never calls a provider's HTTP API directly — it calls whatever
//! `Arc<dyn Summarizer>` the caller supplies, mirroring the teacher's
//! `Arc<dyn Provider>` boundary (`brain/provider/mod.rs`). Checkpoint
//! generation and compaction's async summary phase both go through this
//! trait.

use crate::records::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error("llm unavailable: {0}")]
    Unavailable(String),

    #[error("context overflow: input too large even after reduction")]
    ContextOverflow,

    #[error("rate limited")]
    RateLimit,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub summary: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(rename = "keyDecisions", default)]
    pub key_decisions: Vec<String>,
    #[serde(rename = "openQuestions", default)]
    pub open_questions: Vec<String>,
}

/// LLM-backed summarization, used by both the checkpoint generator and the
/// compaction manager's async phase.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize_checkpoint(&self, messages: &[Message]) -> Result<CheckpointSummary, SummarizerError>;

    async fn summarize_compaction(&self, messages: &[Message]) -> Result<String, SummarizerError>;
}

/// Tolerant JSON parse for a checkpoint response: a provider that doesn't
/// obey the `{summary, topics, keyDecisions, openQuestions}` contract still
/// yields something useful rather than a hard failure (spec §4.4).
pub fn parse_checkpoint_response(raw: &str) -> CheckpointSummary {
    if let Ok(parsed) = serde_json::from_str::<CheckpointSummary>(raw) {
        return parsed;
    }
    if let Some(extracted) = extract_balanced_braces(raw)
        && let Ok(parsed) = serde_json::from_str::<CheckpointSummary>(&extracted)
    {
        return parsed;
    }
    CheckpointSummary {
        summary: raw.to_string(),
        ..Default::default()
    }
}

fn extract_balanced_braces(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let mut depth = 0i32;
    for (i, ch) in raw[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(raw[start..start + i + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Deterministic stand-in for tests and offline development, the same role
/// the teacher's `PlaceholderProvider` plays for `Provider`.
pub struct PlaceholderSummarizer;

#[async_trait]
impl Summarizer for PlaceholderSummarizer {
    async fn summarize_checkpoint(&self, messages: &[Message]) -> Result<CheckpointSummary, SummarizerError> {
        Ok(CheckpointSummary {
            summary: format!("Checkpoint over {} messages.", messages.len()),
            topics: Vec::new(),
            key_decisions: Vec::new(),
            open_questions: Vec::new(),
        })
    }

    async fn summarize_compaction(&self, messages: &[Message]) -> Result<String, SummarizerError> {
        Ok(format!("Compacted {} messages.", messages.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_json_parses_directly() {
        let raw = r#"{"summary":"did X","topics":["a"],"keyDecisions":[],"openQuestions":["why?"]}"#;
        let parsed = parse_checkpoint_response(raw);
        assert_eq!(parsed.summary, "did X");
        assert_eq!(parsed.topics, vec!["a".to_string()]);
        assert_eq!(parsed.open_questions, vec!["why?".to_string()]);
    }

    #[test]
    fn prose_wrapped_json_extracts_balanced_braces() {
        let raw = "Sure, here's the summary:\n{\"summary\":\"did Y\",\"topics\":[]}\nLet me know if you need more.";
        let parsed = parse_checkpoint_response(raw);
        assert_eq!(parsed.summary, "did Y");
    }

    #[test]
    fn unparseable_text_falls_back_to_raw_summary() {
        let raw = "I couldn't produce structured output, sorry.";
        let parsed = parse_checkpoint_response(raw);
        assert_eq!(parsed.summary, raw);
        assert!(parsed.topics.is_empty());
    }

    #[tokio::test]
    async fn placeholder_summarizer_is_deterministic() {
        let summarizer = PlaceholderSummarizer;
        let messages = vec![Message::new("primary", crate::records::Role::User, "hi")];
        let summary = summarizer.summarize_compaction(&messages).await.unwrap();
        assert_eq!(summary, "Compacted 1 messages.");
    }
}
