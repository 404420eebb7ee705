//! Process-wide token estimator.
//!
//! Mirrors the teacher's `trim_messages_to_budget`/`tokenizer::count_tokens`
//! pattern (`brain/agent/service/context.rs`) with cl100k-style BPE via
//! `tiktoken-rs`, generalized into a reusable estimator with a byte-length
//! fallback when the BPE tables can't be loaded.

use crate::records::Message;
use once_cell::sync::OnceCell;
use tiktoken_rs::CoreBPE;

/// Per-message overhead tokens, beyond the raw content — mirrors providers'
/// per-message wrapping (role marker, separators).
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

static BPE: OnceCell<Option<CoreBPE>> = OnceCell::new();

fn bpe() -> &'static Option<CoreBPE> {
    BPE.get_or_init(|| match tiktoken_rs::cl100k_base() {
        Ok(bpe) => Some(bpe),
        Err(e) => {
            tracing::warn!("Failed to load cl100k BPE tables, falling back to bytes/4: {e}");
            None
        }
    })
}

/// Estimate the token count of a single string.
///
/// Falls back to `len(text) / 4` if the BPE tables are unavailable — this
/// never panics, by design: token estimation is advisory, not load-bearing.
pub fn estimate_tokens(text: &str) -> u32 {
    match bpe() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
        None => (text.len() as u32).div_ceil(4),
    }
}

/// Estimate the token count of a message, including role/tool-name/
/// tool-input overhead (spec §4.3).
pub fn estimate_message_tokens(msg: &Message) -> u32 {
    let mut total = MESSAGE_OVERHEAD_TOKENS + estimate_tokens(&msg.content);

    if let Some(name) = &msg.tool_name {
        total += estimate_tokens(name);
    }
    if let Some(input) = &msg.tool_input {
        total += estimate_tokens(&input.to_string());
    }
    if let Some(thinking) = &msg.thinking {
        total += estimate_tokens(thinking);
    }

    total
}

/// Sum `estimate_message_tokens` across an entire session's live messages.
pub fn estimate_session_tokens<'a>(messages: impl IntoIterator<Item = &'a Message>) -> u32 {
    messages.into_iter().map(estimate_message_tokens).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Role;

    #[test]
    fn empty_text_is_cheap() {
        assert!(estimate_tokens("") <= MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn longer_text_costs_more_tokens() {
        let short = estimate_tokens("hello");
        let long = estimate_tokens(&"hello world, this is a much longer string".repeat(10));
        assert!(long > short);
    }

    #[test]
    fn message_tokens_include_tool_overhead() {
        let plain = Message::new("primary", Role::User, "hello there");
        let tool = Message::tool_use(
            "primary",
            "call-1",
            "search",
            serde_json::json!({"query": "rust async traits"}),
        );
        assert!(estimate_message_tokens(&tool) > estimate_message_tokens(&plain));
    }

    #[test]
    fn session_sum_matches_manual_sum() {
        let messages = vec![
            Message::new("primary", Role::User, "first"),
            Message::new("primary", Role::Assistant, "second, a bit longer than first"),
        ];
        let summed: u32 = messages.iter().map(estimate_message_tokens).sum();
        assert_eq!(estimate_session_tokens(&messages), summed);
    }
}
