//! In-memory session working copy, owned exclusively through [`manager::SessionManager`].

pub mod manager;

use crate::records::{Checkpoint, Message, Session};
use crate::tokenizer;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

pub use manager::SessionManager;

/// The live, mutable view of a session: ordered messages, running token
/// total, and flush/checkpoint bookkeeping. Always accessed behind the
/// per-session [`tokio::sync::Mutex`] held by [`manager::SessionManager`].
pub struct LiveSession {
    pub session: Session,
    pub messages: Vec<Message>,
    pub last_checkpoint: Option<Checkpoint>,
    pub last_record_id: Option<String>,
    /// Guards compaction mutual exclusion per-session (DESIGN.md Open
    /// Question 3: per-session, not process-wide).
    pub compaction_in_progress: Arc<std::sync::atomic::AtomicBool>,
}

impl LiveSession {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            messages: Vec::new(),
            last_checkpoint: None,
            last_record_id: None,
            compaction_in_progress: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn recompute_tokens(&mut self) {
        self.session.total_tokens = tokenizer::estimate_session_tokens(&self.messages);
    }

    pub fn push_message(&mut self, msg: Message) {
        self.last_record_id = Some(msg.id.clone());
        self.session.total_tokens += tokenizer::estimate_message_tokens(&msg);
        self.messages.push(msg);
    }

    pub fn usage_fraction(&self) -> f64 {
        if self.session.max_tokens == 0 {
            return 0.0;
        }
        self.session.total_tokens as f64 / self.session.max_tokens as f64
    }

    pub fn reset_flush_cycle(&mut self) {
        self.session.flushed_thresholds = BTreeSet::new();
    }
}

pub type SharedSession = Arc<Mutex<LiveSession>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Role;

    #[test]
    fn push_message_advances_last_record_id_and_tokens() {
        let mut live = LiveSession::new(Session::primary("gpt-5", 200_000));
        assert_eq!(live.last_record_id, None);
        live.push_message(Message::new("primary", Role::User, "hello"));
        assert!(live.last_record_id.is_some());
        assert!(live.session.total_tokens > 0);
    }

    #[test]
    fn usage_fraction_is_zero_for_empty_session() {
        let live = LiveSession::new(Session::primary("gpt-5", 200_000));
        assert_eq!(live.usage_fraction(), 0.0);
    }
}
