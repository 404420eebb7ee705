//! Persistent backend over the record model (spec §4.1).
//!
//! [`SessionStore`] is the trait every backend implements. [`SqliteStore`] is
//! the primary implementation (a local SQLite database in WAL mode, pooled
//! via `deadpool-sqlite`). [`JsonlStore`] is the interop compatibility shim —
//! read support is mandatory, write support is best-effort, and several
//! optional operations return [`StoreError::Unsupported`].

mod jsonl;
mod migrations;
mod sqlite;

pub use jsonl::JsonlStore;
pub use sqlite::SqliteStore;

use crate::error::ErrorKind;
use crate::records::{Checkpoint, Compaction, Message, Role, Session};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as Json;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("store busy: {0}")]
    Busy(String),

    #[error("unsupported by this store backend: {0}")]
    Unsupported(&'static str),

    #[error("schema migration failed: {0}")]
    MigrationFailed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound => ErrorKind::NotFound,
            StoreError::Busy(_) => ErrorKind::StoreBusy,
            StoreError::MigrationFailed(_) => ErrorKind::SchemaMigrationFailed,
            _ => ErrorKind::Other,
        }
    }
}

/// Options for [`SessionStore::get_messages`].
#[derive(Debug, Clone, Default)]
pub struct GetMessagesOpts {
    pub after_id: Option<String>,
    pub after_time: Option<DateTime<Utc>>,
    pub roles_only: Option<Vec<Role>>,
    pub limit: Option<usize>,
    /// Include provider-raw fields (thinking, supervision) that some callers
    /// strip before showing messages to a human.
    pub include_raw: bool,
}

impl GetMessagesOpts {
    pub fn after_id(mut self, id: impl Into<String>) -> Self {
        self.after_id = Some(id.into());
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

/// Persistent backend over the record model.
///
/// `append_message` must be safe to call from any number of concurrent
/// writers, with visibility to subsequent `get_messages` calls in the same
/// process (spec §4.1 Guarantees).
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, session_key: &str) -> Result<Option<Session>, StoreError>;
    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn update_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;

    async fn append_message(&self, msg: &Message) -> Result<(), StoreError>;
    async fn get_messages(
        &self,
        session_key: &str,
        opts: GetMessagesOpts,
    ) -> Result<Vec<Message>, StoreError>;

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;
    async fn get_latest_checkpoint(
        &self,
        session_key: &str,
    ) -> Result<Option<Checkpoint>, StoreError>;
    async fn get_checkpoints(&self, session_key: &str) -> Result<Vec<Checkpoint>, StoreError>;

    async fn append_compaction(&self, compaction: &Compaction) -> Result<(), StoreError>;
    async fn get_compactions(&self, session_key: &str) -> Result<Vec<Compaction>, StoreError>;
    async fn get_latest_compaction(
        &self,
        session_key: &str,
    ) -> Result<Option<Compaction>, StoreError>;

    /// Oldest compaction (across all sessions) with `needs_summary_retry = true`.
    async fn get_pending_summary_retry(&self) -> Result<Option<Compaction>, StoreError>;

    /// Sets `summary` and atomically clears `needs_summary_retry`.
    async fn update_compaction_summary(&self, id: &str, summary: &str) -> Result<(), StoreError>;

    /// Exclusive bounds: `(start_after_id, end_before_id)`.
    async fn get_messages_in_range(
        &self,
        session_key: &str,
        start_after_id: Option<&str>,
        end_before_id: &str,
    ) -> Result<Vec<Message>, StoreError>;

    async fn get_previous_compaction(
        &self,
        session_key: &str,
        before_timestamp: DateTime<Utc>,
    ) -> Result<Option<Compaction>, StoreError>;

    /// Nuclear: remove all tool_use/tool_result messages in a session, used
    /// to recover from wire-format corruption.
    async fn delete_orphaned_tool_messages(&self, session_key: &str) -> Result<u64, StoreError>;

    async fn get_provider_state(
        &self,
        session_key: &str,
        provider: &str,
    ) -> Result<Option<Json>, StoreError>;
    async fn set_provider_state(
        &self,
        session_key: &str,
        provider: &str,
        state: Json,
    ) -> Result<(), StoreError>;
    async fn delete_provider_states(&self, session_key: &str) -> Result<(), StoreError>;

    /// Idempotent, version-numbered schema migration.
    async fn migrate(&self) -> Result<(), StoreError>;
}
