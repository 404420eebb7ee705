//! SQLite-backed [`SessionStore`] — the primary implementation.
//!
//! Uses `deadpool-sqlite` to pool connections (each borrowed connection runs
//! its work on a blocking thread via `.interact()`, following the teacher's
//! `deadpool-sqlite`/`rusqlite` dependency pairing). WAL mode is enabled on
//! every new connection so readers never block behind a writer, and the
//! busy-timeout is set from [`crate::config::StoreConfig`] (spec §4.1:
//! "busy-timeout ≥ 5s").

use super::{GetMessagesOpts, SessionStore, StoreError};
use crate::config::StoreConfig;
use crate::records::{Checkpoint, Compaction, Message, MediaKind, MediaRef, Role, Session, Supervision};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_sqlite::{Config as PoolConfig, Pool, Runtime};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value as Json;
use std::collections::BTreeSet;
use std::str::FromStr;
use uuid::Uuid;

pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let pool_config = PoolConfig::new(config.path.clone());
        let pool = pool_config
            .builder(Runtime::Tokio1)
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .max_size(config.pool_size)
            .build()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let busy_timeout_ms = config.busy_timeout_ms;
        let conn = pool.get().await.map_err(pool_err)?;
        conn.interact(move |conn| configure_connection(conn, busy_timeout_ms))
            .await
            .map_err(interact_err)??;

        Ok(Self { pool })
    }

    /// Open an in-memory-backed store for tests; each call gets a unique
    /// private temp file so pooled connections share the same database
    /// (SQLite `:memory:` databases are not shared across connections).
    #[cfg(test)]
    pub async fn open_temp() -> (Self, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            path: dir.path().join("test.db"),
            busy_timeout_ms: 5_000,
            pool_size: 4,
        };
        let store = Self::open(&config).await.unwrap();
        store.migrate().await.unwrap();
        (store, dir)
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.pool.get().await.map_err(pool_err)?;
        conn.interact(move |conn| f(conn)).await.map_err(interact_err)?
    }
}

fn configure_connection(conn: &Connection, busy_timeout_ms: u32) -> Result<(), StoreError> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(sqlite_err)?;
    conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms as u64))
        .map_err(sqlite_err)?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(sqlite_err)?;
    Ok(())
}

fn pool_err(e: deadpool_sqlite::PoolError) -> StoreError {
    StoreError::Busy(e.to_string())
}

fn interact_err(e: deadpool_sqlite::InteractError) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn sqlite_err(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::DatabaseBusy =>
        {
            StoreError::Busy(err.to_string())
        }
        other => StoreError::Backend(other.to_string()),
    }
}

// --- row <-> record mapping -------------------------------------------------

fn session_from_row(row: &Row) -> rusqlite::Result<Session> {
    let flushed_raw: String = row.get("flushed_thresholds")?;
    let flushed_thresholds: BTreeSet<u32> =
        serde_json::from_str(&flushed_raw).unwrap_or_default();
    let transcript_indexed_at: Option<String> = row.get("transcript_indexed_at")?;

    Ok(Session {
        id: Uuid::from_str(&row.get::<_, String>("id")?).unwrap_or_else(|_| Uuid::new_v4()),
        session_key: row.get("session_key")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
        model: row.get("model")?,
        max_tokens: row.get::<_, i64>("max_tokens")? as u32,
        compaction_count: row.get::<_, i64>("compaction_count")? as u32,
        total_tokens: row.get::<_, i64>("total_tokens")? as u32,
        flushed_thresholds,
        flush_actioned: row.get::<_, i64>("flush_actioned")? != 0,
        transcript_indexed_at: transcript_indexed_at.map(|s| parse_ts(&s)),
    })
}

fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    let tool_input: Option<String> = row.get("tool_input")?;
    let media_raw: String = row.get("media")?;
    let supervisor: Option<String> = row.get("supervisor")?;
    let intervention_type: Option<String> = row.get("intervention_type")?;

    Ok(Message {
        id: row.get("id")?,
        parent_id: row.get("parent_id")?,
        session_key: row.get("session_key")?,
        timestamp: parse_ts(&row.get::<_, String>("timestamp")?),
        role: role_from_str(&row.get::<_, String>("role")?),
        content: row.get("content")?,
        tool_call_id: row.get("tool_call_id")?,
        tool_name: row.get("tool_name")?,
        tool_input: tool_input.and_then(|s| serde_json::from_str(&s).ok()),
        thinking: row.get("thinking")?,
        supervision: supervisor.map(|supervisor| Supervision {
            supervisor,
            intervention_type: intervention_type.unwrap_or_default(),
        }),
        source: row.get("source")?,
        media: serde_json::from_str::<Vec<MediaRefRow>>(&media_raw)
            .unwrap_or_default()
            .into_iter()
            .map(Into::into)
            .collect(),
    })
}

#[derive(serde::Serialize, serde::Deserialize)]
struct MediaRefRow {
    kind: String,
    reference: String,
    mime_type: Option<String>,
}

impl From<&MediaRef> for MediaRefRow {
    fn from(m: &MediaRef) -> Self {
        Self {
            kind: match m.kind {
                MediaKind::Image => "image".to_string(),
                MediaKind::Audio => "audio".to_string(),
            },
            reference: m.reference.clone(),
            mime_type: m.mime_type.clone(),
        }
    }
}

impl From<MediaRefRow> for MediaRef {
    fn from(m: MediaRefRow) -> Self {
        Self {
            kind: if m.kind == "audio" { MediaKind::Audio } else { MediaKind::Image },
            reference: m.reference,
            mime_type: m.mime_type,
        }
    }
}

fn checkpoint_from_row(row: &Row) -> rusqlite::Result<Checkpoint> {
    let topics: String = row.get("topics")?;
    let key_decisions: String = row.get("key_decisions")?;
    let open_questions: String = row.get("open_questions")?;

    Ok(Checkpoint {
        id: row.get("id")?,
        parent_id: row.get("parent_id")?,
        session_key: row.get("session_key")?,
        timestamp: parse_ts(&row.get::<_, String>("timestamp")?),
        summary: row.get("summary")?,
        topics: serde_json::from_str(&topics).unwrap_or_default(),
        key_decisions: serde_json::from_str(&key_decisions).unwrap_or_default(),
        open_questions: serde_json::from_str(&open_questions).unwrap_or_default(),
        tokens_at_checkpoint: row.get::<_, i64>("tokens_at_checkpoint")? as u32,
        message_count_at_checkpoint: row.get::<_, i64>("message_count_at_checkpoint")? as usize,
        generated_by: row.get("generated_by")?,
    })
}

fn compaction_from_row(row: &Row) -> rusqlite::Result<Compaction> {
    let tokens_after: Option<i64> = row.get("tokens_after")?;
    Ok(Compaction {
        id: row.get("id")?,
        parent_id: row.get("parent_id")?,
        session_key: row.get("session_key")?,
        timestamp: parse_ts(&row.get::<_, String>("timestamp")?),
        summary: row.get("summary")?,
        first_kept_entry_id: row.get("first_kept_entry_id")?,
        tokens_before: row.get::<_, i64>("tokens_before")? as u32,
        tokens_after: tokens_after.map(|v| v as u32),
        needs_summary_retry: row.get::<_, i64>("needs_summary_retry")? != 0,
    })
}

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::ToolUse => "tool_use",
        Role::ToolResult => "tool_result",
        Role::System => "system",
    }
}

fn role_from_str(s: &str) -> Role {
    match s {
        "assistant" => Role::Assistant,
        "tool_use" => Role::ToolUse,
        "tool_result" => Role::ToolResult,
        "system" => Role::System,
        _ => Role::User,
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn get_session(&self, session_key: &str) -> Result<Option<Session>, StoreError> {
        let session_key = session_key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM sessions WHERE session_key = ?1",
                params![session_key],
                session_from_row,
            )
            .optional()
            .map_err(sqlite_err)
        })
        .await
    }

    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let session = session.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (session_key, id, created_at, updated_at, model, max_tokens, compaction_count, total_tokens, flushed_thresholds, flush_actioned, transcript_indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(session_key) DO NOTHING",
                params![
                    session.session_key,
                    session.id.to_string(),
                    fmt_ts(session.created_at),
                    fmt_ts(session.updated_at),
                    session.model,
                    session.max_tokens,
                    session.compaction_count,
                    session.total_tokens,
                    serde_json::to_string(&session.flushed_thresholds).unwrap(),
                    session.flush_actioned as i64,
                    session.transcript_indexed_at.map(fmt_ts),
                ],
            )
            .map_err(sqlite_err)?;
            Ok(())
        })
        .await
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let session = session.clone();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE sessions SET updated_at = ?2, model = ?3, max_tokens = ?4, compaction_count = ?5,
                     total_tokens = ?6, flushed_thresholds = ?7, flush_actioned = ?8, transcript_indexed_at = ?9
                 WHERE session_key = ?1",
                params![
                    session.session_key,
                    fmt_ts(session.updated_at),
                    session.model,
                    session.max_tokens,
                    session.compaction_count,
                    session.total_tokens,
                    serde_json::to_string(&session.flushed_thresholds).unwrap(),
                    session.flush_actioned as i64,
                    session.transcript_indexed_at.map(fmt_ts),
                ],
            )
            .map_err(sqlite_err)?;
            if updated == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM sessions ORDER BY updated_at DESC")
                .map_err(sqlite_err)?;
            let rows = stmt
                .query_map([], session_from_row)
                .map_err(sqlite_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(sqlite_err)
        })
        .await
    }

    async fn append_message(&self, msg: &Message) -> Result<(), StoreError> {
        let msg = msg.clone();
        self.with_conn(move |conn| {
            let media: Vec<MediaRefRow> = msg.media.iter().map(Into::into).collect();
            conn.execute(
                "INSERT INTO messages (id, parent_id, session_key, timestamp, role, content,
                     tool_call_id, tool_name, tool_input, thinking, supervisor, intervention_type, source, media)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    msg.id,
                    msg.parent_id,
                    msg.session_key,
                    fmt_ts(msg.timestamp),
                    role_to_str(msg.role),
                    msg.content,
                    msg.tool_call_id,
                    msg.tool_name,
                    msg.tool_input.as_ref().map(|v| v.to_string()),
                    msg.thinking,
                    msg.supervision.as_ref().map(|s| s.supervisor.clone()),
                    msg.supervision.as_ref().map(|s| s.intervention_type.clone()),
                    msg.source,
                    serde_json::to_string(&media).unwrap(),
                ],
            )
            .map_err(sqlite_err)?;
            conn.execute(
                "UPDATE sessions SET updated_at = ?2 WHERE session_key = ?1",
                params![msg.session_key, fmt_ts(msg.timestamp)],
            )
            .map_err(sqlite_err)?;
            Ok(())
        })
        .await
    }

    async fn get_messages(
        &self,
        session_key: &str,
        opts: GetMessagesOpts,
    ) -> Result<Vec<Message>, StoreError> {
        let session_key = session_key.to_string();
        self.with_conn(move |conn| {
            let mut sql = String::from("SELECT * FROM messages WHERE session_key = ?1");
            let mut after_ts: Option<String> = None;

            if let Some(after_id) = &opts.after_id {
                let ts: Option<String> = conn
                    .query_row(
                        "SELECT timestamp FROM messages WHERE id = ?1",
                        params![after_id],
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(sqlite_err)?;
                after_ts = ts;
            } else if let Some(t) = opts.after_time {
                after_ts = Some(fmt_ts(t));
            }

            if after_ts.is_some() {
                sql.push_str(" AND timestamp > ?2");
            }
            sql.push_str(" ORDER BY timestamp ASC");
            if let Some(limit) = opts.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }

            let mut stmt = conn.prepare(&sql).map_err(sqlite_err)?;
            let rows: Vec<Message> = if let Some(after_ts) = after_ts {
                stmt.query_map(params![session_key, after_ts], message_from_row)
                    .map_err(sqlite_err)?
                    .collect::<Result<_, _>>()
                    .map_err(sqlite_err)?
            } else {
                stmt.query_map(params![session_key], message_from_row)
                    .map_err(sqlite_err)?
                    .collect::<Result<_, _>>()
                    .map_err(sqlite_err)?
            };

            let filtered = match &opts.roles_only {
                Some(roles) => rows.into_iter().filter(|m| roles.contains(&m.role)).collect(),
                None => rows,
            };

            Ok(filtered)
        })
        .await
    }

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let checkpoint = checkpoint.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO checkpoints (id, parent_id, session_key, timestamp, summary, topics,
                     key_decisions, open_questions, tokens_at_checkpoint, message_count_at_checkpoint, generated_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    checkpoint.id,
                    checkpoint.parent_id,
                    checkpoint.session_key,
                    fmt_ts(checkpoint.timestamp),
                    checkpoint.summary,
                    serde_json::to_string(&checkpoint.topics).unwrap(),
                    serde_json::to_string(&checkpoint.key_decisions).unwrap(),
                    serde_json::to_string(&checkpoint.open_questions).unwrap(),
                    checkpoint.tokens_at_checkpoint,
                    checkpoint.message_count_at_checkpoint as i64,
                    checkpoint.generated_by,
                ],
            )
            .map_err(sqlite_err)?;
            Ok(())
        })
        .await
    }

    async fn get_latest_checkpoint(
        &self,
        session_key: &str,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let session_key = session_key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM checkpoints WHERE session_key = ?1 ORDER BY timestamp DESC LIMIT 1",
                params![session_key],
                checkpoint_from_row,
            )
            .optional()
            .map_err(sqlite_err)
        })
        .await
    }

    async fn get_checkpoints(&self, session_key: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let session_key = session_key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM checkpoints WHERE session_key = ?1 ORDER BY timestamp ASC")
                .map_err(sqlite_err)?;
            stmt.query_map(params![session_key], checkpoint_from_row)
                .map_err(sqlite_err)?
                .collect::<Result<_, _>>()
                .map_err(sqlite_err)
        })
        .await
    }

    async fn append_compaction(&self, compaction: &Compaction) -> Result<(), StoreError> {
        let compaction = compaction.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO compactions (id, parent_id, session_key, timestamp, summary,
                     first_kept_entry_id, tokens_before, tokens_after, needs_summary_retry)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    compaction.id,
                    compaction.parent_id,
                    compaction.session_key,
                    fmt_ts(compaction.timestamp),
                    compaction.summary,
                    compaction.first_kept_entry_id,
                    compaction.tokens_before,
                    compaction.tokens_after,
                    compaction.needs_summary_retry as i64,
                ],
            )
            .map_err(sqlite_err)?;
            Ok(())
        })
        .await
    }

    async fn get_compactions(&self, session_key: &str) -> Result<Vec<Compaction>, StoreError> {
        let session_key = session_key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM compactions WHERE session_key = ?1 ORDER BY timestamp ASC")
                .map_err(sqlite_err)?;
            stmt.query_map(params![session_key], compaction_from_row)
                .map_err(sqlite_err)?
                .collect::<Result<_, _>>()
                .map_err(sqlite_err)
        })
        .await
    }

    async fn get_latest_compaction(
        &self,
        session_key: &str,
    ) -> Result<Option<Compaction>, StoreError> {
        let session_key = session_key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM compactions WHERE session_key = ?1 ORDER BY timestamp DESC LIMIT 1",
                params![session_key],
                compaction_from_row,
            )
            .optional()
            .map_err(sqlite_err)
        })
        .await
    }

    async fn get_pending_summary_retry(&self) -> Result<Option<Compaction>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM compactions WHERE needs_summary_retry = 1 ORDER BY timestamp ASC LIMIT 1",
                [],
                compaction_from_row,
            )
            .optional()
            .map_err(sqlite_err)
        })
        .await
    }

    async fn update_compaction_summary(&self, id: &str, summary: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        let summary = summary.to_string();
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE compactions SET summary = ?2, needs_summary_retry = 0 WHERE id = ?1",
                    params![id, summary],
                )
                .map_err(sqlite_err)?;
            if updated == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await
    }

    async fn get_messages_in_range(
        &self,
        session_key: &str,
        start_after_id: Option<&str>,
        end_before_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let session_key = session_key.to_string();
        let start_after_id = start_after_id.map(|s| s.to_string());
        let end_before_id = end_before_id.to_string();
        self.with_conn(move |conn| {
            let end_ts: String = conn
                .query_row(
                    "SELECT timestamp FROM messages WHERE id = ?1",
                    params![end_before_id],
                    |r| r.get(0),
                )
                .map_err(sqlite_err)?;

            let start_ts: Option<String> = match &start_after_id {
                Some(id) => conn
                    .query_row(
                        "SELECT timestamp FROM messages WHERE id = ?1",
                        params![id],
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(sqlite_err)?,
                None => None,
            };

            let mut stmt;
            let rows: Vec<Message> = if let Some(start_ts) = start_ts {
                stmt = conn
                    .prepare(
                        "SELECT * FROM messages WHERE session_key = ?1 AND timestamp > ?2 AND timestamp < ?3 ORDER BY timestamp ASC",
                    )
                    .map_err(sqlite_err)?;
                stmt.query_map(params![session_key, start_ts, end_ts], message_from_row)
                    .map_err(sqlite_err)?
                    .collect::<Result<_, _>>()
                    .map_err(sqlite_err)?
            } else {
                stmt = conn
                    .prepare(
                        "SELECT * FROM messages WHERE session_key = ?1 AND timestamp < ?2 ORDER BY timestamp ASC",
                    )
                    .map_err(sqlite_err)?;
                stmt.query_map(params![session_key, end_ts], message_from_row)
                    .map_err(sqlite_err)?
                    .collect::<Result<_, _>>()
                    .map_err(sqlite_err)?
            };

            Ok(rows)
        })
        .await
    }

    async fn get_previous_compaction(
        &self,
        session_key: &str,
        before_timestamp: DateTime<Utc>,
    ) -> Result<Option<Compaction>, StoreError> {
        let session_key = session_key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM compactions WHERE session_key = ?1 AND timestamp < ?2 ORDER BY timestamp DESC LIMIT 1",
                params![session_key, fmt_ts(before_timestamp)],
                compaction_from_row,
            )
            .optional()
            .map_err(sqlite_err)
        })
        .await
    }

    async fn delete_orphaned_tool_messages(&self, session_key: &str) -> Result<u64, StoreError> {
        let session_key = session_key.to_string();
        self.with_conn(move |conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM messages WHERE session_key = ?1 AND role IN ('tool_use', 'tool_result')",
                    params![session_key],
                )
                .map_err(sqlite_err)?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn get_provider_state(
        &self,
        session_key: &str,
        provider: &str,
    ) -> Result<Option<Json>, StoreError> {
        let session_key = session_key.to_string();
        let provider = provider.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT state FROM provider_state WHERE session_key = ?1 AND provider = ?2",
                    params![session_key, provider],
                    |r| r.get(0),
                )
                .optional()
                .map_err(sqlite_err)?;
            Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
        })
        .await
    }

    async fn set_provider_state(
        &self,
        session_key: &str,
        provider: &str,
        state: Json,
    ) -> Result<(), StoreError> {
        let session_key = session_key.to_string();
        let provider = provider.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO provider_state (session_key, provider, state, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_key, provider) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
                params![session_key, provider, state.to_string(), fmt_ts(Utc::now())],
            )
            .map_err(sqlite_err)?;
            Ok(())
        })
        .await
    }

    async fn delete_provider_states(&self, session_key: &str) -> Result<(), StoreError> {
        let session_key = session_key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM provider_state WHERE session_key = ?1",
                params![session_key],
            )
            .map_err(sqlite_err)?;
            Ok(())
        })
        .await
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            super::migrations::migrations()
                .to_latest(conn)
                .map_err(|e| StoreError::MigrationFailed(e.to_string()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Role;

    #[tokio::test]
    async fn migrate_twice_is_idempotent() {
        let (store, _dir) = SqliteStore::open_temp().await;
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn append_and_read_messages_in_order() {
        let (store, _dir) = SqliteStore::open_temp().await;
        let session = Session::primary("gpt-5", 200_000);
        store.create_session(&session).await.unwrap();

        for i in 0..5 {
            let msg = Message::new("primary", Role::User, format!("message {i}"));
            store.append_message(&msg).await.unwrap();
        }

        let messages = store
            .get_messages("primary", GetMessagesOpts::default())
            .await
            .unwrap();
        assert_eq!(messages.len(), 5);
        for (i, msg) in messages.iter().enumerate() {
            assert_eq!(msg.content, format!("message {i}"));
        }
    }

    #[tokio::test]
    async fn pending_summary_retry_is_oldest_and_clears_atomically() {
        let (store, _dir) = SqliteStore::open_temp().await;
        let session = Session::primary("gpt-5", 200_000);
        store.create_session(&session).await.unwrap();

        let msg = Message::new("primary", Role::User, "kept");
        store.append_message(&msg).await.unwrap();

        let mut c1 = Compaction {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            session_key: "primary".into(),
            timestamp: Utc::now(),
            summary: "placeholder 1".into(),
            first_kept_entry_id: msg.id.clone(),
            tokens_before: 100,
            tokens_after: Some(40),
            needs_summary_retry: true,
        };
        store.append_compaction(&c1).await.unwrap();

        c1.id = Uuid::new_v4().to_string();
        c1.timestamp = Utc::now() + chrono::Duration::seconds(5);
        c1.summary = "placeholder 2".into();
        store.append_compaction(&c1).await.unwrap();

        let pending = store.get_pending_summary_retry().await.unwrap().unwrap();
        assert_eq!(pending.summary, "placeholder 1");

        store
            .update_compaction_summary(&pending.id, "real summary")
            .await
            .unwrap();

        let next_pending = store.get_pending_summary_retry().await.unwrap().unwrap();
        assert_eq!(next_pending.summary, "placeholder 2");
    }

    #[tokio::test]
    async fn delete_orphaned_tool_messages_removes_only_tool_roles() {
        let (store, _dir) = SqliteStore::open_temp().await;
        let session = Session::primary("gpt-5", 200_000);
        store.create_session(&session).await.unwrap();

        store
            .append_message(&Message::new("primary", Role::User, "hi"))
            .await
            .unwrap();
        store
            .append_message(&Message::tool_use("primary", "t1", "search", serde_json::json!({})))
            .await
            .unwrap();
        store
            .append_message(&Message::tool_result("primary", "t1", "result"))
            .await
            .unwrap();

        let deleted = store.delete_orphaned_tool_messages("primary").await.unwrap();
        assert_eq!(deleted, 2);

        let remaining = store
            .get_messages("primary", GetMessagesOpts::default())
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].role, Role::User);
    }

    #[tokio::test]
    async fn provider_state_roundtrips_and_deletes() {
        let (store, _dir) = SqliteStore::open_temp().await;
        let session = Session::primary("gpt-5", 200_000);
        store.create_session(&session).await.unwrap();

        store
            .set_provider_state("primary", "anthropic", serde_json::json!({"response_id": "abc"}))
            .await
            .unwrap();
        let state = store.get_provider_state("primary", "anthropic").await.unwrap();
        assert_eq!(state.unwrap()["response_id"], "abc");

        store.delete_provider_states("primary").await.unwrap();
        let state = store.get_provider_state("primary", "anthropic").await.unwrap();
        assert!(state.is_none());
    }
}
