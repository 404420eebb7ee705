//! Version-numbered schema migrations for [`super::SqliteStore`].
//!
//! Applied idempotently via `rusqlite_migration`; the current migration
//! series provides every column spec §6 requires: `message.thinking`,
//! `supervisor`/`intervention_type`, `transcript_indexed_at`,
//! `needs_summary_retry`, and the `provider_state` table.

use rusqlite_migration::{Migrations, M};

pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            r#"
            CREATE TABLE sessions (
                session_key           TEXT PRIMARY KEY,
                id                    TEXT NOT NULL,
                created_at            TEXT NOT NULL,
                updated_at            TEXT NOT NULL,
                model                 TEXT NOT NULL,
                max_tokens            INTEGER NOT NULL,
                compaction_count      INTEGER NOT NULL DEFAULT 0,
                total_tokens          INTEGER NOT NULL DEFAULT 0,
                flushed_thresholds    TEXT NOT NULL DEFAULT '[]',
                flush_actioned        INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                parent_id       TEXT,
                session_key     TEXT NOT NULL,
                timestamp       TEXT NOT NULL,
                role            TEXT NOT NULL,
                content         TEXT NOT NULL,
                tool_call_id    TEXT,
                tool_name       TEXT,
                tool_input      TEXT,
                source          TEXT,
                media           TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX idx_messages_session_ts ON messages(session_key, timestamp);

            CREATE TABLE checkpoints (
                id                              TEXT PRIMARY KEY,
                parent_id                       TEXT,
                session_key                     TEXT NOT NULL,
                timestamp                       TEXT NOT NULL,
                summary                         TEXT NOT NULL,
                topics                          TEXT NOT NULL DEFAULT '[]',
                key_decisions                   TEXT NOT NULL DEFAULT '[]',
                open_questions                  TEXT NOT NULL DEFAULT '[]',
                tokens_at_checkpoint             INTEGER NOT NULL,
                message_count_at_checkpoint      INTEGER NOT NULL,
                generated_by                     TEXT NOT NULL
            );
            CREATE INDEX idx_checkpoints_session_ts ON checkpoints(session_key, timestamp);

            CREATE TABLE compactions (
                id                      TEXT PRIMARY KEY,
                parent_id               TEXT,
                session_key             TEXT NOT NULL,
                timestamp               TEXT NOT NULL,
                summary                 TEXT NOT NULL,
                first_kept_entry_id     TEXT NOT NULL,
                tokens_before           INTEGER NOT NULL,
                needs_summary_retry     INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX idx_compactions_session_ts ON compactions(session_key, timestamp);
            CREATE INDEX idx_compactions_retry ON compactions(needs_summary_retry, timestamp);
            "#,
        ),
        // thinking + supervision audit fields on messages.
        M::up(
            r#"
            ALTER TABLE messages ADD COLUMN thinking TEXT;
            ALTER TABLE messages ADD COLUMN supervisor TEXT;
            ALTER TABLE messages ADD COLUMN intervention_type TEXT;
            "#,
        ),
        // transcript_indexed_at resolves the foreign-log re-import question
        // (DESIGN.md Open Question 2).
        M::up("ALTER TABLE sessions ADD COLUMN transcript_indexed_at TEXT;"),
        // needs_summary_retry already exists on compactions from migration 1;
        // this migration adds the recomputed/persisted tokens_after column
        // (DESIGN.md Open Question 1).
        M::up("ALTER TABLE compactions ADD COLUMN tokens_after INTEGER;"),
        M::up(
            r#"
            CREATE TABLE provider_state (
                session_key     TEXT NOT NULL,
                provider        TEXT NOT NULL,
                state           TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                PRIMARY KEY (session_key, provider)
            );
            "#,
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_validate() {
        migrations().validate().expect("migration set must be internally consistent");
    }

    #[test]
    fn running_migrations_twice_is_idempotent() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        let m = migrations();
        m.to_latest(&mut conn).unwrap();
        // Re-applying to an already-migrated connection must be a no-op, not
        // an error (spec §8 "Running Migrate() twice leaves the schema
        // identical").
        m.to_latest(&mut conn).unwrap();
    }
}
