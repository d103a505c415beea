use rusqlite::Connection;

use crate::error::Result;

/// Initialise the conversation tables. Safe to call on every startup
/// (idempotent), and enables foreign-key enforcement for this connection;
/// message inserts must fail once the owning conversation is gone.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    create_personas_table(conn)?;
    create_conversations_table(conn)?;
    create_messages_table(conn)?;
    Ok(())
}

fn create_personas_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS personas (
            id            TEXT PRIMARY KEY,
            name          TEXT NOT NULL,
            system_prompt TEXT NOT NULL,
            restricted    INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn create_conversations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL,
            persona_id  TEXT NOT NULL REFERENCES personas(id),
            metadata    TEXT NOT NULL DEFAULT '{}',
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_user
            ON conversations(user_id, updated_at DESC);",
    )?;
    Ok(())
}

/// The partial unique index enforces the idempotency invariant: within one
/// conversation, at most one message per non-empty idempotency key. Rows
/// without a key are exempt (legacy callers that send none).
fn create_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL
                REFERENCES conversations(id) ON DELETE CASCADE,
            role            TEXT NOT NULL,
            content         TEXT NOT NULL,
            content_type    TEXT NOT NULL DEFAULT 'text',
            media_refs      TEXT NOT NULL DEFAULT '[]',
            token_count     INTEGER,
            idempotency_key TEXT,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_idempotency
            ON messages(conversation_id, idempotency_key)
            WHERE idempotency_key IS NOT NULL;",
    )?;
    Ok(())
}
