use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::instrument;
use uuid::Uuid;

use confab_core::types::{ContentType, Conversation, Message, Persona, Role};

use crate::db::init_db;
use crate::error::{Result, StoreError};

// SQLite extended result codes for constraint violations.
const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;
const SQLITE_CONSTRAINT_FOREIGNKEY: i32 = 787;

/// Thread-safe durable store for personas, conversations and messages.
///
/// Wraps a single SQLite connection in a `Mutex`. For high-concurrency
/// deployments consider a connection pool, but a Mutex is sufficient for the
/// single-node target.
pub struct ConversationStore {
    db: Mutex<Connection>,
}

impl ConversationStore {
    /// Wrap a connection, initialising the schema (idempotent).
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn create_persona(
        &self,
        name: &str,
        system_prompt: &str,
        restricted: bool,
    ) -> Result<Persona> {
        let persona = Persona {
            id: Uuid::now_v7().to_string(),
            name: name.to_string(),
            system_prompt: system_prompt.to_string(),
            restricted,
            created_at: Utc::now(),
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO personas (id, name, system_prompt, restricted, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                persona.id,
                persona.name,
                persona.system_prompt,
                persona.restricted,
                persona.created_at.to_rfc3339(),
            ],
        )?;
        Ok(persona)
    }

    pub fn get_persona(&self, id: &str) -> Result<Persona> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, name, system_prompt, restricted, created_at
             FROM personas WHERE id = ?1",
            rusqlite::params![id],
            row_to_persona,
        ) {
            Ok(p) => Ok(p),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(StoreError::PersonaNotFound {
                id: id.to_string(),
            }),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn create_conversation(&self, user_id: &str, persona_id: &str) -> Result<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::now_v7().to_string(),
            user_id: user_id.to_string(),
            persona_id: persona_id.to_string(),
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO conversations (id, user_id, persona_id, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, '{}', ?4, ?4)",
            rusqlite::params![
                conversation.id,
                conversation.user_id,
                conversation.persona_id,
                now.to_rfc3339(),
            ],
        )?;
        Ok(conversation)
    }

    #[instrument(skip(self), fields(id))]
    pub fn get_conversation(&self, id: &str) -> Result<Conversation> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, user_id, persona_id, metadata, created_at, updated_at
             FROM conversations WHERE id = ?1",
            rusqlite::params![id],
            row_to_conversation,
        ) {
            Ok(c) => Ok(c),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(StoreError::ConversationNotFound {
                id: id.to_string(),
            }),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Permanently delete a conversation and (via cascade) its messages.
    pub fn delete_conversation(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "DELETE FROM conversations WHERE id = ?1",
            rusqlite::params![id],
        )?;
        if rows_changed == 0 {
            return Err(StoreError::ConversationNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Insert one message row.
    ///
    /// Runs inside the deferred persistence job, after the caller already got
    /// its response. Constraint violations here are races, not bugs, and are
    /// surfaced as typed errors so the worker can log and drop them.
    #[instrument(skip(self, msg), fields(id = %msg.id, conversation = %msg.conversation_id))]
    pub fn create_message(&self, msg: &Message) -> Result<()> {
        let media = serde_json::to_string(&msg.media_refs).unwrap_or_else(|_| "[]".to_string());
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO messages
             (id, conversation_id, role, content, content_type, media_refs,
              token_count, idempotency_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                msg.id,
                msg.conversation_id,
                msg.role.as_str(),
                msg.content,
                msg.content_type.as_str(),
                media,
                msg.token_count,
                msg.idempotency_key,
                msg.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| classify_insert_error(e, msg))?;
        Ok(())
    }

    /// Look up the user message stored under `(conversation_id, key)` and the
    /// assistant reply that follows it.
    ///
    /// Turns are always inserted user-then-assistant, so "the reply that
    /// follows" is the next assistant row in insertion order.
    pub fn find_by_idempotency_key(
        &self,
        conversation_id: &str,
        key: &str,
    ) -> Result<Option<(Message, Option<Message>)>> {
        let db = self.db.lock().unwrap();
        let user = match db.query_row(
            "SELECT id, conversation_id, role, content, content_type, media_refs,
                    token_count, idempotency_key, created_at
             FROM messages
             WHERE conversation_id = ?1 AND idempotency_key = ?2",
            rusqlite::params![conversation_id, key],
            row_to_message,
        ) {
            Ok(m) => m,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(StoreError::Database(e)),
        };

        let assistant = match db.query_row(
            "SELECT id, conversation_id, role, content, content_type, media_refs,
                    token_count, idempotency_key, created_at
             FROM messages
             WHERE conversation_id = ?1 AND role = 'assistant'
               AND rowid > (SELECT rowid FROM messages
                            WHERE conversation_id = ?1 AND idempotency_key = ?2)
             ORDER BY rowid ASC
             LIMIT 1",
            rusqlite::params![conversation_id, key],
            row_to_message,
        ) {
            Ok(m) => Some(m),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(StoreError::Database(e)),
        };

        Ok(Some((user, assistant)))
    }

    /// Most-recent messages for a conversation, newest first (insertion
    /// order, which is arrival order for a single-writer pipeline).
    pub fn list_recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, role, content, content_type, media_refs,
                    token_count, idempotency_key, created_at
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![conversation_id, limit as i64],
            row_to_message,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Replace the conversation's metadata object. Callers merge first; the
    /// store writes whatever map it is handed.
    pub fn update_metadata(
        &self,
        id: &str,
        metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let rendered = serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string());
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "UPDATE conversations SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![rendered, Utc::now().to_rfc3339(), id],
        )?;
        if rows_changed == 0 {
            return Err(StoreError::ConversationNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Bump `updated_at` so recency ordering stays current.
    pub fn touch_conversation(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), id],
        )?;
        if rows_changed == 0 {
            return Err(StoreError::ConversationNotFound { id: id.to_string() });
        }
        Ok(())
    }
}

/// Map a constraint violation on message insert to its typed race error.
fn classify_insert_error(e: rusqlite::Error, msg: &Message) -> StoreError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        match err.extended_code {
            SQLITE_CONSTRAINT_FOREIGNKEY => {
                return StoreError::ConversationGone {
                    conversation_id: msg.conversation_id.clone(),
                }
            }
            SQLITE_CONSTRAINT_UNIQUE => {
                return StoreError::DuplicateIdempotencyKey {
                    conversation_id: msg.conversation_id.clone(),
                    key: msg.idempotency_key.clone().unwrap_or_default(),
                }
            }
            _ => {}
        }
    }
    StoreError::Database(e)
}

fn row_to_persona(row: &rusqlite::Row<'_>) -> rusqlite::Result<Persona> {
    let created: String = row.get(4)?;
    Ok(Persona {
        id: row.get(0)?,
        name: row.get(1)?,
        system_prompt: row.get(2)?,
        restricted: row.get(3)?,
        created_at: parse_ts(&created),
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let metadata: String = row.get(3)?;
    let created: String = row.get(4)?;
    let updated: String = row.get(5)?;
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        persona_id: row.get(2)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let content_type: String = row.get(4)?;
    let media: String = row.get(5)?;
    let created: String = row.get(8)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: Role::parse(&role),
        content: row.get(3)?,
        content_type: ContentType::parse(&content_type),
        media_refs: serde_json::from_str(&media).unwrap_or_default(),
        token_count: row.get(6)?,
        idempotency_key: row.get(7)?,
        created_at: parse_ts(&created),
    })
}

/// Stored timestamps are written by us in RFC3339; a malformed one reads as
/// the epoch rather than failing the whole row.
fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> ConversationStore {
        let conn = Connection::open_in_memory().expect("open sqlite");
        ConversationStore::new(conn).expect("init store")
    }

    fn seed(store: &ConversationStore) -> (Persona, Conversation) {
        let persona = store
            .create_persona("Ada", "You are Ada, a helpful companion.", false)
            .unwrap();
        let conversation = store.create_conversation("u-1", &persona.id).unwrap();
        (persona, conversation)
    }

    #[test]
    fn get_conversation_roundtrip() {
        let store = open_store();
        let (persona, conversation) = seed(&store);
        let loaded = store.get_conversation(&conversation.id).unwrap();
        assert_eq!(loaded.user_id, "u-1");
        assert_eq!(loaded.persona_id, persona.id);
        assert!(loaded.metadata.is_empty());
    }

    #[test]
    fn missing_conversation_is_typed() {
        let store = open_store();
        let err = store.get_conversation("nope").unwrap_err();
        assert!(matches!(err, StoreError::ConversationNotFound { .. }));
    }

    #[test]
    fn message_insert_after_delete_reports_gone() {
        let store = open_store();
        let (_, conversation) = seed(&store);
        store.delete_conversation(&conversation.id).unwrap();

        let msg = Message::user_turn(&conversation.id, "hi".into(), ContentType::Text, vec![], None);
        let err = store.create_message(&msg).unwrap_err();
        assert!(matches!(err, StoreError::ConversationGone { .. }));
    }

    #[test]
    fn duplicate_idempotency_key_is_rejected() {
        let store = open_store();
        let (_, conversation) = seed(&store);

        let first = Message::user_turn(
            &conversation.id,
            "hi".into(),
            ContentType::Text,
            vec![],
            Some("k-1".into()),
        );
        store.create_message(&first).unwrap();

        let second = Message::user_turn(
            &conversation.id,
            "hi again".into(),
            ContentType::Text,
            vec![],
            Some("k-1".into()),
        );
        let err = store.create_message(&second).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIdempotencyKey { .. }));
    }

    #[test]
    fn keyless_messages_are_not_deduplicated() {
        let store = open_store();
        let (_, conversation) = seed(&store);
        for _ in 0..2 {
            let msg =
                Message::user_turn(&conversation.id, "same".into(), ContentType::Text, vec![], None);
            store.create_message(&msg).unwrap();
        }
        assert_eq!(store.list_recent_messages(&conversation.id, 10).unwrap().len(), 2);
    }

    #[test]
    fn idempotency_lookup_pairs_user_with_following_reply() {
        let store = open_store();
        let (_, conversation) = seed(&store);

        let user = Message::user_turn(
            &conversation.id,
            "hello".into(),
            ContentType::Text,
            vec![],
            Some("k-7".into()),
        );
        store.create_message(&user).unwrap();
        let assistant = Message::assistant_turn(&conversation.id, "hi there".into(), 5);
        store.create_message(&assistant).unwrap();

        let (found_user, found_assistant) = store
            .find_by_idempotency_key(&conversation.id, "k-7")
            .unwrap()
            .expect("pair present");
        assert_eq!(found_user.id, user.id);
        assert_eq!(found_assistant.unwrap().id, assistant.id);

        assert!(store
            .find_by_idempotency_key(&conversation.id, "other")
            .unwrap()
            .is_none());
    }

    #[test]
    fn list_recent_is_newest_first() {
        let store = open_store();
        let (_, conversation) = seed(&store);
        for i in 0..5 {
            let msg = Message::user_turn(
                &conversation.id,
                format!("m{i}"),
                ContentType::Text,
                vec![],
                None,
            );
            store.create_message(&msg).unwrap();
        }
        let recent = store.list_recent_messages(&conversation.id, 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content, "m4");
        assert_eq!(recent[2].content, "m2");
    }

    #[test]
    fn metadata_update_roundtrip() {
        let store = open_store();
        let (_, conversation) = seed(&store);
        let mut map = serde_json::Map::new();
        map.insert("favorite_color".into(), serde_json::json!("teal"));
        store.update_metadata(&conversation.id, &map).unwrap();

        let loaded = store.get_conversation(&conversation.id).unwrap();
        assert_eq!(loaded.metadata["favorite_color"], "teal");
    }

    #[test]
    fn touch_bumps_updated_at() {
        let store = open_store();
        let (_, conversation) = seed(&store);
        store.touch_conversation(&conversation.id).unwrap();
        let loaded = store.get_conversation(&conversation.id).unwrap();
        assert!(loaded.updated_at >= loaded.created_at);

        let err = store.touch_conversation("missing").unwrap_err();
        assert!(matches!(err, StoreError::ConversationNotFound { .. }));
    }
}
