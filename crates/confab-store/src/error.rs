use thiserror::Error;

/// Errors from the durable conversation store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested conversation does not exist (or was deleted).
    #[error("conversation not found: {id}")]
    ConversationNotFound { id: String },

    /// The requested persona does not exist.
    #[error("persona not found: {id}")]
    PersonaNotFound { id: String },

    /// A message write referenced a conversation that no longer exists.
    ///
    /// Raised when the owning conversation row was deleted between the
    /// response being sent and the deferred persist running: a benign race
    /// the persistence worker logs and drops.
    #[error("conversation no longer exists: {conversation_id}")]
    ConversationGone { conversation_id: String },

    /// A second message was written with the same non-empty idempotency key.
    #[error("duplicate idempotency key {key} in conversation {conversation_id}")]
    DuplicateIdempotencyKey {
        conversation_id: String,
        key: String,
    },

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
