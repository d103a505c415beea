use thiserror::Error;

use confab_store::StoreError;

/// Caller-visible failures of the send pipeline.
///
/// Everything else the pipeline can hit (provider errors, transcription
/// errors, persistence races) degrades inside `send_message` and never
/// reaches the caller.
#[derive(Debug, Error)]
pub enum SendError {
    /// The conversation does not exist (or was deleted).
    #[error("conversation not found: {id}")]
    ConversationNotFound { id: String },

    /// The conversation's persona does not exist.
    #[error("persona not found: {id}")]
    PersonaNotFound { id: String },

    /// The caller does not own the conversation.
    #[error("forbidden: caller does not own conversation {id}")]
    Forbidden { id: String },

    /// The validation reads themselves failed; there is no conversation
    /// to degrade against, so this surfaces (the transport layer maps it
    /// to a 5xx).
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, SendError>;
