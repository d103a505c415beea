use confab_core::types::{ContentType, Message};

/// One send-message invocation, as handed over by the transport layer.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub conversation_id: String,
    /// Authenticated caller; must own the conversation.
    pub caller_id: String,
    pub content: String,
    pub content_type: ContentType,
    /// Opaque references to already-uploaded media for this turn.
    pub media_refs: Vec<String>,
    /// Opaque reference to an audio blob to transcribe (audio turns only).
    pub audio_ref: Option<String>,
    /// Optional deduplication token. Absent means no dedup for this call,
    /// a documented legacy mode, not an oversight.
    pub idempotency_key: Option<String>,
}

impl SendRequest {
    /// Plain text turn with no media and no dedup key.
    pub fn text(conversation_id: &str, caller_id: &str, content: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            caller_id: caller_id.to_string(),
            content: content.to_string(),
            content_type: ContentType::Text,
            media_refs: Vec::new(),
            audio_ref: None,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: &str) -> Self {
        self.idempotency_key = Some(key.to_string());
        self
    }
}

/// What the caller gets back: both turns, plus degradation flags for the
/// transport layer to surface if it wants to.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub user: Message,
    pub assistant: Message,
    /// True when the assistant content is the fixed fallback (the provider
    /// could not be reached or kept failing).
    pub degraded: bool,
    /// True when this is an idempotent replay of an earlier send.
    pub replayed: bool,
}
