use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who produced a turn within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Parse a stored role string. Anything unrecognised reads as `User`;
    /// a conversation row can only hold the two roles we write.
    pub fn parse(s: &str) -> Self {
        if s == "assistant" {
            Role::Assistant
        } else {
            Role::User
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of payload a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
    Audio,
    Mixed,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::Audio => "audio",
            ContentType::Mixed => "mixed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "image" => ContentType::Image,
            "audio" => ContentType::Audio,
            "mixed" => ContentType::Mixed,
            _ => ContentType::Text,
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message within a conversation.
///
/// Messages are constructed in memory first (the caller gets them before the
/// durable write lands) and persisted by a deferred job, so the id is
/// generated up front: UUIDv7, roughly time-sortable for log correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub content_type: ContentType,
    /// Opaque media references (resolved to URLs by the storage layer).
    #[serde(default)]
    pub media_refs: Vec<String>,
    /// Provider-reported output token count. `None` for user turns.
    pub token_count: Option<u32>,
    /// Caller-supplied deduplication token. At most one message per
    /// non-empty key within a conversation.
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a fresh user turn with a generated id and current timestamp.
    pub fn user_turn(
        conversation_id: &str,
        content: String,
        content_type: ContentType,
        media_refs: Vec<String>,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            conversation_id: conversation_id.to_string(),
            role: Role::User,
            content,
            content_type,
            media_refs,
            token_count: None,
            idempotency_key,
            created_at: Utc::now(),
        }
    }

    /// Build a fresh assistant turn with a generated id and current timestamp.
    pub fn assistant_turn(conversation_id: &str, content: String, token_count: u32) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            conversation_id: conversation_id.to_string(),
            role: Role::Assistant,
            content,
            content_type: ContentType::Text,
            media_refs: Vec::new(),
            token_count: Some(token_count),
            idempotency_key: None,
            created_at: Utc::now(),
        }
    }
}

/// A conversation between one user and one persona.
///
/// `metadata` is a flat JSON object holding durable facts mined from the
/// exchange ("memories"); the extraction job merges new keys in and
/// overwrites stale values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub persona_id: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persona: the character/system instructions a conversation runs under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    /// System instructions injected ahead of every turn.
    pub system_prompt: String,
    /// Restricted-content classification; routes generation to the
    /// alternate provider when one is configured.
    pub restricted: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_roundtrip() {
        assert_eq!(Role::parse("assistant"), Role::Assistant);
        assert_eq!(Role::parse("user"), Role::User);
        assert_eq!(Role::parse("garbage"), Role::User);
        assert_eq!(Role::Assistant.as_str(), "assistant");
    }

    #[test]
    fn content_type_roundtrip() {
        for ct in [
            ContentType::Text,
            ContentType::Image,
            ContentType::Audio,
            ContentType::Mixed,
        ] {
            assert_eq!(ContentType::parse(ct.as_str()), ct);
        }
        assert_eq!(ContentType::parse("unknown"), ContentType::Text);
    }

    #[test]
    fn user_turn_carries_key_and_fresh_id() {
        let a = Message::user_turn("c-1", "hi".into(), ContentType::Text, vec![], Some("k".into()));
        let b = Message::user_turn("c-1", "hi".into(), ContentType::Text, vec![], None);
        assert_ne!(a.id, b.id);
        assert_eq!(a.idempotency_key.as_deref(), Some("k"));
        assert_eq!(a.role, Role::User);
        assert!(a.token_count.is_none());
    }
}
