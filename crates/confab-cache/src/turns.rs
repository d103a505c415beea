use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use confab_core::types::{ContentType, Message, Role};

/// In-cache mirror of a message.
///
/// Carries everything needed to reconstruct the full record on an idempotent
/// replay, so a duplicate send can be answered from the cache alone while the
/// durable write is still in flight.
#[derive(Debug, Clone)]
pub struct CachedTurn {
    pub message_id: String,
    pub role: Role,
    pub content: String,
    pub content_type: ContentType,
    pub media_refs: Vec<String>,
    pub token_count: Option<u32>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CachedTurn {
    pub fn from_message(msg: &Message) -> Self {
        Self {
            message_id: msg.id.clone(),
            role: msg.role,
            content: msg.content.clone(),
            content_type: msg.content_type,
            media_refs: msg.media_refs.clone(),
            token_count: msg.token_count,
            idempotency_key: msg.idempotency_key.clone(),
            created_at: msg.created_at,
        }
    }

    pub fn into_message(self, conversation_id: &str) -> Message {
        Message {
            id: self.message_id,
            conversation_id: conversation_id.to_string(),
            role: self.role,
            content: self.content,
            content_type: self.content_type,
            media_refs: self.media_refs,
            token_count: self.token_count,
            idempotency_key: self.idempotency_key,
            created_at: self.created_at,
        }
    }
}

struct Entry {
    /// Newest-first.
    turns: Vec<CachedTurn>,
    expires_at: Instant,
}

/// Shared per-conversation cache of recently produced turns.
///
/// Written synchronously before the pipeline returns and read ahead of the
/// durable store, so a second send on the same conversation observes turns
/// whose persistence is still deferred. Keys expire a fixed TTL after the
/// last push; an absent or expired key reads as empty (a miss, not an
/// error). Writes are append-only per key; concurrent pushers interleave
/// but never lose each other's pairs within an entry update.
pub struct TurnCache {
    entries: DashMap<String, Entry>,
    ttl: Duration,
    max_turns: usize,
}

impl TurnCache {
    pub fn new(ttl: Duration, max_turns: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_turns,
        }
    }

    /// Prepend `turns` (given oldest-first) for a conversation and reset the
    /// TTL. The bounded list keeps only the newest `max_turns`.
    pub fn push(&self, conversation_id: &str, turns: &[CachedTurn]) {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(conversation_id.to_string())
            .or_insert_with(|| Entry {
                turns: Vec::new(),
                expires_at: now + self.ttl,
            });

        // A stale list must not resurrect on the next push.
        if now >= entry.expires_at {
            entry.turns.clear();
        }

        for turn in turns {
            entry.turns.insert(0, turn.clone());
        }
        entry.turns.truncate(self.max_turns);
        entry.expires_at = now + self.ttl;
        debug!(
            conversation = conversation_id,
            pushed = turns.len(),
            cached = entry.turns.len(),
            "cache push"
        );
    }

    /// Up to `limit` most-recent turns, newest first. Expired entries are
    /// dropped on read.
    pub fn read(&self, conversation_id: &str, limit: usize) -> Vec<CachedTurn> {
        if self.expire_if_stale(conversation_id) {
            return Vec::new();
        }
        match self.entries.get(conversation_id) {
            Some(entry) => entry.turns.iter().take(limit).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Find the user turn stored under `key` and the assistant turn pushed
    /// alongside it (pairs are adjacent: the reply sits just in front of its
    /// user turn in the newest-first list).
    pub fn find_by_idempotency_key(
        &self,
        conversation_id: &str,
        key: &str,
    ) -> Option<(CachedTurn, Option<CachedTurn>)> {
        if self.expire_if_stale(conversation_id) {
            return None;
        }
        let entry = self.entries.get(conversation_id)?;
        let pos = entry.turns.iter().position(|t| {
            t.role == Role::User && t.idempotency_key.as_deref() == Some(key)
        })?;
        let user = entry.turns[pos].clone();
        let assistant = pos
            .checked_sub(1)
            .map(|i| &entry.turns[i])
            .filter(|t| t.role == Role::Assistant)
            .cloned();
        Some((user, assistant))
    }

    /// Drop a conversation's cached turns (used on conversation deletion).
    pub fn invalidate(&self, conversation_id: &str) {
        self.entries.remove(conversation_id);
    }

    /// Remove the entry when its TTL has lapsed. Returns true if it was
    /// stale (or is now gone).
    fn expire_if_stale(&self, conversation_id: &str) -> bool {
        let stale = match self.entries.get(conversation_id) {
            Some(entry) => Instant::now() >= entry.expires_at,
            None => return true,
        };
        if stale {
            self.entries.remove(conversation_id);
        }
        stale
    }
}
