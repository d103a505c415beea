use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use confab_cache::{CachedTurn, TurnCache};
use confab_core::types::{ContentType, Message};
use confab_providers::{GenerateRequest, ProviderKind, ProviderSet};
use confab_store::{ConversationStore, StoreError};

use crate::context::ContextAssembler;
use crate::error::{Result, SendError};
use crate::jobs::{Job, JobQueue};
use crate::media::MediaResolver;
use crate::types::{SendOutcome, SendRequest};

/// Served whenever the generation provider cannot be reached or keeps
/// failing. The caller always gets an assistant turn back.
pub const FALLBACK_REPLY: &str =
    "I'm having trouble responding right now. Give me a moment and try again.";

/// Stands in for the user's words when transcription fails; the turn still
/// goes through so the conversation is not lost.
pub const TRANSCRIPTION_PLACEHOLDER: &str = "[voice message: transcription unavailable]";

enum Replay {
    /// A stored (user, assistant) pair to return verbatim.
    Pair(Box<SendOutcome>),
    /// Only the user turn exists (a persist was cut short); reuse it
    /// instead of minting a second record under the same key.
    UserOnly(Message),
    Miss,
}

/// The send-message orchestrator.
///
/// Long-lived service object constructed once at startup; every collaborator
/// is injected so tests can swap in fakes. The contract: callers only ever
/// see not-found/forbidden failures. Provider trouble degrades to a
/// fallback reply, and durable persistence is deferred to the job queue
/// after the response is on its way.
pub struct SendPipeline {
    store: Arc<ConversationStore>,
    cache: Arc<TurnCache>,
    providers: Arc<ProviderSet>,
    assembler: ContextAssembler,
    media: Arc<dyn MediaResolver>,
    jobs: JobQueue,
    max_turn_media: usize,
}

impl SendPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ConversationStore>,
        cache: Arc<TurnCache>,
        providers: Arc<ProviderSet>,
        assembler: ContextAssembler,
        media: Arc<dyn MediaResolver>,
        jobs: JobQueue,
        max_turn_media: usize,
    ) -> Self {
        Self {
            store,
            cache,
            providers,
            assembler,
            media,
            jobs,
            max_turn_media,
        }
    }

    /// Drain the deferred-job queue and stop its workers. Used on process
    /// shutdown and by tests that need persistence to have settled.
    pub async fn shutdown(self) {
        self.jobs.shutdown().await;
    }

    #[instrument(skip(self, req), fields(conversation = %req.conversation_id, caller = %req.caller_id))]
    pub async fn send_message(&self, req: SendRequest) -> Result<SendOutcome> {
        // Validation happens before any provider traffic.
        let conversation = self
            .store
            .get_conversation(&req.conversation_id)
            .map_err(|e| match e {
                StoreError::ConversationNotFound { id } => SendError::ConversationNotFound { id },
                other => SendError::Storage(other),
            })?;
        if conversation.user_id != req.caller_id {
            return Err(SendError::Forbidden {
                id: conversation.id,
            });
        }
        let persona = self
            .store
            .get_persona(&conversation.persona_id)
            .map_err(|e| match e {
                StoreError::PersonaNotFound { id } => SendError::PersonaNotFound { id },
                other => SendError::Storage(other),
            })?;

        // Strict dedup on (conversation, key). The cache is consulted first
        // so the window covers turns whose durable write is still deferred.
        let key = req
            .idempotency_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        let mut replay_user: Option<Message> = None;
        if let Some(key) = key.as_deref() {
            match self.find_replay(&conversation.id, key) {
                Replay::Pair(outcome) => return Ok(*outcome),
                Replay::UserOnly(user) => replay_user = Some(user),
                Replay::Miss => {}
            }
        }

        let kind = self.providers.select(persona.restricted);

        let user = match replay_user {
            Some(stored) => stored,
            None => {
                let (content, content_type) = self.resolve_content(&req, kind).await;
                Message::user_turn(
                    &conversation.id,
                    content,
                    content_type,
                    req.media_refs.clone(),
                    key,
                )
            }
        };

        let ctx = self.assembler.assemble(
            &conversation.id,
            &persona.system_prompt,
            &user.content,
            &user.id,
        );
        let media_urls = self.resolve_media(&user.media_refs).await;

        let generate_req = GenerateRequest {
            system: ctx.system,
            history: ctx.history,
            current: user.content.clone(),
            media_urls,
            max_tokens: self.assembler.reserved_output_tokens(),
        };
        let (reply_text, token_count, degraded) =
            match self.providers.generate(kind, &generate_req).await {
                Ok(reply) => (reply.content, reply.token_count, false),
                Err(e) => {
                    warn!(provider = %kind, err = %e, "generation failed, serving fallback reply");
                    (FALLBACK_REPLY.to_string(), 0, true)
                }
            };

        let assistant = Message::assistant_turn(&conversation.id, reply_text, token_count);

        // The cache write lands before we return, so the next send on this
        // conversation sees both turns even though persistence is deferred.
        self.cache.push(
            &conversation.id,
            &[
                CachedTurn::from_message(&user),
                CachedTurn::from_message(&assistant),
            ],
        );

        self.jobs
            .enqueue(Job::PersistTurns {
                user: user.clone(),
                assistant: assistant.clone(),
            })
            .await;
        if degraded {
            debug!("skipping memory extraction for fallback reply");
        } else {
            self.jobs
                .enqueue(Job::ExtractMemories {
                    conversation_id: conversation.id.clone(),
                    provider: kind,
                    user_text: user.content.clone(),
                    assistant_text: assistant.content.clone(),
                })
                .await;
        }
        self.jobs
            .enqueue(Job::TouchConversation {
                conversation_id: conversation.id.clone(),
            })
            .await;

        info!(
            user = %user.id,
            assistant = %assistant.id,
            provider = %kind,
            tokens = token_count,
            degraded,
            "send complete"
        );

        Ok(SendOutcome {
            user,
            assistant,
            degraded,
            replayed: false,
        })
    }

    /// Delete a conversation and evict its cached turns.
    ///
    /// Deferred jobs already in flight for it will log-and-drop when they
    /// run; that race is part of their contract.
    #[instrument(skip(self), fields(conversation = conversation_id))]
    pub fn delete_conversation(&self, conversation_id: &str, caller_id: &str) -> Result<()> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .map_err(|e| match e {
                StoreError::ConversationNotFound { id } => SendError::ConversationNotFound { id },
                other => SendError::Storage(other),
            })?;
        if conversation.user_id != caller_id {
            return Err(SendError::Forbidden {
                id: conversation.id,
            });
        }
        self.store
            .delete_conversation(conversation_id)
            .map_err(|e| match e {
                StoreError::ConversationNotFound { id } => SendError::ConversationNotFound { id },
                other => SendError::Storage(other),
            })?;
        self.cache.invalidate(conversation_id);
        info!("conversation deleted");
        Ok(())
    }

    /// Look for an earlier send under this idempotency key.
    fn find_replay(&self, conversation_id: &str, key: &str) -> Replay {
        if let Some((user, assistant)) = self.cache.find_by_idempotency_key(conversation_id, key) {
            let user = user.into_message(conversation_id);
            match assistant {
                Some(assistant) => {
                    info!(conversation = conversation_id, "idempotent replay served from cache");
                    return Replay::Pair(Box::new(SendOutcome {
                        user,
                        assistant: assistant.into_message(conversation_id),
                        degraded: false,
                        replayed: true,
                    }));
                }
                None => return Replay::UserOnly(user),
            }
        }

        match self.store.find_by_idempotency_key(conversation_id, key) {
            Ok(Some((user, Some(assistant)))) => {
                info!(conversation = conversation_id, "idempotent replay served from store");
                Replay::Pair(Box::new(SendOutcome {
                    user,
                    assistant,
                    degraded: false,
                    replayed: true,
                }))
            }
            Ok(Some((user, None))) => Replay::UserOnly(user),
            Ok(None) => Replay::Miss,
            Err(e) => {
                warn!(
                    conversation = conversation_id,
                    err = %e,
                    "idempotency lookup failed, proceeding without dedup"
                );
                Replay::Miss
            }
        }
    }

    /// Produce the user-turn text. Audio turns transcribe synchronously via
    /// the selected provider; failure degrades to a placeholder rather than
    /// failing the send.
    async fn resolve_content(&self, req: &SendRequest, kind: ProviderKind) -> (String, ContentType) {
        if req.content_type != ContentType::Audio {
            return (req.content.clone(), req.content_type);
        }

        let Some(audio_ref) = req.audio_ref.as_deref() else {
            warn!("audio turn without an audio reference");
            return (TRANSCRIPTION_PLACEHOLDER.to_string(), ContentType::Audio);
        };
        let url = match self.media.resolve(audio_ref).await {
            Ok(url) => url,
            Err(e) => {
                warn!(err = %e, "audio reference unresolvable, using placeholder");
                return (TRANSCRIPTION_PLACEHOLDER.to_string(), ContentType::Audio);
            }
        };
        match self.providers.transcribe(kind, &url).await {
            Ok(text) => (text, ContentType::Audio),
            Err(e) => {
                warn!(err = %e, "transcription failed, using placeholder");
                (TRANSCRIPTION_PLACEHOLDER.to_string(), ContentType::Audio)
            }
        }
    }

    /// Resolve current-turn media references, capped; unresolvable refs are
    /// dropped. History media never reaches this path.
    async fn resolve_media(&self, refs: &[String]) -> Vec<String> {
        let mut urls = Vec::with_capacity(refs.len().min(self.max_turn_media));
        for media_ref in refs.iter().take(self.max_turn_media) {
            match self.media.resolve(media_ref).await {
                Ok(url) => urls.push(url),
                Err(e) => {
                    warn!(media_ref = %media_ref, err = %e, "dropping unresolvable media reference")
                }
            }
        }
        urls
    }
}
