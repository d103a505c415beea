use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use confab_core::types::Message;
use confab_providers::{ProviderKind, ProviderSet};
use confab_store::{ConversationStore, StoreError};

/// Deferred effects of a completed send, run after the caller already has
/// its response.
#[derive(Debug)]
pub enum Job {
    /// Durably write both turns of an exchange.
    PersistTurns { user: Message, assistant: Message },
    /// Mine durable facts from the exchange and fold them into the
    /// conversation's metadata.
    ExtractMemories {
        conversation_id: String,
        provider: ProviderKind,
        user_text: String,
        assistant_text: String,
    },
    /// Bump the conversation's last-activity timestamp.
    TouchConversation { conversation_id: String },
}

/// Bounded queue plus worker pool for deferred jobs.
///
/// The pipeline enqueues typed jobs instead of spawning ad hoc tasks, which
/// gives enqueue-side backpressure and lets tests drain deterministically
/// via `shutdown`. Every job tolerates the conversation having been deleted
/// since the send: those are logged outcomes, never escaping errors.
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl JobQueue {
    pub fn start(
        store: Arc<ConversationStore>,
        providers: Arc<ProviderSet>,
        worker_count: usize,
        queue_depth: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..worker_count.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let store = Arc::clone(&store);
                let providers = Arc::clone(&providers);
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        match job {
                            Some(job) => run_job(&store, &providers, job).await,
                            None => break,
                        }
                    }
                    debug!(worker, "job worker stopped");
                })
            })
            .collect();

        Self { tx, workers }
    }

    /// Hand a job to the pool. Waits only for queue capacity, never for the
    /// job itself.
    pub async fn enqueue(&self, job: Job) {
        if self.tx.send(job).await.is_err() {
            warn!("job queue closed, dropping job");
        }
    }

    /// Close the queue and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

async fn run_job(store: &ConversationStore, providers: &ProviderSet, job: Job) {
    match job {
        Job::PersistTurns { user, assistant } => persist_turns(store, user, assistant),
        Job::ExtractMemories {
            conversation_id,
            provider,
            user_text,
            assistant_text,
        } => {
            extract_memories(store, providers, &conversation_id, provider, &user_text, &assistant_text)
                .await
        }
        Job::TouchConversation { conversation_id } => {
            match store.touch_conversation(&conversation_id) {
                Ok(()) => {}
                Err(StoreError::ConversationNotFound { .. }) => {
                    debug!(conversation = %conversation_id, "conversation gone before activity touch");
                }
                Err(e) => warn!(conversation = %conversation_id, err = %e, "activity touch failed"),
            }
        }
    }
}

fn persist_turns(store: &ConversationStore, user: Message, assistant: Message) {
    for msg in [&user, &assistant] {
        match store.create_message(msg) {
            Ok(()) => {}
            Err(e @ StoreError::ConversationGone { .. }) => {
                // The conversation was deleted after the response went out.
                // The caller already has its reply; there is nothing to keep.
                info!(conversation = %msg.conversation_id, outcome = %e, "dropping turns");
                return;
            }
            Err(StoreError::DuplicateIdempotencyKey { .. }) => {
                // A racing duplicate already persisted this user turn; the
                // assistant turn may still be missing, so keep going.
                debug!(message = %msg.id, "turn already persisted, skipping");
            }
            Err(e) => {
                error!(message = %msg.id, err = %e, "failed to persist turn");
                return;
            }
        }
    }
}

async fn extract_memories(
    store: &ConversationStore,
    providers: &ProviderSet,
    conversation_id: &str,
    provider: ProviderKind,
    user_text: &str,
    assistant_text: &str,
) {
    let conversation = match store.get_conversation(conversation_id) {
        Ok(c) => c,
        Err(StoreError::ConversationNotFound { .. }) => {
            debug!(conversation = %conversation_id, "conversation gone before memory extraction");
            return;
        }
        Err(e) => {
            warn!(conversation = %conversation_id, err = %e, "memory extraction read failed");
            return;
        }
    };

    let extracted = match providers
        .extract_memories(provider, user_text, assistant_text, &conversation.metadata)
        .await
    {
        Ok(map) => map,
        Err(e) => {
            warn!(conversation = %conversation_id, err = %e, "memory extraction failed");
            return;
        }
    };
    if extracted.is_empty() {
        return;
    }

    // New keys are added; existing keys take the newer value.
    let mut merged = conversation.metadata;
    let count = extracted.len();
    for (key, value) in extracted {
        merged.insert(key, value);
    }

    match store.update_metadata(conversation_id, &merged) {
        Ok(()) => debug!(conversation = %conversation_id, memories = count, "memories merged"),
        Err(StoreError::ConversationNotFound { .. }) => {
            debug!(conversation = %conversation_id, "conversation gone before memory write");
        }
        Err(e) => warn!(conversation = %conversation_id, err = %e, "memory write failed"),
    }
}
