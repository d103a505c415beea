use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("media reference could not be resolved: {0}")]
pub struct MediaError(pub String);

/// Resolves opaque media references to fetchable URLs.
///
/// The object-storage integration behind this lives outside the pipeline;
/// this seam is all the orchestrator needs. Unresolvable references are
/// dropped from the outgoing request, never fatal.
#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve(&self, media_ref: &str) -> Result<String, MediaError>;
}

/// Treats references as already-fetchable URLs. Used in local setups and
/// tests where no object store is wired in.
pub struct PassthroughResolver;

#[async_trait]
impl MediaResolver for PassthroughResolver {
    async fn resolve(&self, media_ref: &str) -> Result<String, MediaError> {
        Ok(media_ref.to_string())
    }
}
