use async_trait::async_trait;

use confab_core::types::Role;

/// One prior turn forwarded to a provider, oldest-first in the request.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Request to a generation provider.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// System instructions (already budget-trimmed by the caller).
    pub system: String,
    /// Trimmed history, oldest-first. Media from prior turns is never
    /// re-sent.
    pub history: Vec<ChatTurn>,
    /// The current user turn.
    pub current: String,
    /// Resolved media URLs for the current turn only.
    pub media_urls: Vec<String>,
    pub max_tokens: u32,
}

/// Response from a generation provider.
#[derive(Debug, Clone)]
pub struct GenerateReply {
    pub content: String,
    /// Provider-reported completion token count.
    pub token_count: u32,
}

/// Common interface for the two interchangeable generation providers.
///
/// Capability-equivalent by contract: generation, audio transcription,
/// memory extraction and a liveness probe. Which one handles a given send is
/// decided per call by `ProviderSet::select`.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateReply, ProviderError>;

    /// Transcribe the audio behind a resolved URL to text.
    async fn transcribe(&self, audio_url: &str) -> Result<String, ProviderError>;

    /// Mine durable facts from the latest exchange as a flat key-value
    /// object. `existing` is passed so the model can revise stale values.
    async fn extract_memories(
        &self,
        user_text: &str,
        assistant_text: &str,
        existing: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Map<String, serde_json::Value>, ProviderError>;

    async fn health_check(&self) -> Result<(), ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Circuit breaker open for {provider}")]
    BreakerOpen { provider: String },
}

impl ProviderError {
    /// Transient failures worth retrying: network errors, timeouts,
    /// rate limits, 5xx. Validation-style 4xx responses and malformed
    /// payloads are not, since a retry would just repeat them.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(_)
            | ProviderError::Timeout { .. }
            | ProviderError::RateLimited { .. }
            | ProviderError::Unavailable(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::Parse(_) | ProviderError::BreakerOpen { .. } => false,
        }
    }
}

/// Parse a provider's memory-extraction reply into a flat map.
///
/// Models wrap JSON in markdown fences often enough that we strip them
/// before parsing. Anything that is not a JSON object is a parse error.
pub(crate) fn parse_flat_map(
    content: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, ProviderError> {
    let trimmed = content.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed).trim();

    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(ProviderError::Parse(format!(
            "expected a JSON object of memories, got {}",
            value_kind(&other)
        ))),
        Err(e) => Err(ProviderError::Parse(e.to_string())),
    }
}

fn value_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a bool",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Timeout { ms: 1000 }.is_transient());
        assert!(ProviderError::RateLimited { retry_after_ms: 500 }.is_transient());
        assert!(ProviderError::Api {
            status: 503,
            message: "overloaded".into()
        }
        .is_transient());
        assert!(!ProviderError::Api {
            status: 400,
            message: "bad request".into()
        }
        .is_transient());
        assert!(!ProviderError::Parse("junk".into()).is_transient());
        assert!(!ProviderError::BreakerOpen {
            provider: "openai".into()
        }
        .is_transient());
    }

    #[test]
    fn flat_map_parses_with_and_without_fences() {
        let plain = parse_flat_map(r#"{"likes": "tea"}"#).unwrap();
        assert_eq!(plain["likes"], "tea");

        let fenced = parse_flat_map("```json\n{\"city\": \"Oslo\"}\n```").unwrap();
        assert_eq!(fenced["city"], "Oslo");

        assert!(parse_flat_map("[1, 2]").is_err());
        assert!(parse_flat_map("not json").is_err());
    }
}
