use async_trait::async_trait;
use tracing::debug;

use confab_core::config::OpenRouterConfig;

use crate::openai::{chat_body, extract_body, read_chat_response};
use crate::provider::{
    parse_flat_map, ChatProvider, GenerateReply, GenerateRequest, ProviderError,
};

/// Alternate generation provider, used for restricted personas.
///
/// OpenRouter speaks the OpenAI chat-completions dialect, so the wire
/// bodies are shared with `OpenAiProvider`; only the endpoint, auth headers
/// and capability gaps differ.
pub struct OpenRouterProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenRouterProvider {
    pub fn new(cfg: &OpenRouterConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: cfg.api_key.clone(),
            base_url: cfg.base_url.clone(),
            model: cfg.model.clone(),
        }
    }

    async fn chat(&self, body: serde_json::Value) -> Result<GenerateReply, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .header("x-title", "confab")
            .json(&body)
            .send()
            .await?;
        read_chat_response("openrouter", resp).await
    }
}

#[async_trait]
impl ChatProvider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateReply, ProviderError> {
        debug!(model = %self.model, history = req.history.len(), "sending request to OpenRouter");
        self.chat(chat_body(&self.model, req)).await
    }

    /// OpenRouter has no transcription endpoint; restricted-persona audio
    /// degrades the same way any transcription failure does.
    async fn transcribe(&self, _audio_url: &str) -> Result<String, ProviderError> {
        Err(ProviderError::Unavailable(
            "openrouter does not transcribe audio".to_string(),
        ))
    }

    async fn extract_memories(
        &self,
        user_text: &str,
        assistant_text: &str,
        existing: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Map<String, serde_json::Value>, ProviderError> {
        let body = extract_body(&self.model, user_text, assistant_text, existing);
        let reply = self.chat(body).await?;
        parse_flat_map(&reply.content)
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let url = format!("{}/v1/models", self.base_url);
        let resp = self.client.get(&url).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::Api {
                status: resp.status().as_u16(),
                message: "health check failed".to_string(),
            })
        }
    }
}
