use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use confab_core::config::OpenAiConfig;

use crate::provider::{
    parse_flat_map, ChatProvider, GenerateReply, GenerateRequest, ProviderError,
};

/// System prompt for the memory-extraction call, shared by both providers.
pub(crate) const EXTRACT_SYSTEM: &str = "You maintain long-term memory for a \
conversational assistant. From the latest exchange, extract durable facts \
about the user as a flat JSON object with string keys. Re-state an existing \
key only when its value changed. Respond with the JSON object only.";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(cfg: &OpenAiConfig) -> Self {
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
            .json(&body)
            .send()
            .await?;
        read_chat_response("openai", resp).await
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateReply, ProviderError> {
        debug!(model = %self.model, history = req.history.len(), "sending request to OpenAI");
        self.chat(chat_body(&self.model, req)).await
    }

    async fn transcribe(&self, audio_url: &str) -> Result<String, ProviderError> {
        let url = format!("{}/v1/audio/transcriptions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&serde_json::json!({ "model": "whisper-1", "url": audio_url }))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            return Err(ProviderError::RateLimited {
                retry_after_ms: resp_retry_after(Some(&resp)),
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "OpenAI transcription error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }
        let parsed: TranscriptionResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(parsed.text)
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
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
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

/// Build a chat-completions body. OpenAI uses a flat messages array; the
/// system prompt is the leading system message, history follows oldest-first,
/// and the current turn comes last (with image parts when media is present).
pub(crate) fn chat_body(model: &str, req: &GenerateRequest) -> serde_json::Value {
    let mut messages = vec![serde_json::json!({
        "role": "system",
        "content": req.system,
    })];

    for turn in &req.history {
        messages.push(serde_json::json!({
            "role": turn.role,
            "content": turn.content,
        }));
    }

    if req.media_urls.is_empty() {
        messages.push(serde_json::json!({
            "role": "user",
            "content": req.current,
        }));
    } else {
        let mut parts = vec![serde_json::json!({ "type": "text", "text": req.current })];
        for url in &req.media_urls {
            parts.push(serde_json::json!({
                "type": "image_url",
                "image_url": { "url": url },
            }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": parts }));
    }

    serde_json::json!({
        "model": model,
        "messages": messages,
        "max_tokens": req.max_tokens,
    })
}

/// Build the memory-extraction body (a plain chat call with a fixed task).
pub(crate) fn extract_body(
    model: &str,
    user_text: &str,
    assistant_text: &str,
    existing: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Value {
    let existing_json =
        serde_json::to_string(existing).unwrap_or_else(|_| "{}".to_string());
    let task = format!(
        "Existing memories: {existing_json}\n\nUser: {user_text}\n\nAssistant: {assistant_text}"
    );
    serde_json::json!({
        "model": model,
        "messages": [
            { "role": "system", "content": EXTRACT_SYSTEM },
            { "role": "user", "content": task },
        ],
        "max_tokens": 512,
    })
}

/// Map a chat-completions HTTP response to a reply or a typed error.
pub(crate) async fn read_chat_response(
    provider: &str,
    resp: reqwest::Response,
) -> Result<GenerateReply, ProviderError> {
    let status = resp.status().as_u16();
    if status == 429 {
        let retry = resp_retry_after(Some(&resp));
        return Err(ProviderError::RateLimited {
            retry_after_ms: retry,
        });
    }

    if !resp.status().is_success() {
        let text = resp.text().await.unwrap_or_default();
        warn!(provider, status, body = %text, "chat API error");
        return Err(ProviderError::Api {
            status,
            message: text,
        });
    }

    let api_resp: ApiResponse = resp
        .json()
        .await
        .map_err(|e| ProviderError::Parse(e.to_string()))?;

    let content = api_resp
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();

    Ok(GenerateReply {
        content,
        token_count: api_resp
            .usage
            .as_ref()
            .map(|u| u.completion_tokens)
            .unwrap_or(0),
    })
}

fn resp_retry_after(resp: Option<&reqwest::Response>) -> u64 {
    resp.and_then(|r| r.headers().get("retry-after"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|s| s * 1000)
        .unwrap_or(5000)
}

// OpenAI-compatible API response types (deserialization only).

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatTurn;
    use confab_core::types::Role;

    fn request(media: Vec<String>) -> GenerateRequest {
        GenerateRequest {
            system: "Be brief.".into(),
            history: vec![
                ChatTurn {
                    role: Role::User,
                    content: "earlier question".into(),
                },
                ChatTurn {
                    role: Role::Assistant,
                    content: "earlier answer".into(),
                },
            ],
            current: "what now?".into(),
            media_urls: media,
            max_tokens: 256,
        }
    }

    #[test]
    fn body_orders_system_history_current() {
        let body = chat_body("gpt-4o-mini", &request(vec![]));
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "earlier question");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["content"], "what now?");
        assert_eq!(body["max_tokens"], 256);
    }

    #[test]
    fn current_turn_media_becomes_image_parts() {
        let body = chat_body(
            "gpt-4o-mini",
            &request(vec!["https://cdn.example/img.png".into()]),
        );
        let last = body["messages"].as_array().unwrap().last().unwrap().clone();
        let parts = last["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["image_url"]["url"], "https://cdn.example/img.png");
    }

    #[test]
    fn extract_body_includes_existing_map() {
        let mut existing = serde_json::Map::new();
        existing.insert("pet".into(), serde_json::json!("cat"));
        let body = extract_body("gpt-4o-mini", "I got a dog", "Congrats!", &existing);
        let task = body["messages"][1]["content"].as_str().unwrap();
        assert!(task.contains("\"pet\":\"cat\""));
        assert!(task.contains("I got a dog"));
    }
}
