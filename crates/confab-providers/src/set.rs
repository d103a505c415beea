use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use confab_core::config::ConfabConfig;
use confab_core::error::ConfigError;

use crate::breaker::CircuitBreaker;
use crate::openai::OpenAiProvider;
use crate::openrouter::OpenRouterProvider;
use crate::provider::{ChatProvider, GenerateReply, GenerateRequest, ProviderError};

/// Which of the two generation providers a call is routed to. Resolved once
/// per send from the persona's content classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Primary,
    Alternate,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Primary => f.write_str("primary"),
            ProviderKind::Alternate => f.write_str("alternate"),
        }
    }
}

/// The two interchangeable generation providers plus their breakers.
///
/// Long-lived service object: constructed once at startup and shared by
/// reference, so breaker state spans all in-flight sends. All provider
/// traffic funnels through the guarded methods here; nothing else calls a
/// provider directly.
pub struct ProviderSet {
    primary: Arc<dyn ChatProvider>,
    alternate: Option<Arc<dyn ChatProvider>>,
    primary_breaker: CircuitBreaker,
    alternate_breaker: CircuitBreaker,
    call_timeout: Duration,
    retry_attempts: u32,
}

impl ProviderSet {
    pub fn new(
        primary: Arc<dyn ChatProvider>,
        alternate: Option<Arc<dyn ChatProvider>>,
        failure_threshold: u32,
        breaker_timeout: Duration,
        call_timeout: Duration,
        retry_attempts: u32,
    ) -> Self {
        let primary_breaker =
            CircuitBreaker::new(primary.name(), failure_threshold, breaker_timeout);
        let alternate_name = alternate.as_ref().map(|p| p.name()).unwrap_or("alternate");
        let alternate_breaker =
            CircuitBreaker::new(alternate_name, failure_threshold, breaker_timeout);
        Self {
            primary,
            alternate,
            primary_breaker,
            alternate_breaker,
            call_timeout,
            retry_attempts,
        }
    }

    /// Build the concrete OpenAI/OpenRouter pair from config.
    pub fn from_config(cfg: &ConfabConfig) -> Result<Self, ConfigError> {
        let openai = cfg
            .providers
            .openai
            .as_ref()
            .ok_or_else(|| ConfigError::MissingProvider("openai".to_string()))?;
        let primary: Arc<dyn ChatProvider> = Arc::new(OpenAiProvider::new(openai));
        let alternate: Option<Arc<dyn ChatProvider>> = cfg
            .providers
            .openrouter
            .as_ref()
            .map(|c| Arc::new(OpenRouterProvider::new(c)) as Arc<dyn ChatProvider>);
        Ok(Self::new(
            primary,
            alternate,
            cfg.pipeline.breaker_failure_threshold,
            Duration::from_secs(cfg.pipeline.breaker_timeout_secs),
            Duration::from_secs(cfg.pipeline.provider_timeout_secs),
            cfg.pipeline.retry_attempts,
        ))
    }

    /// Route a persona's traffic. Restricted personas use the alternate
    /// provider; when none is configured they fall back to the default.
    pub fn select(&self, restricted: bool) -> ProviderKind {
        if restricted {
            if self.alternate.is_some() {
                return ProviderKind::Alternate;
            }
            debug!("alternate provider unconfigured, routing restricted persona to default");
        }
        ProviderKind::Primary
    }

    pub fn breaker(&self, kind: ProviderKind) -> &CircuitBreaker {
        match kind {
            ProviderKind::Primary => &self.primary_breaker,
            ProviderKind::Alternate if self.alternate.is_some() => &self.alternate_breaker,
            ProviderKind::Alternate => &self.primary_breaker,
        }
    }

    fn provider(&self, kind: ProviderKind) -> &Arc<dyn ChatProvider> {
        match kind {
            ProviderKind::Primary => &self.primary,
            ProviderKind::Alternate => self.alternate.as_ref().unwrap_or(&self.primary),
        }
    }

    /// Generate a reply through the breaker, with per-attempt timeouts and
    /// exponential backoff on transient errors. One breaker outcome is
    /// recorded for the whole guarded call, however many attempts it took.
    pub async fn generate(
        &self,
        kind: ProviderKind,
        req: &GenerateRequest,
    ) -> Result<GenerateReply, ProviderError> {
        let provider = self.provider(kind);
        let breaker = self.breaker(kind);
        breaker.try_acquire()?;

        let mut last_err: Option<ProviderError> = None;
        for attempt in 0..=self.retry_attempts {
            let outcome = timeout(self.call_timeout, provider.generate(req)).await;
            match outcome {
                Ok(Ok(reply)) => {
                    if attempt > 0 {
                        info!(provider = %provider.name(), attempt, "generate succeeded after retry");
                    }
                    breaker.record_success();
                    return Ok(reply);
                }
                Ok(Err(e)) => {
                    warn!(provider = %provider.name(), attempt, err = %e, "generate failed");
                    let transient = e.is_transient();
                    last_err = Some(e);
                    if !transient {
                        break;
                    }
                }
                Err(_) => {
                    let ms = self.call_timeout.as_millis() as u64;
                    warn!(provider = %provider.name(), attempt, ms, "generate timed out");
                    last_err = Some(ProviderError::Timeout { ms });
                }
            }

            if attempt < self.retry_attempts {
                // TODO: honor retry_after_ms from RateLimited instead of the
                // fixed schedule.
                tokio::time::sleep(Duration::from_millis(200u64 << attempt)).await;
            }
        }

        breaker.record_failure();
        Err(last_err
            .unwrap_or_else(|| ProviderError::Unavailable("provider call failed".to_string())))
    }

    /// Breaker-guarded single-attempt transcription.
    pub async fn transcribe(
        &self,
        kind: ProviderKind,
        audio_url: &str,
    ) -> Result<String, ProviderError> {
        let provider = self.provider(kind);
        let breaker = self.breaker(kind);
        breaker.try_acquire()?;

        match timeout(self.call_timeout, provider.transcribe(audio_url)).await {
            Ok(Ok(text)) => {
                breaker.record_success();
                Ok(text)
            }
            Ok(Err(e)) => {
                breaker.record_failure();
                Err(e)
            }
            Err(_) => {
                breaker.record_failure();
                Err(ProviderError::Timeout {
                    ms: self.call_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Breaker-guarded single-attempt memory extraction.
    pub async fn extract_memories(
        &self,
        kind: ProviderKind,
        user_text: &str,
        assistant_text: &str,
        existing: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Map<String, serde_json::Value>, ProviderError> {
        let provider = self.provider(kind);
        let breaker = self.breaker(kind);
        breaker.try_acquire()?;

        let fut = provider.extract_memories(user_text, assistant_text, existing);
        match timeout(self.call_timeout, fut).await {
            Ok(Ok(map)) => {
                breaker.record_success();
                Ok(map)
            }
            Ok(Err(e)) => {
                breaker.record_failure();
                Err(e)
            }
            Err(_) => {
                breaker.record_failure();
                Err(ProviderError::Timeout {
                    ms: self.call_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Liveness probe for a provider, unguarded: the probe itself must not
    /// consume the half-open trial slot.
    pub async fn health_check(&self, kind: ProviderKind) -> Result<(), ProviderError> {
        self.provider(kind).health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProvider {
        name: &'static str,
        calls: AtomicU32,
        fail_with: Option<fn() -> ProviderError>,
    }

    impl CountingProvider {
        fn ok(name: &'static str) -> Self {
            Self {
                name,
                calls: AtomicU32::new(0),
                fail_with: None,
            }
        }

        fn failing(name: &'static str, err: fn() -> ProviderError) -> Self {
            Self {
                name,
                calls: AtomicU32::new(0),
                fail_with: Some(err),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatProvider for CountingProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn generate(&self, _req: &GenerateRequest) -> Result<GenerateReply, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(err) => Err(err()),
                None => Ok(GenerateReply {
                    content: "ok".to_string(),
                    token_count: 1,
                }),
            }
        }

        async fn transcribe(&self, _audio_url: &str) -> Result<String, ProviderError> {
            Ok("transcript".to_string())
        }

        async fn extract_memories(
            &self,
            _user_text: &str,
            _assistant_text: &str,
            _existing: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<serde_json::Map<String, serde_json::Value>, ProviderError> {
            Ok(serde_json::Map::new())
        }

        async fn health_check(&self) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn set_with(
        primary: Arc<CountingProvider>,
        alternate: Option<Arc<CountingProvider>>,
        retry_attempts: u32,
    ) -> ProviderSet {
        ProviderSet::new(
            primary as Arc<dyn ChatProvider>,
            alternate.map(|p| p as Arc<dyn ChatProvider>),
            3,
            Duration::from_secs(60),
            Duration::from_secs(5),
            retry_attempts,
        )
    }

    fn request() -> GenerateRequest {
        GenerateRequest {
            system: "test".into(),
            history: Vec::new(),
            current: "hello".into(),
            media_urls: Vec::new(),
            max_tokens: 64,
        }
    }

    #[test]
    fn restricted_routes_to_alternate_when_configured() {
        let set = set_with(
            Arc::new(CountingProvider::ok("p")),
            Some(Arc::new(CountingProvider::ok("a"))),
            0,
        );
        assert_eq!(set.select(true), ProviderKind::Alternate);
        assert_eq!(set.select(false), ProviderKind::Primary);
    }

    #[test]
    fn restricted_falls_back_without_alternate() {
        let set = set_with(Arc::new(CountingProvider::ok("p")), None, 0);
        assert_eq!(set.select(true), ProviderKind::Primary);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let primary = Arc::new(CountingProvider::failing("p", || ProviderError::Api {
            status: 503,
            message: "overloaded".into(),
        }));
        let set = set_with(Arc::clone(&primary), None, 2);

        let err = set.generate(ProviderKind::Primary, &request()).await;
        assert!(err.is_err());
        assert_eq!(primary.calls(), 3); // first attempt + 2 retries
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let primary = Arc::new(CountingProvider::failing("p", || ProviderError::Api {
            status: 400,
            message: "bad request".into(),
        }));
        let set = set_with(Arc::clone(&primary), None, 2);

        let err = set.generate(ProviderKind::Primary, &request()).await;
        assert!(err.is_err());
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_count_as_one_breaker_failure() {
        let primary = Arc::new(CountingProvider::failing("p", || {
            ProviderError::Unavailable("down".into())
        }));
        let set = set_with(Arc::clone(&primary), None, 2);

        let _ = set.generate(ProviderKind::Primary, &request()).await;
        assert_eq!(set.breaker(ProviderKind::Primary).consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn open_breaker_rejects_without_calling_provider() {
        let primary = Arc::new(CountingProvider::failing("p", || {
            ProviderError::Unavailable("down".into())
        }));
        let set = set_with(Arc::clone(&primary), None, 0);

        for _ in 0..3 {
            let _ = set.generate(ProviderKind::Primary, &request()).await;
        }
        assert_eq!(set.breaker(ProviderKind::Primary).state(), CircuitState::Open);
        let calls_before = primary.calls();

        let err = set.generate(ProviderKind::Primary, &request()).await;
        assert!(matches!(err, Err(ProviderError::BreakerOpen { .. })));
        assert_eq!(primary.calls(), calls_before);
    }

    #[tokio::test]
    async fn health_check_passes_through_unguarded() {
        let primary = Arc::new(CountingProvider::failing("p", || {
            ProviderError::Unavailable("down".into())
        }));
        let set = set_with(Arc::clone(&primary), None, 0);
        // Trip the breaker; the probe must still reach the provider.
        for _ in 0..3 {
            let _ = set.generate(ProviderKind::Primary, &request()).await;
        }
        assert!(set.health_check(ProviderKind::Primary).await.is_ok());
    }

    #[tokio::test]
    async fn success_flows_through() {
        let primary = Arc::new(CountingProvider::ok("p"));
        let set = set_with(Arc::clone(&primary), None, 2);

        let reply = set.generate(ProviderKind::Primary, &request()).await.unwrap();
        assert_eq!(reply.content, "ok");
        assert_eq!(primary.calls(), 1);
        assert_eq!(set.breaker(ProviderKind::Primary).state(), CircuitState::Closed);
    }
}
