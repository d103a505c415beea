use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level config (confab.toml + CONFAB_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfabConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for ConfabConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            providers: ProvidersConfig::default(),
            pipeline: PipelineConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    /// Default generation provider.
    pub openai: Option<OpenAiConfig>,
    /// Alternate provider used for restricted personas. Optional; when
    /// absent, restricted traffic falls back to the default provider.
    pub openrouter: Option<OpenRouterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    pub api_key: String,
    #[serde(default = "default_openrouter_base_url")]
    pub base_url: String,
    #[serde(default = "default_openrouter_model")]
    pub model: String,
}

/// Token-estimation strategy, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EstimatorKind {
    /// Word-based approximation (~4 tokens per 3 words).
    Wordpiece,
    /// Character heuristic: length / 3.
    Chars,
}

/// Knobs for the send pipeline: budgets, retries, breakers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Configured max-output tokens of the provider; the input budget is
    /// derived from this (see the context assembler).
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// How many prior turns context assembly will consider.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    /// Per-attempt provider call timeout.
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    /// Extra attempts after the first, transient errors only.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Consecutive failures before a provider's breaker opens.
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    /// Seconds an open breaker rejects calls before allowing a trial.
    #[serde(default = "default_breaker_timeout_secs")]
    pub breaker_timeout_secs: u64,
    #[serde(default = "default_estimator")]
    pub estimator: EstimatorKind,
    /// Cap on media attachments forwarded for the current turn.
    #[serde(default = "default_max_turn_media")]
    pub max_turn_media: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_output_tokens: default_max_output_tokens(),
            history_turns: default_history_turns(),
            provider_timeout_secs: default_provider_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_timeout_secs: default_breaker_timeout_secs(),
            estimator: default_estimator(),
            max_turn_media: default_max_turn_media(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Turn lists expire this many seconds after the last push.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Bounded list length per conversation.
    #[serde(default = "default_cache_max_turns")]
    pub max_turns: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            max_turns: default_cache_max_turns(),
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.confab/confab.db", home)
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_openrouter_base_url() -> String {
    "https://openrouter.ai/api".to_string()
}
fn default_openrouter_model() -> String {
    "openai/gpt-4o".to_string()
}
fn default_max_output_tokens() -> u32 {
    4096
}
fn default_history_turns() -> usize {
    10
}
fn default_provider_timeout_secs() -> u64 {
    30
}
fn default_retry_attempts() -> u32 {
    2
}
fn default_breaker_failure_threshold() -> u32 {
    5
}
fn default_breaker_timeout_secs() -> u64 {
    60
}
fn default_estimator() -> EstimatorKind {
    EstimatorKind::Wordpiece
}
fn default_max_turn_media() -> usize {
    4
}
fn default_cache_ttl_secs() -> u64 {
    3600
}
fn default_cache_max_turns() -> usize {
    50
}

impl ConfabConfig {
    /// Load config from a TOML file with CONFAB_* env var overrides.
    ///
    /// Checks the explicit path argument first, then ~/.confab/confab.toml.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ConfabConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CONFAB_").split("_"))
            .extract()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.confab/confab.toml", home)
}
