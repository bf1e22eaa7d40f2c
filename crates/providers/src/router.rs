//! Provider router: selects the LLM provider and embedder from configuration.
//!
//! The variant is chosen once, when the configuration is applied. Nothing
//! downstream inspects responses to decide which backend it talks to.

use std::sync::Arc;

use fastrag_config::{ConfigError, EmbeddingConfig, RetryConfig, resolve_api_key_with};
use fastrag_core::embedding::Embedder;
use fastrag_core::provider::{Provider, ProviderConfig, ProviderFactory};
use fastrag_memory::HashEmbedder;
use tracing::info;

use crate::anthropic::AnthropicProvider;
use crate::gemini::GeminiProvider;
use crate::models;
use crate::openai_compat::OpenAiCompatProvider;
use crate::retry::{RetryPolicy, RetryingProvider};

/// Build the provider named by `config.provider_name`, resolving its key from
/// the process environment.
pub fn build_from_config(config: &ProviderConfig) -> Result<Arc<dyn Provider>, ConfigError> {
    build_from_config_with(config, |key| std::env::var(key).ok())
}

/// Like [`build_from_config`], with keys looked up through `env`.
pub fn build_from_config_with(
    config: &ProviderConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Arc<dyn Provider>, ConfigError> {
    let name = config.provider_name.trim().to_lowercase();
    let api_key = resolve_api_key_with(&config.api_key_ref, env)?;
    let context_window =
        models::context_window(&config.model_name).unwrap_or(config.max_context_tokens);
    let base_url = config
        .api_url
        .clone()
        .unwrap_or_else(|| default_base_url(&name).to_string());

    let provider: Arc<dyn Provider> = match name.as_str() {
        "claude" | "anthropic" => Arc::new(
            AnthropicProvider::new(api_key)
                .with_base_url(base_url)
                .with_context_window(context_window),
        ),
        "gemini" | "google" => Arc::new(
            GeminiProvider::new(api_key)
                .with_base_url(base_url)
                .with_context_window(context_window),
        ),
        "openai" | "openrouter" | "ollama" => Arc::new(
            OpenAiCompatProvider::new(name.as_str(), base_url, api_key)
                .with_context_window(context_window),
        ),
        other => {
            return Err(ConfigError::ValidationError(format!(
                "Unknown provider: {other:?} (expected claude, openai, openrouter, ollama or gemini)"
            )));
        }
    };

    info!(
        provider = %provider.name(),
        model = %config.model_name,
        context_window,
        "Provider configured"
    );
    Ok(provider)
}

/// Build the configured provider wrapped in a [`RetryingProvider`].
pub fn build_with_retry(
    config: &ProviderConfig,
    retry: &RetryConfig,
) -> Result<Arc<dyn Provider>, ConfigError> {
    let inner = build_from_config(config)?;
    Ok(Arc::new(RetryingProvider::new(inner, RetryPolicy::from(retry))))
}

/// Builds retrying providers on demand, for turns that override the
/// configured backend or model.
#[derive(Debug, Clone, Default)]
pub struct RouterFactory {
    retry: RetryConfig,
}

impl RouterFactory {
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }
}

impl ProviderFactory for RouterFactory {
    fn build(&self, config: &ProviderConfig) -> fastrag_core::Result<Arc<dyn Provider>> {
        build_with_retry(config, &self.retry).map_err(|e| fastrag_core::Error::Config {
            message: e.to_string(),
        })
    }
}

/// Build the embedder named by `config.provider`.
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, ConfigError> {
    build_embedder_with(config, |key| std::env::var(key).ok())
}

pub fn build_embedder_with(
    config: &EmbeddingConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Arc<dyn Embedder>, ConfigError> {
    match config.provider.trim().to_lowercase().as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dimensions))),
        "openai" => {
            let api_key = resolve_api_key_with(&config.api_key_ref, env)?;
            let base_url = config
                .api_url
                .clone()
                .unwrap_or_else(|| default_base_url("openai").to_string());
            Ok(Arc::new(
                OpenAiCompatProvider::new("openai", base_url, api_key)
                    .with_embedding_model(config.model.as_str(), config.dimensions),
            ))
        }
        other => Err(ConfigError::ValidationError(format!(
            "Unknown embedding provider: {other:?} (expected hash or openai)"
        ))),
    }
}

/// Get the default base URL for well-known providers.
pub fn default_base_url(provider_name: &str) -> &'static str {
    match provider_name {
        "openai" => "https://api.openai.com/v1",
        "openrouter" => "https://openrouter.ai/api/v1",
        "ollama" => "http://localhost:11434/v1",
        "gemini" | "google" => crate::gemini::DEFAULT_BASE_URL,
        _ => crate::anthropic::DEFAULT_BASE_URL,
    }
}
