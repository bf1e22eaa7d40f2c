//! Provider trait — the abstraction over LLM backends.
//!
//! A Provider turns an already-budgeted [`Prompt`] into an [`Answer`].
//! Implementations: Anthropic, OpenAI-compatible (OpenAI, OpenRouter, Ollama),
//! Gemini. Each translates its own wire errors into [`ProviderError`].
//! Answers can also be streamed as an [`AnswerStream`] of text deltas.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::context::Prompt;
use crate::error::ProviderError;

/// Which backend and model to talk to, and with what limits.
///
/// Immutable once built. The orchestrator snapshots it per request, so a
/// reconfiguration never affects a request already in flight.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Backend name: "claude", "openai", "gemini", "openrouter", "ollama"
    #[serde(default = "default_provider_name")]
    pub provider_name: String,

    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Name of the environment variable that holds the API key.
    /// The key itself is never stored here.
    #[serde(default = "default_api_key_ref")]
    pub api_key_ref: String,

    /// Total tokens the model accepts (input + output)
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,

    /// Tokens reserved for the answer
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Override the provider's default endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_provider_name() -> String {
    "claude".into()
}
fn default_model_name() -> String {
    "claude-3-5-sonnet-20240620".into()
}
fn default_api_key_ref() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_max_context_tokens() -> usize {
    8192
}
fn default_max_output_tokens() -> usize {
    1024
}
fn default_temperature() -> f32 {
    0.3
}
fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_name: default_provider_name(),
            model_name: default_model_name(),
            api_key_ref: default_api_key_ref(),
            max_context_tokens: default_max_context_tokens(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            api_url: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ProviderConfig {
    /// Tokens available for the prompt itself.
    pub fn input_budget(&self) -> usize {
        self.max_context_tokens.saturating_sub(self.max_output_tokens)
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider_name", &self.provider_name)
            .field("model_name", &self.model_name)
            .field("api_key_ref", &self.api_key_ref)
            .field("max_context_tokens", &self.max_context_tokens)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("temperature", &self.temperature)
            .field("api_url", &self.api_url)
            .finish()
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    #[default]
    Complete,
    /// Hit the output token limit
    Truncated,
    /// Output was cut by the provider's safety filter
    Filtered,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A provider's complete answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

impl Answer {
    pub fn complete(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: FinishReason::Complete,
            usage: Usage::default(),
        }
    }
}

/// One step of a streamed answer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The next slice of answer text
    Delta(String),
    /// Generation finished; nothing follows
    Done {
        finish_reason: FinishReason,
        usage: Usage,
    },
}

/// Receiving end of a streamed answer.
///
/// A well-formed stream yields deltas, then exactly one `Done`. An `Err`
/// item ends the stream early.
pub type AnswerStream = mpsc::Receiver<std::result::Result<StreamEvent, ProviderError>>;

/// Stream an already complete answer as one delta followed by `Done`.
pub fn answer_stream(answer: Answer) -> AnswerStream {
    let (tx, rx) = mpsc::channel(2);
    if !answer.text.is_empty() {
        let _ = tx.try_send(Ok(StreamEvent::Delta(answer.text)));
    }
    let _ = tx.try_send(Ok(StreamEvent::Done {
        finish_reason: answer.finish_reason,
        usage: answer.usage,
    }));
    rx
}

/// The core Provider trait.
///
/// Stateless per call and shared as `Arc<dyn Provider>`. The prompt already
/// respects the context window; adapters never re-truncate it.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "anthropic", "gemini").
    fn name(&self) -> &str;

    /// Send the prompt and wait for the complete answer.
    async fn generate(
        &self,
        prompt: &Prompt,
        config: &ProviderConfig,
    ) -> std::result::Result<Answer, ProviderError>;

    /// Send the prompt and receive the answer as it is produced.
    ///
    /// Errors that happen before the first byte are returned directly and
    /// use the same kinds as [`generate`](Provider::generate). Backends
    /// without streaming deliver the complete answer as a single delta.
    async fn generate_stream(
        &self,
        prompt: &Prompt,
        config: &ProviderConfig,
    ) -> std::result::Result<AnswerStream, ProviderError> {
        Ok(answer_stream(self.generate(prompt, config).await?))
    }

    /// Estimate how many tokens `text` costs with this provider's tokenizer.
    fn estimate_tokens(&self, text: &str) -> usize {
        crate::token::estimate_tokens(text)
    }

    /// Largest total context (input + output) the configured model accepts.
    fn max_context_window(&self) -> usize;
}

/// Builds a provider for a configuration chosen at request time.
///
/// Lets a single turn run against a different backend or model without
/// touching the shared active provider.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, config: &ProviderConfig) -> crate::error::Result<Arc<dyn Provider>>;
}
