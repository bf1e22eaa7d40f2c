//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, and any endpoint exposing
//! `/chat/completions`, with or without SSE streaming. Also serves
//! `/embeddings` for the embedding index.

use std::time::Duration;

use async_trait::async_trait;
use fastrag_core::context::Prompt;
use fastrag_core::embedding::Embedder;
use fastrag_core::error::{IndexError, ProviderError};
use fastrag_core::provider::{Answer, AnswerStream, FinishReason, ProviderConfig, Usage};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::http::{
    SseChunk, build_client, chat_turns, check_status, spawn_sse_reader, status_error,
    transport_error,
};

const DEFAULT_CONTEXT_WINDOW: usize = 128_000;

/// An OpenAI-compatible LLM provider.
///
/// This handles the vast majority of LLM providers since most expose
/// an OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    context_window: usize,
    embedding_model: String,
    embedding_dimensions: usize,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    ///
    /// An empty `api_key` sends no `Authorization` header.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: build_client(Duration::from_secs(120)),
            context_window: DEFAULT_CONTEXT_WINDOW,
            embedding_model: "text-embedding-3-small".into(),
            embedding_dimensions: 1536,
        }
    }

    /// Create an OpenRouter provider (convenience constructor).
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key)
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Create an Ollama provider (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new("ollama", base_url.unwrap_or("http://localhost:11434/v1"), "")
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    /// Model and vector size used when acting as an [`Embedder`].
    pub fn with_embedding_model(mut self, model: impl Into<String>, dimensions: usize) -> Self {
        self.embedding_model = model.into();
        self.embedding_dimensions = dimensions;
        self
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            request
        } else {
            request.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }

    fn request_body(prompt: &Prompt, config: &ProviderConfig) -> serde_json::Value {
        let mut messages = Vec::new();
        let system = prompt.render_system();
        if !system.is_empty() {
            messages.push(ApiMessage {
                role: "system".into(),
                content: system,
            });
        }
        messages.extend(chat_turns(prompt).into_iter().map(|(role, text)| ApiMessage {
            role: role.as_str().into(),
            content: text.into(),
        }));

        serde_json::json!({
            "model": config.model_name,
            "messages": messages,
            "max_tokens": config.max_output_tokens,
            "temperature": config.temperature,
        })
    }

    async fn send(
        &self,
        body: &serde_json::Value,
        config: &ProviderConfig,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .header("Content-Type", "application/json")
            .json(body);
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        check_status(&self.name, response).await
    }

    fn to_answer(&self, resp: ApiResponse) -> Result<Answer, ProviderError> {
        let choice = resp.choices.into_iter().next().ok_or_else(|| {
            ProviderError::Unavailable(format!("{} returned no choices", self.name))
        })?;

        let finish_reason = finish_reason(choice.finish_reason.as_deref());
        let text = choice.message.content.unwrap_or_default();

        if finish_reason == FinishReason::Filtered && text.is_empty() {
            return Err(ProviderError::ContentRejected(format!(
                "{} filtered the response",
                self.name
            )));
        }

        Ok(Answer {
            text,
            finish_reason,
            usage: resp
                .usage
                .map(|u| Usage {
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                })
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl fastrag_core::Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        prompt: &Prompt,
        config: &ProviderConfig,
    ) -> std::result::Result<Answer, ProviderError> {
        let body = Self::request_body(prompt, config);

        debug!(provider = %self.name, model = %config.model_name, "Sending generation request");

        let response = self.send(&body, config).await?;
        let api_resp: ApiResponse = response
            .json()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        self.to_answer(api_resp)
    }

    async fn generate_stream(
        &self,
        prompt: &Prompt,
        config: &ProviderConfig,
    ) -> std::result::Result<AnswerStream, ProviderError> {
        let mut body = Self::request_body(prompt, config);
        body["stream"] = serde_json::json!(true);
        body["stream_options"] = serde_json::json!({ "include_usage": true });

        debug!(provider = %self.name, model = %config.model_name, "Sending streaming request");

        let response = self.send(&body, config).await?;
        let name = self.name.clone();
        Ok(spawn_sse_reader(&self.name, response, move |data| {
            parse_stream_chunk(&name, data)
        }))
    }

    fn max_context_window(&self) -> usize {
        self.context_window
    }
}

#[async_trait]
impl Embedder for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.embedding_dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.embedding_model,
            "input": texts,
            "encoding_format": "float",
        });

        debug!(
            provider = %self.name,
            model = %self.embedding_model,
            count = texts.len(),
            "Sending embedding request"
        );

        let failed = |e: ProviderError| IndexError::EmbeddingComputationFailed(e.to_string());

        let request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| failed(transport_error(&self.name, e)))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let error_body = response.text().await.unwrap_or_default();
            return Err(failed(status_error(&self.name, status, None, &error_body)));
        }

        let mut api_resp: EmbeddingApiResponse = response
            .json()
            .await
            .map_err(|e| failed(transport_error(&self.name, e)))?;

        if api_resp.data.len() != texts.len() {
            return Err(IndexError::EmbeddingComputationFailed(format!(
                "{} returned {} embeddings for {} inputs",
                self.name,
                api_resp.data.len(),
                texts.len()
            )));
        }
        api_resp.data.sort_by_key(|d| d.index);

        let embeddings: Vec<Vec<f32>> = api_resp.data.into_iter().map(|d| d.embedding).collect();
        if let Some(bad) = embeddings.iter().find(|e| e.len() != self.embedding_dimensions) {
            return Err(IndexError::DimensionMismatch {
                expected: self.embedding_dimensions,
                actual: bad.len(),
            });
        }
        Ok(embeddings)
    }
}

fn finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Truncated,
        Some("content_filter") => FinishReason::Filtered,
        _ => FinishReason::Complete,
    }
}

/// One `data:` payload of a streamed chat completion.
fn parse_stream_chunk(provider: &str, data: &str) -> Result<SseChunk, ProviderError> {
    let chunk: StreamResponse = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            trace!(provider, error = %e, "Ignoring unparseable SSE chunk");
            return Ok(SseChunk::default());
        }
    };
    if let Some(error) = chunk.error {
        return Err(ProviderError::Unavailable(format!("{provider} stream failed: {error}")));
    }

    let choice = chunk.choices.into_iter().next();
    let (text, reason) = match choice {
        Some(choice) => (choice.delta.content, choice.finish_reason),
        None => (None, None),
    };
    Ok(SseChunk {
        text,
        finish_reason: reason.as_deref().map(|r| finish_reason(Some(r))),
        prompt_tokens: chunk.usage.as_ref().map(|u| u.prompt_tokens),
        completion_tokens: chunk.usage.as_ref().map(|u| u.completion_tokens),
        done: false,
    })
}

// ── OpenAI API types ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}
