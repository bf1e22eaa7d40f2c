//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly (not OpenAI-compatible proxy).
//!
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt (preamble + retrieved context) as a top-level field
//! - Typed SSE events when streaming

use std::time::Duration;

use async_trait::async_trait;
use fastrag_core::context::Prompt;
use fastrag_core::error::ProviderError;
use fastrag_core::provider::{Answer, AnswerStream, FinishReason, ProviderConfig, Usage};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::http::{SseChunk, build_client, chat_turns, check_status, spawn_sse_reader, transport_error};

const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_CONTEXT_WINDOW: usize = 200_000;

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    context_window: usize,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client: build_client(Duration::from_secs(300)),
            context_window: DEFAULT_CONTEXT_WINDOW,
        }
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    fn request_body(prompt: &Prompt, config: &ProviderConfig) -> serde_json::Value {
        let messages: Vec<AnthropicMessage> = chat_turns(prompt)
            .into_iter()
            .map(|(role, text)| AnthropicMessage {
                role: role.as_str().into(),
                content: text.into(),
            })
            .collect();

        let mut body = serde_json::json!({
            "model": config.model_name,
            "messages": messages,
            "max_tokens": config.max_output_tokens,
            "temperature": config.temperature,
        });

        let system = prompt.render_system();
        if !system.is_empty() {
            body["system"] = serde_json::json!(system);
        }
        body
    }

    async fn send(
        &self,
        body: &serde_json::Value,
        config: &ProviderConfig,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        check_status(&self.name, response).await
    }

    fn to_answer(resp: AnthropicResponse) -> Result<Answer, ProviderError> {
        let text: String = resp
            .content
            .iter()
            .filter(|b| b.r#type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect();

        let finish_reason = stop_reason(resp.stop_reason.as_deref());

        if finish_reason == FinishReason::Filtered && text.is_empty() {
            return Err(ProviderError::ContentRejected(
                "anthropic refused to answer".into(),
            ));
        }

        Ok(Answer {
            text,
            finish_reason,
            usage: resp
                .usage
                .map(|u| Usage {
                    prompt_tokens: u.input_tokens,
                    completion_tokens: u.output_tokens,
                })
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl fastrag_core::Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        prompt: &Prompt,
        config: &ProviderConfig,
    ) -> std::result::Result<Answer, ProviderError> {
        let body = Self::request_body(prompt, config);

        debug!(provider = "anthropic", model = %config.model_name, "Sending generation request");

        let response = self.send(&body, config).await?;

        let api_resp: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        Self::to_answer(api_resp)
    }

    async fn generate_stream(
        &self,
        prompt: &Prompt,
        config: &ProviderConfig,
    ) -> std::result::Result<AnswerStream, ProviderError> {
        let mut body = Self::request_body(prompt, config);
        body["stream"] = serde_json::json!(true);

        debug!(provider = "anthropic", model = %config.model_name, "Sending streaming request");

        let response = self.send(&body, config).await?;
        Ok(spawn_sse_reader(&self.name, response, parse_stream_event))
    }

    fn max_context_window(&self) -> usize {
        self.context_window
    }
}

fn stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("max_tokens") => FinishReason::Truncated,
        Some("refusal") => FinishReason::Filtered,
        _ => FinishReason::Complete,
    }
}

/// One `data:` payload of a Messages stream.
fn parse_stream_event(data: &str) -> Result<SseChunk, ProviderError> {
    let event: serde_json::Value = match serde_json::from_str(data) {
        Ok(event) => event,
        Err(e) => {
            trace!(error = %e, "Ignoring unparseable Anthropic SSE");
            return Ok(SseChunk::default());
        }
    };

    let token_count = |value: &serde_json::Value| value.as_u64().map(|n| n as u32);
    let chunk = match event["type"].as_str().unwrap_or_default() {
        "message_start" => SseChunk {
            prompt_tokens: token_count(&event["message"]["usage"]["input_tokens"]),
            ..Default::default()
        },
        "content_block_delta" => SseChunk {
            text: event["delta"]["text"].as_str().map(str::to_string),
            ..Default::default()
        },
        "message_delta" => SseChunk {
            finish_reason: event["delta"]["stop_reason"]
                .as_str()
                .map(|r| stop_reason(Some(r))),
            completion_tokens: token_count(&event["usage"]["output_tokens"]),
            ..Default::default()
        },
        "message_stop" => SseChunk {
            done: true,
            ..Default::default()
        },
        "error" => {
            return Err(ProviderError::Unavailable(format!(
                "anthropic stream failed: {}",
                event["error"]["message"].as_str().unwrap_or("unknown error")
            )));
        }
        _ => SseChunk::default(),
    };
    Ok(chunk)
}

// ── Anthropic API types ─────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
