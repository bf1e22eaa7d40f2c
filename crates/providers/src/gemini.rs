//! Google Gemini provider (Generative Language API, `generateContent` and
//! `streamGenerateContent` over SSE).

use std::time::Duration;

use async_trait::async_trait;
use fastrag_core::context::Prompt;
use fastrag_core::error::ProviderError;
use fastrag_core::message::Role;
use fastrag_core::provider::{Answer, AnswerStream, FinishReason, ProviderConfig, Usage};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::http::{SseChunk, build_client, chat_turns, check_status, spawn_sse_reader, transport_error};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_CONTEXT_WINDOW: usize = 1_048_576;

pub struct GeminiProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    context_window: usize,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            name: "gemini".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client: build_client(Duration::from_secs(300)),
            context_window: DEFAULT_CONTEXT_WINDOW,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    fn request_body(prompt: &Prompt, config: &ProviderConfig) -> serde_json::Value {
        // Gemini calls the assistant role "model".
        let contents: Vec<GeminiContent> = chat_turns(prompt)
            .into_iter()
            .map(|(role, text)| GeminiContent {
                role: match role {
                    Role::User => "user".into(),
                    Role::Assistant => "model".into(),
                },
                parts: vec![GeminiPart { text: text.into() }],
            })
            .collect();

        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": config.max_output_tokens,
                "temperature": config.temperature,
            },
        });

        let system = prompt.render_system();
        if !system.is_empty() {
            body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
        }
        body
    }

    async fn send(
        &self,
        method: &str,
        query: &[(&str, &str)],
        body: &serde_json::Value,
        config: &ProviderConfig,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1beta/models/{}:{method}", self.base_url, config.model_name);
        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .query(&[("key", self.api_key.as_str())])
            .query(query)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        check_status(&self.name, response).await
    }

    fn to_answer(resp: GeminiResponse) -> Result<Answer, ProviderError> {
        if let Some(reason) = resp.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(ProviderError::ContentRejected(format!(
                "gemini blocked the prompt: {reason}"
            )));
        }

        let candidate = resp
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Unavailable("gemini returned no candidates".into()))?;

        let finish_reason = finish_reason(candidate.finish_reason.as_deref());

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if finish_reason == FinishReason::Filtered && text.is_empty() {
            return Err(ProviderError::ContentRejected(format!(
                "gemini stopped with {}",
                candidate.finish_reason.as_deref().unwrap_or("SAFETY")
            )));
        }

        Ok(Answer {
            text,
            finish_reason,
            usage: resp
                .usage_metadata
                .map(|u| Usage {
                    prompt_tokens: u.prompt_token_count,
                    completion_tokens: u.candidates_token_count,
                })
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl fastrag_core::Provider for GeminiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        prompt: &Prompt,
        config: &ProviderConfig,
    ) -> std::result::Result<Answer, ProviderError> {
        let body = Self::request_body(prompt, config);

        debug!(provider = "gemini", model = %config.model_name, "Sending generation request");

        let response = self.send("generateContent", &[], &body, config).await?;
        let api_resp: GeminiResponse = response
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
        let body = Self::request_body(prompt, config);

        debug!(provider = "gemini", model = %config.model_name, "Sending streaming request");

        let response = self
            .send("streamGenerateContent", &[("alt", "sse")], &body, config)
            .await?;
        Ok(spawn_sse_reader(&self.name, response, parse_stream_chunk))
    }

    fn max_context_window(&self) -> usize {
        self.context_window
    }
}

fn finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("MAX_TOKENS") => FinishReason::Truncated,
        Some("SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII") => {
            FinishReason::Filtered
        }
        _ => FinishReason::Complete,
    }
}

/// One `data:` payload of `streamGenerateContent`; each is a partial response.
fn parse_stream_chunk(data: &str) -> Result<SseChunk, ProviderError> {
    let resp: GeminiResponse = match serde_json::from_str(data) {
        Ok(resp) => resp,
        Err(e) => {
            trace!(error = %e, "Ignoring unparseable Gemini SSE chunk");
            return Ok(SseChunk::default());
        }
    };
    if let Some(reason) = resp.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ProviderError::ContentRejected(format!(
            "gemini blocked the prompt: {reason}"
        )));
    }

    let mut chunk = SseChunk::default();
    if let Some(candidate) = resp.candidates.into_iter().next() {
        chunk.finish_reason = candidate.finish_reason.as_deref().map(|r| finish_reason(Some(r)));
        chunk.text = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect());
    }
    if let Some(usage) = resp.usage_metadata {
        chunk.prompt_tokens = Some(usage.prompt_token_count);
        chunk.completion_tokens = Some(usage.candidates_token_count);
    }
    Ok(chunk)
}

// ── Gemini API types ────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}
