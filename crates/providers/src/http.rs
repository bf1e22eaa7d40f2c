//! HTTP plumbing shared by every adapter: client construction, mapping
//! transport failures and status codes onto [`ProviderError`], turning a
//! [`Prompt`] into a chat message list, and reading server-sent events.

use std::time::Duration;

use fastrag_core::context::Prompt;
use fastrag_core::error::ProviderError;
use fastrag_core::message::Role;
use fastrag_core::provider::{AnswerStream, FinishReason, StreamEvent, Usage};
use futures::StreamExt;
use tracing::{trace, warn};

/// Longest error body we keep in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Build a client with a ceiling timeout. Per-request timeouts come from
/// [`ProviderConfig::request_timeout_secs`](fastrag_core::ProviderConfig).
pub(crate) fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Map a reqwest failure (no HTTP status) onto a provider error.
pub(crate) fn transport_error(provider: &str, e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(format!("{provider}: {e}"))
    } else {
        ProviderError::Unavailable(format!("{provider}: {e}"))
    }
}

/// Pass successful responses through; translate everything else.
///
/// | Status | Error |
/// |--------|-------|
/// | 429 | `RateLimited` (honours `Retry-After`) |
/// | 401, 403 | `Unavailable` (credentials) |
/// | 408, 504 | `Timeout` |
/// | 400, 422 with a policy marker in the body | `ContentRejected` |
/// | everything else | `Unavailable` |
pub(crate) async fn check_status(
    provider: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status().as_u16();
    if (200..300).contains(&status) {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = response.text().await.unwrap_or_default();
    warn!(provider, status, body = %truncate(&body), "Provider returned an error status");

    Err(status_error(provider, status, retry_after, &body))
}

/// Translate an HTTP error status into a provider error.
pub fn status_error(
    provider: &str,
    status: u16,
    retry_after_secs: Option<u64>,
    body: &str,
) -> ProviderError {
    let detail = format!("{provider} returned {status}: {}", truncate(body));
    match status {
        429 => ProviderError::RateLimited { retry_after_secs },
        401 | 403 => ProviderError::Unavailable(format!("authentication failed; {detail}")),
        408 | 504 => ProviderError::Timeout(detail),
        400 | 422 if mentions_policy(body) => ProviderError::ContentRejected(detail),
        _ => ProviderError::Unavailable(detail),
    }
}

/// Markers providers put in a 400/422 body when the content itself was refused.
const POLICY_MARKERS: &[&str] = &[
    "content_policy",
    "content_filter",
    "content policy",
    "safety",
    "moderation",
    "prohibited",
    "blocked",
];

fn mentions_policy(body: &str) -> bool {
    let body = body.to_lowercase();
    POLICY_MARKERS.iter().any(|marker| body.contains(marker))
}

/// Parse a `Retry-After` header given in seconds. HTTP dates are not
/// supported and yield `None`, which falls back to the default delay.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs);
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| secs.ceil() as u64)
}

/// The conversation to send: history window in order, then the user query.
///
/// Chat APIs want roles to alternate and the first message to come from the
/// user, so a leading assistant turn is dropped and consecutive turns with
/// the same role are joined by a blank line.
pub(crate) fn chat_turns(prompt: &Prompt) -> Vec<(Role, String)> {
    let history = prompt
        .history_window
        .iter()
        .map(|t| (t.role, t.text.as_str()))
        .skip_while(|(role, _)| *role == Role::Assistant);

    let mut turns: Vec<(Role, String)> = Vec::new();
    for (role, text) in history.chain(std::iter::once((Role::User, prompt.user_query.as_str()))) {
        match turns.last_mut() {
            Some((last, joined)) if *last == role => {
                joined.push_str("\n\n");
                joined.push_str(text);
            }
            _ => turns.push((role, text.to_string())),
        }
    }
    turns
}

// ── Server-sent events ──────────────────────────────────────────────────

/// What one SSE `data:` payload contributed to a streamed answer.
#[derive(Debug, Default)]
pub(crate) struct SseChunk {
    pub text: Option<String>,
    pub finish_reason: Option<FinishReason>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    /// The backend signalled the end of the answer.
    pub done: bool,
}

/// Read an SSE body on a background task and forward it as an [`AnswerStream`].
///
/// `parse` turns each `data:` payload into an [`SseChunk`]; an error from it
/// ends the stream with that error. `data: [DONE]`, a chunk marked `done`,
/// or the end of the body after a finish reason was seen produce the final
/// `Done` event. A body that ends before any of these is an error.
pub(crate) fn spawn_sse_reader<F>(provider: &str, response: reqwest::Response, mut parse: F) -> AnswerStream
where
    F: FnMut(&str) -> Result<SseChunk, ProviderError> + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let provider = provider.to_string();

    tokio::spawn(async move {
        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut finish_reason: Option<FinishReason> = None;
        let mut usage = Usage::default();

        loop {
            let bytes = match body.next().await {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    let _ = tx.send(Err(transport_error(&provider, e))).await;
                    return;
                }
                None => break,
            };
            buffer.extend_from_slice(&bytes);

            while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=end).collect();
                let line = String::from_utf8_lossy(&line);
                let Some(data) = line.trim_end().strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim_start();
                if data.is_empty() {
                    continue;
                }

                let chunk = if data == "[DONE]" {
                    SseChunk {
                        done: true,
                        ..Default::default()
                    }
                } else {
                    match parse(data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                };

                if let Some(text) = chunk.text.filter(|t| !t.is_empty()) {
                    if tx.send(Ok(StreamEvent::Delta(text))).await.is_err() {
                        trace!(provider = %provider, "Stream receiver dropped");
                        return;
                    }
                }
                finish_reason = chunk.finish_reason.or(finish_reason);
                usage.prompt_tokens = chunk.prompt_tokens.unwrap_or(usage.prompt_tokens);
                usage.completion_tokens = chunk.completion_tokens.unwrap_or(usage.completion_tokens);

                if chunk.done {
                    let _ = tx
                        .send(Ok(StreamEvent::Done {
                            finish_reason: finish_reason.unwrap_or_default(),
                            usage,
                        }))
                        .await;
                    return;
                }
            }
        }

        let last = match finish_reason {
            Some(finish_reason) => Ok(StreamEvent::Done { finish_reason, usage }),
            None => Err(ProviderError::Unavailable(format!(
                "{provider}: stream ended before the answer was complete"
            ))),
        };
        let _ = tx.send(last).await;
    });

    rx
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
