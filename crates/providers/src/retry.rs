//! Retry wrapper for transient provider failures.
//!
//! `Unavailable` backs off exponentially, `RateLimited` waits for the
//! provider's `Retry-After` (or a default), `Timeout` gets a small separate
//! budget, and `ContentRejected` is returned immediately.
//!
//! Streams are retried only while opening; once the first event has been
//! handed out, a failure ends the stream.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fastrag_config::RetryConfig;
use fastrag_core::context::Prompt;
use fastrag_core::error::ProviderError;
use fastrag_core::provider::{Answer, AnswerStream, ProviderConfig};
use tracing::warn;

/// How many times, and how long between, a failing call is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts for `Unavailable` / `RateLimited`, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub default_rate_limit_delay: Duration,
    /// Retries allowed after a `Timeout`.
    pub timeout_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            default_rate_limit_delay: Duration::from_secs(config.default_rate_limit_secs),
            timeout_retries: config.timeout_retries,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            timeout_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (1-based): `base · 2^(retry−1)`,
    /// capped at `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before the next attempt, or `None` when `error` should surface.
    ///
    /// `attempt` counts calls made so far; `timeouts` counts timeouts seen so
    /// far, including this one.
    fn next_delay(&self, error: &ProviderError, attempt: u32, timeouts: u32) -> Option<Duration> {
        match error {
            ProviderError::ContentRejected(_) => None,
            ProviderError::Timeout(_) => {
                (timeouts <= self.timeout_retries).then_some(Duration::ZERO)
            }
            _ if attempt >= self.max_attempts => None,
            ProviderError::Unavailable(_) => Some(self.backoff(attempt)),
            ProviderError::RateLimited { retry_after_secs } => Some(
                retry_after_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.default_rate_limit_delay)
                    .min(self.max_delay),
            ),
        }
    }
}

/// A provider that retries its inner provider according to a [`RetryPolicy`].
pub struct RetryingProvider {
    inner: Arc<dyn fastrag_core::Provider>,
    policy: RetryPolicy,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn fastrag_core::Provider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn retrying<T, F, Fut>(&self, mut call: F) -> std::result::Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let mut attempt = 0u32;
        let mut timeouts = 0u32;

        loop {
            attempt += 1;
            let error = match call().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if matches!(error, ProviderError::Timeout(_)) {
                timeouts += 1;
            }

            let Some(delay) = self.policy.next_delay(&error, attempt, timeouts) else {
                return Err(error);
            };

            warn!(
                provider = %self.inner.name(),
                attempt,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Provider call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl fastrag_core::Provider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(
        &self,
        prompt: &Prompt,
        config: &ProviderConfig,
    ) -> std::result::Result<Answer, ProviderError> {
        self.retrying(|| self.inner.generate(prompt, config)).await
    }

    async fn generate_stream(
        &self,
        prompt: &Prompt,
        config: &ProviderConfig,
    ) -> std::result::Result<AnswerStream, ProviderError> {
        self.retrying(|| self.inner.generate_stream(prompt, config)).await
    }

    fn estimate_tokens(&self, text: &str) -> usize {
        self.inner.estimate_tokens(text)
    }

    fn max_context_window(&self) -> usize {
        self.inner.max_context_window()
    }
}
