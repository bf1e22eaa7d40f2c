//! Shared test helpers: scripted providers, a provider factory and a
//! ready-made orchestrator.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fastrag_core::context::Prompt;
use fastrag_core::error::ProviderError;
use fastrag_core::provider::{
    Answer, AnswerStream, FinishReason, Provider, ProviderConfig, ProviderFactory, StreamEvent,
    Usage,
};
use fastrag_memory::{EmbeddingIndex, HashEmbedder, InMemoryHistoryStore};

use crate::orchestrator::ConversationOrchestrator;

/// Returns scripted errors first, then keeps answering with `answer`.
/// Records every prompt it receives.
pub struct ScriptedProvider {
    answer: String,
    errors: Mutex<VecDeque<ProviderError>>,
    prompts: Mutex<Vec<Prompt>>,
    configs: Mutex<Vec<ProviderConfig>>,
    window: usize,
}

impl ScriptedProvider {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: answer.into(),
            errors: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
            window: 200_000,
        }
    }

    /// Fails every call with `error`.
    pub fn failing(error: ProviderError) -> Self {
        let provider = Self::answering("");
        provider.errors.lock().unwrap().extend(std::iter::repeat_n(error, 64));
        provider
    }

    pub fn with_window(mut self, tokens: usize) -> Self {
        self.window = tokens;
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap().clone()
    }

    /// The configuration of the most recent call.
    pub fn last_config(&self) -> Option<ProviderConfig> {
        self.configs.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        prompt: &Prompt,
        config: &ProviderConfig,
    ) -> Result<Answer, ProviderError> {
        self.prompts.lock().unwrap().push(prompt.clone());
        self.configs.lock().unwrap().push(config.clone());
        match self.errors.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(Answer::complete(self.answer.clone())),
        }
    }

    fn max_context_window(&self) -> usize {
        self.window
    }
}

/// Sleeps for `delay` before answering.
pub struct SlowProvider {
    delay: Duration,
}

impl SlowProvider {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Provider for SlowProvider {
    fn name(&self) -> &str {
        "slow"
    }

    async fn generate(
        &self,
        _prompt: &Prompt,
        _config: &ProviderConfig,
    ) -> Result<Answer, ProviderError> {
        tokio::time::sleep(self.delay).await;
        Ok(Answer::complete("eventually"))
    }

    fn max_context_window(&self) -> usize {
        200_000
    }
}

/// Streams `deltas` one by one, then finishes or fails with `failure`.
pub struct ChunkedProvider {
    deltas: Vec<String>,
    failure: Option<ProviderError>,
}

impl ChunkedProvider {
    pub fn new(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            failure: None,
        }
    }

    pub fn failing_after(mut self, error: ProviderError) -> Self {
        self.failure = Some(error);
        self
    }
}

#[async_trait]
impl Provider for ChunkedProvider {
    fn name(&self) -> &str {
        "chunked"
    }

    async fn generate(
        &self,
        _prompt: &Prompt,
        _config: &ProviderConfig,
    ) -> Result<Answer, ProviderError> {
        match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(Answer::complete(self.deltas.concat())),
        }
    }

    async fn generate_stream(
        &self,
        _prompt: &Prompt,
        _config: &ProviderConfig,
    ) -> Result<AnswerStream, ProviderError> {
        let (tx, rx) = tokio::sync::mpsc::channel(self.deltas.len() + 1);
        for delta in &self.deltas {
            tx.try_send(Ok(StreamEvent::Delta(delta.clone()))).unwrap();
        }
        let last = match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(StreamEvent::Done {
                finish_reason: FinishReason::Complete,
                usage: Usage::default(),
            }),
        };
        tx.try_send(last).unwrap();
        Ok(rx)
    }

    fn max_context_window(&self) -> usize {
        200_000
    }
}

/// Hands out the same provider for every configuration and records what
/// it was asked for.
pub struct FixedFactory {
    provider: Arc<dyn Provider>,
    requested: Mutex<Vec<ProviderConfig>>,
}

impl FixedFactory {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn requested(&self) -> Vec<ProviderConfig> {
        self.requested.lock().unwrap().clone()
    }
}

impl ProviderFactory for FixedFactory {
    fn build(&self, config: &ProviderConfig) -> fastrag_core::Result<Arc<dyn Provider>> {
        if config.provider_name == "nonexistent" {
            return Err(fastrag_core::Error::Config {
                message: format!("Unknown provider: {:?}", config.provider_name),
            });
        }
        self.requested.lock().unwrap().push(config.clone());
        Ok(self.provider.clone())
    }
}

/// An orchestrator over in-memory stores with the default configuration.
pub fn setup(provider: Arc<dyn Provider>) -> (ConversationOrchestrator, Arc<InMemoryHistoryStore>) {
    let index = Arc::new(EmbeddingIndex::new(Arc::new(HashEmbedder::default())));
    let history = Arc::new(InMemoryHistoryStore::new());
    let orchestrator =
        ConversationOrchestrator::new(provider, ProviderConfig::default(), index, history.clone());
    (orchestrator, history)
}
