//! The conversation orchestrator: one user turn in, one answer out.
//!
//! Each turn walks a fixed state machine:
//!
//! ```text
//! Received → Retrieving → Assembling → Generating → Persisting → Completed
//!     └───────────┴────────────┴────────────┴────────────┴──→ Failed
//! ```
//!
//! Turns on the same conversation are serialized through
//! [`ConversationLocks`]; turns on different conversations run in parallel.
//! The provider and its configuration are read once per turn from an
//! atomically swappable snapshot, so [`reconfigure`](ConversationOrchestrator::reconfigure)
//! never affects a turn already in flight. A turn may also carry
//! [`TurnOverrides`] that apply to it alone.
//!
//! [`handle_turn_streaming`](ConversationOrchestrator::handle_turn_streaming)
//! runs the same state machine and forwards the answer as it is generated.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use fastrag_config::{AppConfig, RetrievalConfig, RetryConfig, default_api_key_ref_for, default_model_for};
use fastrag_core::context::{ChunkSource, ContextChunk, Prompt};
use fastrag_core::error::{ProviderError, StoreError};
use fastrag_core::message::{ConversationId, OwnerId, Role, TurnOrigin};
use fastrag_core::provider::{
    Answer, FinishReason, Provider, ProviderConfig, ProviderFactory, StreamEvent, Usage,
};
use fastrag_core::store::HistoryStore;
use fastrag_memory::EmbeddingIndex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::context::{PromptAssembler, ProviderEstimator};
use crate::locks::ConversationLocks;
use crate::retriever::{ContextRetriever, RetrievalParams, RetrievedContext};

const DEFAULT_PREAMBLE: &str =
    "You are a helpful AI assistant. Answer the user's questions clearly and concisely.";

// ── State machine ─────────────────────────────────────────────────────────

/// Where a turn is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Received,
    Retrieving,
    Assembling,
    Generating,
    Persisting,
    Completed,
    Failed,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_advance_to(self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Received, Retrieving)
            | (Retrieving, Assembling)
            | (Assembling, Generating)
            | (Generating, Persisting)
            | (Persisting, Completed) => true,
            _ => false,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────

/// Why a turn failed (or, for `PersistenceFailed`, what went wrong after the
/// answer was produced).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TurnError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Context retrieval failed: {0}")]
    RetrievalFailed(String),

    #[error("Prompt does not fit the model: {0}")]
    BudgetExceeded(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Content rejected by provider: {0}")]
    ContentRejected(String),

    #[error("Provider timed out: {0}")]
    ProviderTimeout(String),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Failed to persist turn: {0}")]
    PersistenceFailed(String),
}

impl TurnError {
    /// The wire name used in API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::RetrievalFailed(_) => "RetrievalFailed",
            Self::BudgetExceeded(_) => "BudgetExceeded",
            Self::GenerationFailed(_) => "GenerationFailed",
            Self::ContentRejected(_) => "ContentRejected",
            Self::ProviderTimeout(_) => "ProviderTimeout",
            Self::Cancelled => "Cancelled",
            Self::PersistenceFailed(_) => "PersistenceFailed",
        }
    }
}

impl From<ProviderError> for TurnError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::ContentRejected(msg) => Self::ContentRejected(msg),
            ProviderError::Timeout(msg) => Self::ProviderTimeout(msg),
            other @ (ProviderError::Unavailable(_) | ProviderError::RateLimited { .. }) => {
                Self::GenerationFailed(other.to_string())
            }
        }
    }
}

// ── Requests and results ──────────────────────────────────────────────────

/// Provider settings that apply to a single turn.
///
/// Unset fields keep the orchestrator's active configuration. Choosing a
/// different `llm_provider` also resets the model, key reference and
/// endpoint to that provider's defaults unless `llm_model` names one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Tokens reserved for the answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    /// `false` answers from history alone, without searching notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag_enabled: Option<bool>,
}

impl TurnOverrides {
    /// Reject values no provider accepts.
    pub fn validate(&self) -> Result<(), TurnError> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(TurnError::InvalidRequest(
                    "temperature must be between 0.0 and 2.0".into(),
                ));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(TurnError::InvalidRequest("max_tokens must be at least 1".into()));
        }
        if self.llm_provider.as_deref().is_some_and(|p| p.trim().is_empty()) {
            return Err(TurnError::InvalidRequest("llm_provider must not be blank".into()));
        }
        if self.llm_model.as_deref().is_some_and(|m| m.trim().is_empty()) {
            return Err(TurnError::InvalidRequest("llm_model must not be blank".into()));
        }
        Ok(())
    }

    fn provider_name(&self) -> Option<String> {
        self.llm_provider.as_deref().map(|p| p.trim().to_lowercase())
    }

    /// Whether the turn needs a provider other than the active one.
    fn switches_backend(&self, base: &ProviderConfig) -> bool {
        let provider_changed = self
            .provider_name()
            .is_some_and(|p| p != base.provider_name.trim().to_lowercase());
        let model_changed = self
            .llm_model
            .as_deref()
            .is_some_and(|m| m.trim() != base.model_name);
        provider_changed || model_changed
    }

    /// `base` with these overrides applied.
    pub fn apply_to(&self, base: &ProviderConfig) -> ProviderConfig {
        let mut config = base.clone();
        if let Some(name) = self.provider_name() {
            if name != base.provider_name.trim().to_lowercase() {
                config.model_name = default_model_for(&name).into();
                config.api_key_ref = default_api_key_ref_for(&name).into();
                config.api_url = None;
                config.provider_name = name;
            }
        }
        if let Some(model) = &self.llm_model {
            config.model_name = model.trim().to_string();
        }
        if let Some(temperature) = self.temperature {
            config.temperature = temperature;
        }
        if let Some(max_tokens) = self.max_tokens {
            config.max_output_tokens = max_tokens;
        }
        config
    }
}

/// Per-turn knobs.
#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    /// Generation deadline. Defaults to the provider's whole retry budget,
    /// see [`RetryConfig::generation_deadline`].
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    pub overrides: TurnOverrides,
}

impl TurnOptions {
    pub fn with_overrides(mut self, overrides: TurnOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Outcome of one turn.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub conversation_id: ConversationId,
    /// Empty when the turn failed.
    pub answer_text: String,
    /// The chunks that made it into the prompt, highest relevance first.
    pub context_used: Vec<ContextChunk>,
    pub error: Option<TurnError>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Usage,
    pub state: TurnState,
}

impl TurnResult {
    pub fn is_success(&self) -> bool {
        self.state == TurnState::Completed
    }
}

/// What a streamed turn reports, in order: the context once, then answer
/// deltas, then the outcome.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// The chunks that made it into the prompt, sent before generation
    Context(Vec<ContextChunk>),
    /// The next slice of the answer
    Delta(String),
    /// Always last; sent after persistence
    Finished(TurnResult),
}

/// A context chunk as reported to API callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRef {
    pub source: String,
    pub text: String,
    pub score: f32,
}

/// Wire form of a [`TurnResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResponse {
    pub answer: String,
    pub context: Vec<ContextRef>,
    pub error: Option<String>,
}

impl From<&ContextChunk> for ContextRef {
    fn from(chunk: &ContextChunk) -> Self {
        Self {
            source: chunk.source.as_str().to_string(),
            text: chunk.text.clone(),
            score: chunk.relevance_score,
        }
    }
}

impl From<&TurnResult> for TurnResponse {
    fn from(result: &TurnResult) -> Self {
        Self {
            answer: result.answer_text.clone(),
            context: result.context_used.iter().map(ContextRef::from).collect(),
            error: result.error.as_ref().map(|e| e.kind().to_string()),
        }
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────

/// Provider and configuration a turn runs against.
struct ActiveProvider {
    provider: Arc<dyn Provider>,
    config: ProviderConfig,
}

/// Drives turns through retrieval, assembly, generation and persistence.
pub struct ConversationOrchestrator {
    index: Arc<EmbeddingIndex>,
    history: Arc<dyn HistoryStore>,
    retriever: ContextRetriever,
    active: RwLock<Arc<ActiveProvider>>,
    provider_factory: Option<Arc<dyn ProviderFactory>>,
    retry: RetryConfig,
    system_preamble: String,
    k_notes: usize,
    k_history: usize,
    locks: ConversationLocks,
}

impl ConversationOrchestrator {
    pub fn new(
        provider: Arc<dyn Provider>,
        config: ProviderConfig,
        index: Arc<EmbeddingIndex>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        let retrieval = RetrievalConfig::default();
        Self {
            retriever: ContextRetriever::new(index.clone(), history.clone()),
            index,
            history,
            active: RwLock::new(Arc::new(ActiveProvider { provider, config })),
            provider_factory: None,
            retry: RetryConfig::default(),
            system_preamble: DEFAULT_PREAMBLE.to_string(),
            k_notes: retrieval.k_notes,
            k_history: retrieval.k_history,
            locks: ConversationLocks::new(),
        }
    }

    /// Build from the application config with an already constructed provider.
    pub fn from_config(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
        index: Arc<EmbeddingIndex>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self::new(provider, config.provider.clone(), index, history)
            .with_preamble(config.system_preamble.clone())
            .with_retrieval(&config.retrieval)
            .with_retry(&config.retry)
    }

    /// Retry policy the provider runs under; sizes the default deadline.
    pub fn with_retry(mut self, retry: &RetryConfig) -> Self {
        self.retry = retry.clone();
        self
    }

    /// Where providers for overridden turns come from. Without a factory,
    /// turns that change the provider or model are rejected.
    pub fn with_provider_factory(mut self, factory: Arc<dyn ProviderFactory>) -> Self {
        self.provider_factory = Some(factory);
        self
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.system_preamble = preamble.into();
        self
    }

    pub fn with_retrieval(mut self, retrieval: &RetrievalConfig) -> Self {
        self.k_notes = retrieval.k_notes;
        self.k_history = retrieval.k_history;
        self.retriever = ContextRetriever::new(self.index.clone(), self.history.clone())
            .with_params(RetrievalParams::from(retrieval));
        self
    }

    /// Swap the provider and its configuration. Turns already running keep
    /// the snapshot they started with.
    pub fn reconfigure(&self, provider: Arc<dyn Provider>, config: ProviderConfig) {
        info!(
            provider = %provider.name(),
            model = %config.model_name,
            "Provider reconfigured"
        );
        let next = Arc::new(ActiveProvider { provider, config });
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        *active = next;
    }

    /// The provider configuration new turns will use.
    pub fn provider_config(&self) -> ProviderConfig {
        self.snapshot().config.clone()
    }

    pub fn provider_name(&self) -> String {
        self.snapshot().provider.name().to_string()
    }

    fn snapshot(&self) -> Arc<ActiveProvider> {
        self.active.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The active provider with this turn's overrides applied.
    fn resolve_provider(&self, overrides: &TurnOverrides) -> Result<Arc<ActiveProvider>, TurnError> {
        let active = self.snapshot();
        if *overrides == TurnOverrides::default() {
            return Ok(active);
        }

        let config = overrides.apply_to(&active.config);
        if config.max_output_tokens >= config.max_context_tokens {
            return Err(TurnError::InvalidRequest(format!(
                "max_tokens ({}) must be less than the context window ({})",
                config.max_output_tokens, config.max_context_tokens
            )));
        }
        if !overrides.switches_backend(&active.config) {
            return Ok(Arc::new(ActiveProvider {
                provider: active.provider.clone(),
                config,
            }));
        }

        let factory = self.provider_factory.as_ref().ok_or_else(|| {
            TurnError::InvalidRequest("switching provider per turn is not available".into())
        })?;
        let provider = factory
            .build(&config)
            .map_err(|e| TurnError::InvalidRequest(e.to_string()))?;
        debug!(
            provider = %provider.name(),
            model = %config.model_name,
            "Using per-turn provider"
        );
        Ok(Arc::new(ActiveProvider { provider, config }))
    }

    /// Answer `user_text` in `conversation_id` on behalf of `owner_id`.
    pub async fn handle_turn(
        &self,
        conversation_id: &ConversationId,
        owner_id: &OwnerId,
        user_text: &str,
    ) -> TurnResult {
        self.handle_turn_with(conversation_id, owner_id, user_text, TurnOptions::default())
            .await
    }

    pub async fn handle_turn_with(
        &self,
        conversation_id: &ConversationId,
        owner_id: &OwnerId,
        user_text: &str,
        options: TurnOptions,
    ) -> TurnResult {
        self.drive_turn(conversation_id, owner_id, user_text, &options, None)
            .await
    }

    /// Like [`handle_turn_with`](Self::handle_turn_with), but the answer is
    /// forwarded as it is generated.
    ///
    /// The turn runs on its own task and always ends with
    /// [`TurnEvent::Finished`]. The assistant turn is persisted once the
    /// provider's stream is complete. Dropping the receiver cancels the turn.
    pub fn handle_turn_streaming(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        owner_id: OwnerId,
        user_text: String,
        options: TurnOptions,
    ) -> mpsc::Receiver<TurnEvent> {
        let (tx, rx) = mpsc::channel(64);
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let result = orchestrator
                .drive_turn(&conversation_id, &owner_id, &user_text, &options, Some(&tx))
                .await;
            let _ = tx.send(TurnEvent::Finished(result)).await;
        });
        rx
    }

    async fn drive_turn(
        &self,
        conversation_id: &ConversationId,
        owner_id: &OwnerId,
        user_text: &str,
        options: &TurnOptions,
        sink: Option<&mpsc::Sender<TurnEvent>>,
    ) -> TurnResult {
        let started = Instant::now();
        let mut turn = TurnTracker::new(conversation_id);

        let outcome = self
            .run_turn(&mut turn, conversation_id, owner_id, user_text, options, sink)
            .await;

        let result = match outcome {
            Ok(done) => TurnResult {
                conversation_id: conversation_id.clone(),
                answer_text: done.answer.text,
                context_used: done.context_used,
                error: done.persistence_error,
                finish_reason: Some(done.answer.finish_reason),
                usage: done.answer.usage,
                state: turn.state,
            },
            Err((err, context_used)) => {
                turn.fail(&err);
                TurnResult {
                    conversation_id: conversation_id.clone(),
                    answer_text: String::new(),
                    context_used,
                    error: Some(err),
                    finish_reason: None,
                    usage: Usage::default(),
                    state: turn.state,
                }
            }
        };

        info!(
            conversation_id = %conversation_id,
            state = ?result.state,
            error = result.error.as_ref().map(|e| e.kind()).unwrap_or("none"),
            chunks = result.context_used.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Turn finished"
        );
        result
    }

    async fn run_turn(
        &self,
        turn: &mut TurnTracker,
        conversation_id: &ConversationId,
        owner_id: &OwnerId,
        user_text: &str,
        options: &TurnOptions,
        sink: Option<&mpsc::Sender<TurnEvent>>,
    ) -> Result<CompletedTurn, (TurnError, Vec<ContextChunk>)> {
        let cancel = options.cancel.as_ref();
        let fail = |e: TurnError| (e, Vec::new());

        // ── Received ───────────────────────────────────────────────────────
        validate(conversation_id, owner_id, user_text).map_err(fail)?;
        options.overrides.validate().map_err(fail)?;
        check_cancel(cancel).map_err(fail)?;

        self.history
            .ensure_conversation(conversation_id, owner_id)
            .await
            .map_err(|e| fail(conversation_error(e)))?;

        let _guard = tokio::select! {
            guard = self.locks.acquire(conversation_id) => guard,
            _ = wait_cancelled(cancel) => return Err(fail(TurnError::Cancelled)),
        };

        let active = self.resolve_provider(&options.overrides).map_err(fail)?;
        let mut config = active.config.clone();
        config.max_context_tokens = config
            .max_context_tokens
            .min(active.provider.max_context_window());
        let origin = TurnOrigin::new(config.provider_name.clone(), config.model_name.clone());
        let k_notes = match options.overrides.rag_enabled {
            Some(false) => 0,
            _ => self.k_notes,
        };

        let mut user_turn_id = match self
            .history
            .append_turn_from(conversation_id, Role::User, user_text, Some(&origin))
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "User turn not written, will retry after generation");
                None
            }
        };

        // ── Retrieving ─────────────────────────────────────────────────────
        turn.advance(TurnState::Retrieving, cancel).map_err(fail)?;
        let RetrievedContext { chunks, turns } = self
            .retriever
            .retrieve_context(
                conversation_id,
                owner_id,
                user_text,
                k_notes,
                self.k_history,
                user_turn_id.as_deref(),
            )
            .await
            .map_err(|e| fail(TurnError::RetrievalFailed(e.to_string())))?;

        // ── Assembling ─────────────────────────────────────────────────────
        turn.advance(TurnState::Assembling, cancel).map_err(fail)?;
        let assembler = PromptAssembler::new(Arc::new(ProviderEstimator(active.provider.clone())));
        let prompt = assembler
            .assemble(&self.system_preamble, chunks.clone(), &turns, user_text, &config)
            .map_err(|e| fail(TurnError::BudgetExceeded(e.to_string())))?;
        let context_used = used_chunks(&chunks, &prompt);

        // ── Generating ─────────────────────────────────────────────────────
        turn.advance(TurnState::Generating, cancel)
            .map_err(|e| (e, context_used.clone()))?;
        if let Some(sink) = sink {
            if sink.send(TurnEvent::Context(context_used.clone())).await.is_err() {
                return Err((TurnError::Cancelled, context_used));
            }
        }
        let timeout = options.timeout.unwrap_or_else(|| {
            self.retry
                .generation_deadline(Duration::from_secs(config.request_timeout_secs))
        });
        debug!(
            provider = %active.provider.name(),
            prompt_tokens = prompt.total_token_estimate,
            timeout_ms = timeout.as_millis() as u64,
            streaming = sink.is_some(),
            "Generating answer"
        );

        let answer = tokio::select! {
            outcome = tokio::time::timeout(timeout, generate(&active, &prompt, &config, sink)) => {
                match outcome {
                    Ok(Ok(answer)) => answer,
                    Ok(Err(e)) => return Err((e, context_used)),
                    Err(_) => {
                        return Err((
                            TurnError::ProviderTimeout(format!(
                                "no answer within {}ms",
                                timeout.as_millis()
                            )),
                            context_used,
                        ));
                    }
                }
            }
            _ = wait_cancelled(cancel) => return Err((TurnError::Cancelled, context_used)),
        };

        // ── Persisting ─────────────────────────────────────────────────────
        turn.advance(TurnState::Persisting, cancel)
            .map_err(|e| (e, context_used.clone()))?;
        let persistence_error = self
            .persist(conversation_id, user_text, &answer.text, &origin, &mut user_turn_id)
            .await
            .err();

        turn.advance(TurnState::Completed, None)
            .map_err(|e| (e, context_used.clone()))?;
        Ok(CompletedTurn {
            answer,
            context_used,
            persistence_error,
        })
    }

    /// Write the user turn if it is still pending, then the assistant turn.
    async fn persist(
        &self,
        conversation_id: &ConversationId,
        user_text: &str,
        answer_text: &str,
        origin: &TurnOrigin,
        user_turn_id: &mut Option<String>,
    ) -> Result<(), TurnError> {
        if user_turn_id.is_none() {
            let id = self
                .history
                .append_turn_from(conversation_id, Role::User, user_text, Some(origin))
                .await
                .map_err(|e| persistence_failed(conversation_id, Role::User, e))?;
            *user_turn_id = Some(id);
        }

        self.history
            .append_turn_from(conversation_id, Role::Assistant, answer_text, Some(origin))
            .await
            .map_err(|e| persistence_failed(conversation_id, Role::Assistant, e))?;
        Ok(())
    }
}

/// Produce the answer, forwarding deltas to `sink` when streaming.
async fn generate(
    active: &ActiveProvider,
    prompt: &Prompt,
    config: &ProviderConfig,
    sink: Option<&mpsc::Sender<TurnEvent>>,
) -> Result<Answer, TurnError> {
    let Some(sink) = sink else {
        return Ok(active.provider.generate(prompt, config).await?);
    };

    let mut stream = active.provider.generate_stream(prompt, config).await?;
    let mut text = String::new();
    while let Some(event) = stream.recv().await {
        match event? {
            StreamEvent::Delta(delta) => {
                text.push_str(&delta);
                if sink.send(TurnEvent::Delta(delta)).await.is_err() {
                    return Err(TurnError::Cancelled);
                }
            }
            StreamEvent::Done { finish_reason, usage } => {
                if finish_reason == FinishReason::Filtered && text.is_empty() {
                    return Err(TurnError::ContentRejected(format!(
                        "{} filtered the response",
                        active.provider.name()
                    )));
                }
                return Ok(Answer {
                    text,
                    finish_reason,
                    usage,
                });
            }
        }
    }
    Err(TurnError::GenerationFailed(format!(
        "{} ended the stream without finishing",
        active.provider.name()
    )))
}

struct CompletedTurn {
    answer: Answer,
    context_used: Vec<ContextChunk>,
    persistence_error: Option<TurnError>,
}

/// Tracks the state of one turn and enforces legal transitions.
struct TurnTracker {
    conversation_id: String,
    state: TurnState,
}

impl TurnTracker {
    fn new(conversation_id: &ConversationId) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            state: TurnState::Received,
        }
    }

    /// Move to `next`, unless the turn was cancelled in the meantime.
    fn advance(&mut self, next: TurnState, cancel: Option<&CancelToken>) -> Result<(), TurnError> {
        check_cancel(cancel)?;
        if !self.state.can_advance_to(next) {
            return Err(TurnError::InvalidRequest(format!(
                "illegal turn transition {:?} → {next:?}",
                self.state
            )));
        }
        debug!(conversation_id = %self.conversation_id, from = ?self.state, to = ?next, "Turn state");
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, err: &TurnError) {
        if !self.state.is_terminal() {
            debug!(
                conversation_id = %self.conversation_id,
                from = ?self.state,
                error = err.kind(),
                "Turn failed"
            );
            self.state = TurnState::Failed;
        }
    }
}

fn validate(conversation_id: &ConversationId, owner_id: &OwnerId, user_text: &str) -> Result<(), TurnError> {
    if conversation_id.as_str().trim().is_empty() {
        return Err(TurnError::InvalidRequest("conversation_id must not be empty".into()));
    }
    if owner_id.as_str().trim().is_empty() {
        return Err(TurnError::InvalidRequest("owner_id must not be empty".into()));
    }
    if user_text.trim().is_empty() {
        return Err(TurnError::InvalidRequest("message must not be blank".into()));
    }
    Ok(())
}

fn check_cancel(cancel: Option<&CancelToken>) -> Result<(), TurnError> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(TurnError::Cancelled),
        _ => Ok(()),
    }
}

async fn wait_cancelled(cancel: Option<&CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn conversation_error(e: StoreError) -> TurnError {
    match e {
        StoreError::OwnerMismatch { conversation_id } => TurnError::InvalidRequest(format!(
            "conversation {conversation_id} belongs to another owner"
        )),
        other => TurnError::RetrievalFailed(other.to_string()),
    }
}

fn persistence_failed(conversation_id: &ConversationId, role: Role, e: StoreError) -> TurnError {
    error!(conversation_id = %conversation_id, role = %role, error = %e, "Failed to persist turn");
    TurnError::PersistenceFailed(e.to_string())
}

/// The retrieved chunks that ended up in the prompt, in ranked order.
fn used_chunks(ranked: &[ContextChunk], prompt: &Prompt) -> Vec<ContextChunk> {
    ranked
        .iter()
        .filter(|chunk| match chunk.source {
            ChunkSource::History if prompt
                .history_window
                .iter()
                .any(|t| t.turn_id == chunk.source_id) =>
            {
                true
            }
            _ => prompt
                .context
                .iter()
                .any(|c| c.source == chunk.source && c.source_id == chunk.source_id),
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ChunkedProvider, FixedFactory, ScriptedProvider, SlowProvider, setup};
    use fastrag_memory::EntryMeta;

    fn conv() -> ConversationId {
        ConversationId::from("c1")
    }

    fn owner() -> OwnerId {
        OwnerId::from("alice")
    }

    #[test]
    fn legal_transitions() {
        use TurnState::*;
        let path = [Received, Retrieving, Assembling, Generating, Persisting, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{:?} → {:?}", pair[0], pair[1]);
        }
        for state in &path[..5] {
            assert!(state.can_advance_to(Failed));
        }
        assert!(!Received.can_advance_to(Generating));
        assert!(!Generating.can_advance_to(Retrieving));
        assert!(!Completed.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Received));
    }

    #[test]
    fn provider_errors_map_to_turn_errors() {
        assert_eq!(
            TurnError::from(ProviderError::ContentRejected("x".into())).kind(),
            "ContentRejected"
        );
        assert_eq!(TurnError::from(ProviderError::Timeout("x".into())).kind(), "ProviderTimeout");
        assert_eq!(
            TurnError::from(ProviderError::RateLimited { retry_after_secs: None }).kind(),
            "GenerationFailed"
        );
        assert_eq!(
            TurnError::from(ProviderError::Unavailable("x".into())).kind(),
            "GenerationFailed"
        );
    }

    #[tokio::test]
    async fn simple_question_without_context() {
        let provider = Arc::new(ScriptedProvider::answering("4"));
        let (orchestrator, history) = setup(provider.clone());

        let result = orchestrator.handle_turn(&conv(), &owner(), "What is 2+2?").await;

        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.answer_text, "4");
        assert!(result.context_used.is_empty());

        let prompts = provider.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].context.is_empty());
        assert!(prompts[0].history_window.is_empty());
        assert_eq!(prompts[0].user_query, "What is 2+2?");

        let turns = history.get_history(&conv()).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].text, "4");
    }

    #[tokio::test]
    async fn previous_turns_feed_the_next_prompt() {
        let provider = Arc::new(ScriptedProvider::answering("ok"));
        let (orchestrator, _) = setup(provider.clone());

        orchestrator.handle_turn(&conv(), &owner(), "My name is Ada.").await;
        orchestrator.handle_turn(&conv(), &owner(), "What is my name?").await;

        let prompts = provider.prompts();
        let second = &prompts[1];
        assert_eq!(second.history_window.len(), 2);
        assert_eq!(second.history_window[0].text, "My name is Ada.");
        assert_eq!(second.history_window[1].text, "ok");
        assert_eq!(second.user_query, "What is my name?");
    }

    #[tokio::test]
    async fn notes_are_used_as_context() {
        let provider = Arc::new(ScriptedProvider::answering("Paris"));
        let (orchestrator, _) = setup(provider.clone());
        let meta = EntryMeta {
            owner_id: Some(owner()),
            source: ChunkSource::Note,
        };
        orchestrator
            .index
            .upsert_entry("paris", "Paris is the capital of France", meta)
            .await
            .unwrap();

        let result = orchestrator
            .handle_turn(&conv(), &owner(), "What is the capital of France?")
            .await;

        assert_eq!(result.context_used[0].source_id, "paris");
        let response = TurnResponse::from(&result);
        assert_eq!(response.context[0].source, "note");
        assert!(provider.prompts()[0].render_system().contains("Paris is the capital"));
    }

    #[tokio::test]
    async fn blank_message_is_invalid() {
        let provider = Arc::new(ScriptedProvider::answering("unused"));
        let (orchestrator, history) = setup(provider.clone());

        let result = orchestrator.handle_turn(&conv(), &owner(), "   ").await;
        assert_eq!(result.state, TurnState::Failed);
        assert_eq!(result.error.unwrap().kind(), "InvalidRequest");
        assert_eq!(provider.calls(), 0);
        assert!(history.get_history(&conv()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreign_conversation_is_invalid() {
        let provider = Arc::new(ScriptedProvider::answering("hi"));
        let (orchestrator, _) = setup(provider.clone());
        orchestrator.handle_turn(&conv(), &owner(), "hello").await;

        let result = orchestrator
            .handle_turn(&conv(), &OwnerId::from("mallory"), "let me in")
            .await;
        assert_eq!(result.error.unwrap().kind(), "InvalidRequest");
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn content_rejection_keeps_user_turn_only() {
        let provider = Arc::new(ScriptedProvider::failing(ProviderError::ContentRejected(
            "policy".into(),
        )));
        let (orchestrator, history) = setup(provider);

        let result = orchestrator.handle_turn(&conv(), &owner(), "something bad").await;
        let response = TurnResponse::from(&result);
        assert_eq!(response.answer, "");
        assert_eq!(response.error.as_deref(), Some("ContentRejected"));

        let turns = history.get_history(&conv()).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::User);
    }

    #[tokio::test]
    async fn oversized_message_is_budget_exceeded() {
        let provider = Arc::new(ScriptedProvider::answering("unused"));
        let (orchestrator, _) = setup(provider.clone());
        let config = ProviderConfig {
            max_context_tokens: 256,
            max_output_tokens: 128,
            ..Default::default()
        };
        orchestrator.reconfigure(provider.clone(), config);

        let result = orchestrator
            .handle_turn(&conv(), &owner(), &"long ".repeat(400))
            .await;
        assert_eq!(result.error.unwrap().kind(), "BudgetExceeded");
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn context_window_is_clamped_to_provider() {
        let provider = Arc::new(ScriptedProvider::answering("ok").with_window(64));
        let (orchestrator, _) = setup(provider.clone());
        // Default config allows 8192 tokens; the provider only takes 64.
        let result = orchestrator
            .handle_turn(&conv(), &owner(), &"word ".repeat(100))
            .await;
        assert_eq!(result.error.unwrap().kind(), "BudgetExceeded");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        let provider = Arc::new(SlowProvider::new(Duration::from_secs(60)));
        let (orchestrator, history) = setup(provider);

        let options = TurnOptions::default().with_timeout(Duration::from_secs(1));
        let result = orchestrator
            .handle_turn_with(&conv(), &owner(), "hello?", options)
            .await;
        assert_eq!(result.error.unwrap().kind(), "ProviderTimeout");
        assert_eq!(result.state, TurnState::Failed);
        assert_eq!(history.get_history(&conv()).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_generation() {
        let provider = Arc::new(SlowProvider::new(Duration::from_secs(60)));
        let (orchestrator, history) = setup(provider);
        let orchestrator = Arc::new(orchestrator);

        let cancel = CancelToken::new();
        let task = {
            let orchestrator = orchestrator.clone();
            let options = TurnOptions::default().with_cancel(cancel.clone());
            tokio::spawn(async move {
                orchestrator
                    .handle_turn_with(&conv(), &owner(), "hello?", options)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let result = task.await.unwrap();
        assert_eq!(result.error.unwrap().kind(), "Cancelled");
        let turns = history.get_history(&conv()).await.unwrap();
        assert!(turns.iter().all(|t| t.role == Role::User));
    }

    #[tokio::test]
    async fn cancelled_before_start_does_nothing() {
        let provider = Arc::new(ScriptedProvider::answering("unused"));
        let (orchestrator, history) = setup(provider.clone());
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = orchestrator
            .handle_turn_with(&conv(), &owner(), "hi", TurnOptions::default().with_cancel(cancel))
            .await;
        assert_eq!(result.error.unwrap().kind(), "Cancelled");
        assert_eq!(provider.calls(), 0);
        assert!(history.get_history(&conv()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconfigure_switches_provider_for_new_turns() {
        let first = Arc::new(ScriptedProvider::answering("from first"));
        let second = Arc::new(ScriptedProvider::answering("from second"));
        let (orchestrator, _) = setup(first.clone());

        assert_eq!(orchestrator.handle_turn(&conv(), &owner(), "a").await.answer_text, "from first");
        orchestrator.reconfigure(second.clone(), ProviderConfig::default());
        assert_eq!(orchestrator.handle_turn(&conv(), &owner(), "b").await.answer_text, "from second");
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 1);
        assert_eq!(orchestrator.provider_name(), "scripted");
    }

    #[tokio::test(start_paused = true)]
    async fn default_deadline_outlasts_one_slow_attempt() {
        // Longer than request_timeout_secs, well inside the retry budget.
        let provider = Arc::new(SlowProvider::new(Duration::from_secs(150)));
        let (orchestrator, _) = setup(provider);

        let result = orchestrator.handle_turn(&conv(), &owner(), "hello?").await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.answer_text, "eventually");
    }

    #[tokio::test]
    async fn turns_record_provider_and_model() {
        let provider = Arc::new(ScriptedProvider::answering("4"));
        let (orchestrator, history) = setup(provider);

        orchestrator.handle_turn(&conv(), &owner(), "What is 2+2?").await;

        let turns = history.get_history(&conv()).await.unwrap();
        let expected = TurnOrigin::new("claude", "claude-3-5-sonnet-20240620");
        for turn in &turns {
            assert_eq!(turn.llm_provider.as_deref(), Some(expected.llm_provider.as_str()));
            assert_eq!(turn.llm_model.as_deref(), Some(expected.llm_model.as_str()));
        }
    }

    #[tokio::test]
    async fn overrides_switch_provider_for_one_turn() {
        let active = Arc::new(ScriptedProvider::answering("from active"));
        let other = Arc::new(ScriptedProvider::answering("from gemini"));
        let factory = Arc::new(FixedFactory::new(other.clone()));
        let (orchestrator, history) = setup(active.clone());
        let orchestrator = orchestrator.with_provider_factory(factory.clone());

        let overrides = TurnOverrides {
            llm_provider: Some("Gemini".into()),
            temperature: Some(0.9),
            ..Default::default()
        };
        let result = orchestrator
            .handle_turn_with(&conv(), &owner(), "hi", TurnOptions::default().with_overrides(overrides))
            .await;
        assert_eq!(result.answer_text, "from gemini");

        let requested = &factory.requested()[0];
        assert_eq!(requested.provider_name, "gemini");
        assert_eq!(requested.model_name, "gemini-1.5-flash");
        assert_eq!(requested.api_key_ref, "GOOGLE_API_KEY");
        assert!((other.last_config().unwrap().temperature - 0.9).abs() < f32::EPSILON);

        let next = orchestrator.handle_turn(&conv(), &owner(), "again").await;
        assert_eq!(next.answer_text, "from active");
        assert_eq!(orchestrator.provider_config().provider_name, "claude");

        let turns = history.get_history(&conv()).await.unwrap();
        assert_eq!(turns[1].llm_provider.as_deref(), Some("gemini"));
        assert_eq!(turns[3].llm_provider.as_deref(), Some("claude"));
    }

    #[tokio::test]
    async fn sampling_overrides_keep_the_active_provider() {
        let provider = Arc::new(ScriptedProvider::answering("ok"));
        let factory = Arc::new(FixedFactory::new(Arc::new(ScriptedProvider::answering("unused"))));
        let (orchestrator, _) = setup(provider.clone());
        let orchestrator = orchestrator.with_provider_factory(factory.clone());

        let overrides = TurnOverrides {
            llm_model: Some("claude-3-5-sonnet-20240620".into()),
            max_tokens: Some(64),
            temperature: Some(0.0),
            ..Default::default()
        };
        let result = orchestrator
            .handle_turn_with(&conv(), &owner(), "hi", TurnOptions::default().with_overrides(overrides))
            .await;
        assert!(result.is_success());
        assert!(factory.requested().is_empty());
        let config = provider.last_config().unwrap();
        assert_eq!(config.max_output_tokens, 64);
        assert_eq!(config.temperature, 0.0);
    }

    #[tokio::test]
    async fn bad_overrides_are_invalid_requests() {
        let provider = Arc::new(ScriptedProvider::answering("unused"));
        let (orchestrator, history) = setup(provider.clone());

        let cases = [
            TurnOverrides {
                temperature: Some(2.5),
                ..Default::default()
            },
            TurnOverrides {
                max_tokens: Some(0),
                ..Default::default()
            },
            TurnOverrides {
                max_tokens: Some(8192),
                ..Default::default()
            },
            // No factory configured.
            TurnOverrides {
                llm_provider: Some("openai".into()),
                ..Default::default()
            },
        ];
        for overrides in cases {
            let result = orchestrator
                .handle_turn_with(
                    &conv(),
                    &owner(),
                    "hi",
                    TurnOptions::default().with_overrides(overrides.clone()),
                )
                .await;
            assert_eq!(result.error.unwrap().kind(), "InvalidRequest", "{overrides:?}");
        }
        assert_eq!(provider.calls(), 0);
        assert!(history.get_history(&conv()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_provider_override_is_invalid() {
        let provider = Arc::new(ScriptedProvider::answering("unused"));
        let factory = Arc::new(FixedFactory::new(provider.clone()));
        let (orchestrator, _) = setup(provider.clone());
        let orchestrator = orchestrator.with_provider_factory(factory);

        let overrides = TurnOverrides {
            llm_provider: Some("nonexistent".into()),
            ..Default::default()
        };
        let result = orchestrator
            .handle_turn_with(&conv(), &owner(), "hi", TurnOptions::default().with_overrides(overrides))
            .await;
        let err = result.error.unwrap();
        assert_eq!(err.kind(), "InvalidRequest");
        assert!(err.to_string().contains("nonexistent"));
    }

    #[tokio::test]
    async fn rag_disabled_answers_without_notes() {
        let provider = Arc::new(ScriptedProvider::answering("Paris"));
        let (orchestrator, _) = setup(provider.clone());
        let meta = EntryMeta {
            owner_id: Some(owner()),
            source: ChunkSource::Note,
        };
        orchestrator
            .index
            .upsert_entry("paris", "Paris is the capital of France", meta)
            .await
            .unwrap();
        orchestrator.handle_turn(&conv(), &owner(), "Hello").await;

        let overrides = TurnOverrides {
            rag_enabled: Some(false),
            ..Default::default()
        };
        let result = orchestrator
            .handle_turn_with(
                &conv(),
                &owner(),
                "What is the capital of France?",
                TurnOptions::default().with_overrides(overrides),
            )
            .await;
        assert!(result.context_used.iter().all(|c| c.source == ChunkSource::History));
        let prompt = &provider.prompts()[1];
        assert!(prompt.context.is_empty());
        assert_eq!(prompt.history_window.len(), 2);
    }

    async fn drain(mut events: mpsc::Receiver<TurnEvent>) -> (Vec<String>, Option<TurnResult>) {
        let mut deltas = Vec::new();
        let mut finished = None;
        while let Some(event) = events.recv().await {
            match event {
                TurnEvent::Context(_) => assert!(deltas.is_empty()),
                TurnEvent::Delta(delta) => deltas.push(delta),
                TurnEvent::Finished(result) => finished = Some(result),
            }
        }
        (deltas, finished)
    }

    #[tokio::test]
    async fn streamed_turn_persists_the_whole_answer_at_the_end() {
        let provider = Arc::new(ChunkedProvider::new(&["The capital ", "is ", "Paris."]));
        let (orchestrator, history) = setup(provider);
        let orchestrator = Arc::new(orchestrator);

        let events = orchestrator.handle_turn_streaming(
            conv(),
            owner(),
            "Capital of France?".into(),
            TurnOptions::default(),
        );
        let (deltas, finished) = drain(events).await;

        assert_eq!(deltas, vec!["The capital ", "is ", "Paris."]);
        let result = finished.unwrap();
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.answer_text, "The capital is Paris.");

        let turns = history.get_history(&conv()).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].text, "The capital is Paris.");
        assert_eq!(turns[1].llm_provider.as_deref(), Some("claude"));
    }

    #[tokio::test]
    async fn stream_failure_maps_like_a_whole_answer() {
        let provider = Arc::new(
            ChunkedProvider::new(&["partial"])
                .failing_after(ProviderError::Timeout("read timed out".into())),
        );
        let (orchestrator, history) = setup(provider);
        let orchestrator = Arc::new(orchestrator);

        let events =
            orchestrator.handle_turn_streaming(conv(), owner(), "hi".into(), TurnOptions::default());
        let (deltas, finished) = drain(events).await;

        assert_eq!(deltas, vec!["partial"]);
        let result = finished.unwrap();
        assert_eq!(result.error.unwrap().kind(), "ProviderTimeout");
        assert_eq!(result.answer_text, "");
        let turns = history.get_history(&conv()).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::User);
    }

    #[tokio::test]
    async fn streamed_invalid_request_finishes_immediately() {
        let provider = Arc::new(ChunkedProvider::new(&["unused"]));
        let (orchestrator, _) = setup(provider);
        let orchestrator = Arc::new(orchestrator);

        let events =
            orchestrator.handle_turn_streaming(conv(), owner(), "  ".into(), TurnOptions::default());
        let (deltas, finished) = drain(events).await;
        assert!(deltas.is_empty());
        assert_eq!(finished.unwrap().error.unwrap().kind(), "InvalidRequest");
    }

    #[test]
    fn response_serializes_null_error() {
        let result = TurnResult {
            conversation_id: conv(),
            answer_text: "4".into(),
            context_used: vec![],
            error: None,
            finish_reason: Some(FinishReason::Complete),
            usage: Usage::default(),
            state: TurnState::Completed,
        };
        let json = serde_json::to_value(TurnResponse::from(&result)).unwrap();
        assert_eq!(json, serde_json::json!({"answer": "4", "context": [], "error": null}));
    }
}
