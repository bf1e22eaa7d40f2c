//! Token estimation for prompt assembly.
//!
//! The default heuristic is ~4 characters per token, rounded up, plus a fixed
//! per-message overhead for role names and delimiters. Providers that know
//! their tokenizer better can override [`Provider::estimate_tokens`].

use std::sync::Arc;

use fastrag_core::message::ConversationTurn;
use fastrag_core::provider::Provider;
use fastrag_core::token::{MESSAGE_OVERHEAD_TOKENS, estimate_tokens};

/// Counts tokens for the assembler.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;

    /// Cost of `text` sent as a standalone chat message.
    fn estimate_message(&self, text: &str) -> usize {
        MESSAGE_OVERHEAD_TOKENS + self.estimate(text)
    }

    fn estimate_turns(&self, turns: &[ConversationTurn]) -> usize {
        turns.iter().map(|t| self.estimate_message(&t.text)).sum()
    }
}

/// The character heuristic.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> usize {
        estimate_tokens(text)
    }
}

/// Delegates to the provider's own estimate.
pub struct ProviderEstimator(pub Arc<dyn Provider>);

impl TokenEstimator for ProviderEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.0.estimate_tokens(text)
    }
}
