//! Prompt assembly under a token budget.
//!
//! The budget is `max_context_tokens − max_output_tokens`. The preamble and
//! the user query are reserved first and never trimmed; the rest is filled
//! with retrieved chunks in descending relevance order.
//!
//! # Determinism
//!
//! Assembly is a pure function of its inputs. Chunks are ordered with a
//! stable sort on `f32::total_cmp`, so equal scores keep retrieval order.
//!
//! # Monotonic drop
//!
//! Filling stops at the first chunk that does not fit. The included chunks
//! are therefore always a prefix of the ranked list, and a tighter budget
//! only ever removes the lowest-relevance ones.

use std::sync::Arc;

use fastrag_core::context::{CONTEXT_HEADER, ChunkSource, ContextChunk, Prompt, render_chunk};
use fastrag_core::error::AssemblyError;
use fastrag_core::message::ConversationTurn;
use fastrag_core::provider::ProviderConfig;
use serde::Serialize;
use tracing::debug;

use crate::context::token::{HeuristicEstimator, TokenEstimator};

// ── Types ─────────────────────────────────────────────────────────────────

/// What made it into the prompt, and what was left out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssemblyReport {
    pub budget: usize,
    pub reserved_tokens: usize,
    pub context_tokens: usize,
    pub history_tokens: usize,
    pub chunks_included: usize,
    pub chunks_dropped: usize,
    pub tokens_dropped: usize,
}

impl AssemblyReport {
    pub fn total_tokens(&self) -> usize {
        self.reserved_tokens + self.context_tokens + self.history_tokens
    }
}

// ── Assembler ─────────────────────────────────────────────────────────────

/// Builds a [`Prompt`] that fits the model's input budget.
pub struct PromptAssembler {
    estimator: Arc<dyn TokenEstimator>,
}

impl Default for PromptAssembler {
    fn default() -> Self {
        Self::new(Arc::new(HeuristicEstimator))
    }
}

impl PromptAssembler {
    pub fn new(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { estimator }
    }

    /// Assemble a prompt from ranked chunks.
    ///
    /// History chunks whose `source_id` names a turn in `history_window` are
    /// sent as chat turns (chronological); every other chunk is rendered into
    /// the context section of the system prompt.
    pub fn assemble(
        &self,
        system_preamble: &str,
        chunks: Vec<ContextChunk>,
        history_window: &[ConversationTurn],
        user_query: &str,
        config: &ProviderConfig,
    ) -> Result<Prompt, AssemblyError> {
        let (prompt, report) =
            self.assemble_with_report(system_preamble, chunks, history_window, user_query, config)?;
        debug!(
            budget = report.budget,
            total_tokens = report.total_tokens(),
            included = report.chunks_included,
            dropped = report.chunks_dropped,
            tokens_dropped = report.tokens_dropped,
            "Prompt assembled"
        );
        Ok(prompt)
    }

    pub fn assemble_with_report(
        &self,
        system_preamble: &str,
        mut chunks: Vec<ContextChunk>,
        history_window: &[ConversationTurn],
        user_query: &str,
        config: &ProviderConfig,
    ) -> Result<(Prompt, AssemblyReport), AssemblyError> {
        let budget = config.input_budget();

        // ── Reserved: preamble + query ─────────────────────────────────────
        let preamble_tokens = if system_preamble.is_empty() {
            0
        } else {
            self.estimator.estimate_message(system_preamble)
        };
        let query_tokens = self.estimator.estimate_message(user_query);
        let reserved = preamble_tokens + query_tokens;

        if reserved > budget {
            return Err(AssemblyError::BudgetExceeded {
                preamble_tokens,
                query_tokens,
                budget,
            });
        }

        // ── Greedy prefix fill ─────────────────────────────────────────────
        chunks.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));

        let header_tokens = self.estimator.estimate(CONTEXT_HEADER);
        let mut used = reserved;
        let mut report = AssemblyReport {
            budget,
            reserved_tokens: reserved,
            ..Default::default()
        };
        let mut context = Vec::new();
        let mut turn_positions = Vec::new();
        let mut remaining = chunks.into_iter();

        for chunk in remaining.by_ref() {
            let turn_position = (chunk.source == ChunkSource::History)
                .then(|| history_window.iter().position(|t| t.turn_id == chunk.source_id))
                .flatten();

            let cost = match turn_position {
                Some(_) => self.estimator.estimate_message(&chunk.text),
                None if context.is_empty() => {
                    header_tokens + self.estimator.estimate(&render_chunk(&chunk))
                }
                None => self.estimator.estimate(&render_chunk(&chunk)),
            };

            if used + cost > budget {
                report.chunks_dropped += 1;
                report.tokens_dropped += cost;
                break;
            }

            used += cost;
            report.chunks_included += 1;
            match turn_position {
                Some(pos) => {
                    report.history_tokens += cost;
                    turn_positions.push(pos);
                }
                None => {
                    report.context_tokens += cost;
                    context.push(chunk);
                }
            }
        }

        for chunk in remaining {
            report.chunks_dropped += 1;
            report.tokens_dropped += self.estimator.estimate(&render_chunk(&chunk));
        }

        turn_positions.sort_unstable();
        turn_positions.dedup();
        let history = turn_positions
            .into_iter()
            .map(|pos| history_window[pos].clone())
            .collect();

        let prompt = Prompt {
            system_preamble: system_preamble.to_string(),
            context,
            history_window: history,
            user_query: user_query.to_string(),
            total_token_estimate: used,
        };
        Ok((prompt, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastrag_core::message::{ConversationId, Role};

    const PREAMBLE: &str = "You are a helpful AI assistant.";

    fn config(max_context_tokens: usize, max_output_tokens: usize) -> ProviderConfig {
        ProviderConfig {
            max_context_tokens,
            max_output_tokens,
            ..Default::default()
        }
    }

    fn note(id: &str, text: &str, score: f32) -> ContextChunk {
        ContextChunk::new(ChunkSource::Note, id, text, score)
    }

    fn ranked_notes(n: usize) -> Vec<ContextChunk> {
        (0..n)
            .map(|i| {
                note(
                    &format!("n{i}"),
                    &format!("fact number {i} about the topic at hand"),
                    1.0 - i as f32 * 0.05,
                )
            })
            .collect()
    }

    fn ids(prompt: &Prompt) -> Vec<String> {
        prompt.context.iter().map(|c| c.source_id.clone()).collect()
    }

    #[test]
    fn empty_context_is_preamble_and_query() {
        let assembler = PromptAssembler::default();
        let prompt = assembler
            .assemble(PREAMBLE, vec![], &[], "What is 2+2?", &config(8192, 1024))
            .unwrap();
        assert!(prompt.context.is_empty());
        assert!(prompt.history_window.is_empty());
        assert_eq!(prompt.render_system(), PREAMBLE);
        assert_eq!(prompt.user_query, "What is 2+2?");
        // (31 chars → 8) + 4, (12 chars → 3) + 4
        assert_eq!(prompt.total_token_estimate, 19);
    }

    #[test]
    fn chunks_ordered_by_relevance() {
        let chunks = vec![note("low", "a", 0.1), note("high", "b", 0.9), note("mid", "c", 0.5)];
        let prompt = PromptAssembler::default()
            .assemble(PREAMBLE, chunks, &[], "q", &config(8192, 1024))
            .unwrap();
        assert_eq!(ids(&prompt), vec!["high", "mid", "low"]);
    }

    #[test]
    fn equal_scores_keep_input_order() {
        let chunks = vec![note("first", "a", 0.5), note("second", "b", 0.5), note("third", "c", 0.5)];
        let prompt = PromptAssembler::default()
            .assemble(PREAMBLE, chunks, &[], "q", &config(8192, 1024))
            .unwrap();
        assert_eq!(ids(&prompt), vec!["first", "second", "third"]);
    }

    #[test]
    fn oversized_query_is_budget_exceeded() {
        let query = "x".repeat(4000);
        let err = PromptAssembler::default()
            .assemble(PREAMBLE, vec![], &[], &query, &config(1024, 512))
            .unwrap_err();
        let AssemblyError::BudgetExceeded { query_tokens, budget, .. } = err;
        assert_eq!(query_tokens, 1004);
        assert_eq!(budget, 512);
    }

    #[test]
    fn output_budget_covering_window_is_budget_exceeded() {
        let err = PromptAssembler::default()
            .assemble(PREAMBLE, vec![], &[], "hi", &config(1024, 1024))
            .unwrap_err();
        assert!(matches!(err, AssemblyError::BudgetExceeded { budget: 0, .. }));
    }

    #[test]
    fn never_exceeds_budget() {
        let assembler = PromptAssembler::default();
        for max_context in (30..400).step_by(7) {
            let cfg = config(max_context, 10);
            if let Ok((prompt, report)) =
                assembler.assemble_with_report(PREAMBLE, ranked_notes(20), &[], "question?", &cfg)
            {
                assert!(prompt.total_token_estimate <= cfg.input_budget());
                assert_eq!(prompt.total_token_estimate, report.total_tokens());
                assert_eq!(report.chunks_included + report.chunks_dropped, 20);
            }
        }
    }

    #[test]
    fn tighter_budget_only_drops_lowest_relevance() {
        let assembler = PromptAssembler::default();
        let mut previous: Option<Vec<String>> = None;
        for max_context in (40..500).rev().step_by(5) {
            let prompt = match assembler.assemble(
                PREAMBLE,
                ranked_notes(15),
                &[],
                "question?",
                &config(max_context, 10),
            ) {
                Ok(p) => p,
                Err(_) => break,
            };
            let included = ids(&prompt);
            let expected_prefix: Vec<String> =
                (0..included.len()).map(|i| format!("n{i}")).collect();
            assert_eq!(included, expected_prefix);
            if let Some(prev) = &previous {
                assert!(included.len() <= prev.len());
                assert_eq!(&prev[..included.len()], &included[..]);
            }
            previous = Some(included);
        }
    }

    #[test]
    fn stops_at_first_chunk_that_does_not_fit() {
        // The big chunk overflows; the small one after it would fit but is
        // still dropped so the result stays a prefix.
        let chunks = vec![
            note("small", "tiny", 0.9),
            note("big", &"word ".repeat(200), 0.8),
            note("tail", "tiny", 0.1),
        ];
        let (prompt, report) = PromptAssembler::default()
            .assemble_with_report(PREAMBLE, chunks, &[], "q", &config(120, 20))
            .unwrap();
        assert_eq!(ids(&prompt), vec!["small"]);
        assert_eq!(report.chunks_dropped, 2);
    }

    #[test]
    fn header_is_charged_once() {
        let one = PromptAssembler::default()
            .assemble_with_report(PREAMBLE, vec![note("a", "alpha", 0.9)], &[], "q", &config(8192, 0))
            .unwrap()
            .1;
        let two = PromptAssembler::default()
            .assemble_with_report(
                PREAMBLE,
                vec![note("a", "alpha", 0.9), note("b", "alpha", 0.8)],
                &[],
                "q",
                &config(8192, 0),
            )
            .unwrap()
            .1;
        let header = HeuristicEstimator.estimate(CONTEXT_HEADER);
        let per_chunk = one.context_tokens - header;
        assert_eq!(two.context_tokens, header + 2 * per_chunk);
    }

    #[test]
    fn history_chunks_become_chronological_turns() {
        let conv = ConversationId::from("c1");
        let history = vec![
            ConversationTurn::new(conv.clone(), Role::User, "My name is Ada."),
            ConversationTurn::new(conv.clone(), Role::Assistant, "Nice to meet you, Ada."),
        ];
        // Newest first, as the retriever ranks them.
        let chunks = vec![
            ContextChunk::new(ChunkSource::History, &history[1].turn_id, &history[1].text, 0.8),
            ContextChunk::new(ChunkSource::History, &history[0].turn_id, &history[0].text, 0.8),
            note("n1", "Ada wrote the first program", 0.6),
        ];

        let prompt = PromptAssembler::default()
            .assemble(PREAMBLE, chunks, &history, "What is my name?", &config(8192, 1024))
            .unwrap();

        assert_eq!(prompt.history_window.len(), 2);
        assert_eq!(prompt.history_window[0].text, "My name is Ada.");
        assert_eq!(prompt.history_window[1].role, Role::Assistant);
        assert_eq!(ids(&prompt), vec!["n1"]);
    }

    #[test]
    fn unmatched_history_chunk_stays_in_context() {
        let chunk = ContextChunk::new(ChunkSource::History, "gone", "an old remark", 0.8);
        let prompt = PromptAssembler::default()
            .assemble(PREAMBLE, vec![chunk], &[], "q", &config(8192, 1024))
            .unwrap();
        assert!(prompt.history_window.is_empty());
        assert_eq!(ids(&prompt), vec!["gone"]);
        assert!(prompt.render_system().contains("[history:gone] an old remark"));
    }

    #[test]
    fn same_input_same_prompt() {
        let assembler = PromptAssembler::default();
        let a = assembler
            .assemble(PREAMBLE, ranked_notes(8), &[], "q", &config(200, 20))
            .unwrap();
        let b = assembler
            .assemble(PREAMBLE, ranked_notes(8), &[], "q", &config(200, 20))
            .unwrap();
        assert_eq!(a, b);
    }
}
