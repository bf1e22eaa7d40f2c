//! Context retrieval: the owner's most similar notes merged with the most
//! recent conversation turns into one ranked chunk list.

use std::collections::HashMap;
use std::sync::Arc;

use fastrag_config::RetrievalConfig;
use fastrag_core::context::{ChunkSource, ContextChunk};
use fastrag_core::error::{Error, IndexError};
use fastrag_core::message::{ConversationId, ConversationTurn, OwnerId};
use fastrag_core::store::HistoryStore;
use fastrag_memory::{EmbeddingIndex, IndexFilter, IndexHit};
use tracing::{debug, warn};

/// Weighting between note similarity and conversation recency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalParams {
    /// Multiplier applied to a note's cosine similarity.
    pub similarity_weight: f32,
    /// Score given to the newest history turn.
    pub history_baseline: f32,
    /// Subtracted from `history_baseline` per turn of age.
    pub recency_decay: f32,
    /// Notes scoring below this are dropped. Zero or less disables the cut.
    pub min_note_score: f32,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

impl From<&RetrievalConfig> for RetrievalParams {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            similarity_weight: config.similarity_weight,
            history_baseline: config.history_baseline,
            recency_decay: config.recency_decay,
            min_note_score: config.min_note_score,
        }
    }
}

/// Output of [`ContextRetriever::retrieve_context`].
#[derive(Debug, Clone, Default)]
pub struct RetrievedContext {
    /// Ranked by descending relevance.
    pub chunks: Vec<ContextChunk>,
    /// The history turns considered, chronological.
    pub turns: Vec<ConversationTurn>,
}

/// Reads the embedding index and the history store. Never writes to either.
pub struct ContextRetriever {
    index: Arc<EmbeddingIndex>,
    history: Arc<dyn HistoryStore>,
    params: RetrievalParams,
}

impl ContextRetriever {
    pub fn new(index: Arc<EmbeddingIndex>, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            index,
            history,
            params: RetrievalParams::default(),
        }
    }

    pub fn with_params(mut self, params: RetrievalParams) -> Self {
        self.params = params;
        self
    }

    pub fn params(&self) -> &RetrievalParams {
        &self.params
    }

    /// Ranked context for `query_text`: up to `k_notes` notes of `owner_id`
    /// and up to `k_history` of the latest turns of `conversation_id`.
    pub async fn retrieve(
        &self,
        conversation_id: &ConversationId,
        owner_id: &OwnerId,
        query_text: &str,
        k_notes: usize,
        k_history: usize,
    ) -> Result<Vec<ContextChunk>, Error> {
        self.retrieve_excluding(conversation_id, owner_id, query_text, k_notes, k_history, None)
            .await
    }

    /// Like [`retrieve`](Self::retrieve), leaving out the turn `exclude_turn`
    /// (the in-flight user message) from the history candidates.
    pub async fn retrieve_excluding(
        &self,
        conversation_id: &ConversationId,
        owner_id: &OwnerId,
        query_text: &str,
        k_notes: usize,
        k_history: usize,
        exclude_turn: Option<&str>,
    ) -> Result<Vec<ContextChunk>, Error> {
        let retrieved = self
            .retrieve_context(conversation_id, owner_id, query_text, k_notes, k_history, exclude_turn)
            .await?;
        Ok(retrieved.chunks)
    }

    /// Ranked chunks together with the history turns they were built from.
    pub async fn retrieve_context(
        &self,
        conversation_id: &ConversationId,
        owner_id: &OwnerId,
        query_text: &str,
        k_notes: usize,
        k_history: usize,
        exclude_turn: Option<&str>,
    ) -> Result<RetrievedContext, Error> {
        let hits = self.search_notes(owner_id, query_text, k_notes).await?;
        let mut chunks: Vec<ContextChunk> = hits
            .into_iter()
            .filter_map(|hit| {
                let score = self.params.similarity_weight * hit.score;
                if self.params.min_note_score > 0.0 && score < self.params.min_note_score {
                    return None;
                }
                let mut chunk = ContextChunk::new(ChunkSource::Note, hit.id, hit.text, score);
                chunk.embedding = Some(hit.embedding);
                Some(chunk)
            })
            .collect();
        let note_count = chunks.len();

        let mut turns = Vec::new();
        if k_history > 0 {
            let fetch = k_history + usize::from(exclude_turn.is_some());
            let recent = self.history.get_recent(conversation_id, fetch).await?;
            turns = recent
                .into_iter()
                .filter(|t| Some(t.turn_id.as_str()) != exclude_turn)
                .collect();
            let excess = turns.len().saturating_sub(k_history);
            turns.drain(..excess);

            // Newest first, so age 0 is the latest turn.
            let history = turns.iter().rev().enumerate().map(|(age, turn)| {
                let score = self.params.history_baseline - self.params.recency_decay * age as f32;
                ContextChunk::new(ChunkSource::History, turn.turn_id.as_str(), turn.text.as_str(), score)
            });
            chunks.extend(history);
        }

        let mut ranked = dedup(chunks);
        ranked.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));

        debug!(
            conversation_id = %conversation_id,
            notes = note_count,
            history = turns.len(),
            chunks = ranked.len(),
            "Context retrieved"
        );
        Ok(RetrievedContext { chunks: ranked, turns })
    }

    /// Similarity search over the owner's notes, retried once on failure.
    async fn search_notes(
        &self,
        owner_id: &OwnerId,
        query_text: &str,
        k_notes: usize,
    ) -> Result<Vec<IndexHit>, IndexError> {
        if k_notes == 0 {
            return Ok(Vec::new());
        }
        let filter = IndexFilter::notes_of(owner_id);
        match self.index.search(query_text, k_notes, &filter).await {
            Ok(hits) => Ok(hits),
            Err(e) => {
                warn!(error = %e, "Note search failed, retrying once");
                self.index.search(query_text, k_notes, &filter).await
            }
        }
    }
}

/// Collapse duplicates by `(source, source_id)`, keeping the higher score at
/// the position of the first occurrence.
fn dedup(chunks: Vec<ContextChunk>) -> Vec<ContextChunk> {
    let mut seen: HashMap<(ChunkSource, String), usize> = HashMap::new();
    let mut out: Vec<ContextChunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let key = (chunk.source, chunk.source_id.clone());
        match seen.get(&key) {
            Some(&idx) => {
                if chunk.relevance_score > out[idx].relevance_score {
                    out[idx] = chunk;
                }
            }
            None => {
                seen.insert(key, out.len());
                out.push(chunk);
            }
        }
    }
    out
}
