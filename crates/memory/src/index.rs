//! In-process embedding index with exact cosine search.
//!
//! Entries are keyed by ID and carry the owner and source they came from so
//! that queries can be restricted (e.g. "this owner's notes only").
//!
//! Embeddings are computed before the write lock is taken; the locked section
//! is a single map insert or removal. Queries take the read lock, so a
//! reader never observes a half-written entry.

use std::collections::HashMap;
use std::sync::Arc;

use fastrag_core::context::ChunkSource;
use fastrag_core::embedding::Embedder;
use fastrag_core::error::IndexError;
use fastrag_core::message::OwnerId;
use tokio::sync::RwLock;
use tracing::debug;

use crate::vector::cosine_similarity;

#[derive(Debug, Clone)]
struct IndexEntry {
    owner_id: Option<OwnerId>,
    source: ChunkSource,
    text: String,
    embedding: Vec<f32>,
    /// Monotonic update counter, used to break score ties (newest first)
    seq: u64,
}

#[derive(Default)]
struct IndexState {
    entries: HashMap<String, IndexEntry>,
    next_seq: u64,
}

/// Restricts which entries a query may return.
#[derive(Debug, Clone, Default)]
pub struct IndexFilter {
    pub owner_id: Option<OwnerId>,
    pub source: Option<ChunkSource>,
}

impl IndexFilter {
    /// Only notes owned by `owner_id`.
    pub fn notes_of(owner_id: &OwnerId) -> Self {
        Self {
            owner_id: Some(owner_id.clone()),
            source: Some(ChunkSource::Note),
        }
    }

    fn matches(&self, entry: &IndexEntry) -> bool {
        if let Some(source) = self.source {
            if entry.source != source {
                return false;
            }
        }
        match &self.owner_id {
            Some(owner) => entry.owner_id.as_ref() == Some(owner),
            None => true,
        }
    }
}

/// A single search result.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub id: String,
    pub score: f32,
    pub source: ChunkSource,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// Metadata attached to an upserted entry.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub owner_id: Option<OwnerId>,
    pub source: ChunkSource,
}

impl Default for EntryMeta {
    fn default() -> Self {
        Self {
            owner_id: None,
            source: ChunkSource::Document,
        }
    }
}

pub struct EmbeddingIndex {
    embedder: Arc<dyn Embedder>,
    dimensions: usize,
    state: RwLock<IndexState>,
}

impl EmbeddingIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        let dimensions = embedder.dimensions();
        Self {
            embedder,
            dimensions,
            state: RwLock::new(IndexState::default()),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Embed `text` and store it under `id`, replacing any prior entry.
    pub async fn upsert(&self, id: &str, text: &str) -> Result<Vec<f32>, IndexError> {
        self.upsert_entry(id, text, EntryMeta::default()).await
    }

    /// Like [`upsert`](Self::upsert), with owner and source metadata.
    ///
    /// Returns the computed embedding so callers can persist it.
    pub async fn upsert_entry(
        &self,
        id: &str,
        text: &str,
        meta: EntryMeta,
    ) -> Result<Vec<f32>, IndexError> {
        let embedding = self.embedder.embed_one(text).await?;
        self.upsert_embedding(id, text, embedding.clone(), meta).await?;
        Ok(embedding)
    }

    /// Store a precomputed embedding.
    pub async fn upsert_embedding(
        &self,
        id: &str,
        text: &str,
        embedding: Vec<f32>,
        meta: EntryMeta,
    ) -> Result<(), IndexError> {
        self.check_dimensions(&embedding)?;

        let mut state = self.state.write().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            id.to_string(),
            IndexEntry {
                owner_id: meta.owner_id,
                source: meta.source,
                text: text.to_string(),
                embedding,
                seq,
            },
        );
        debug!(id, seq, "Index entry upserted");
        Ok(())
    }

    /// Remove an entry. Returns whether it existed.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.state.write().await.entries.remove(id).is_some();
        if removed {
            debug!(id, "Index entry removed");
        }
        removed
    }

    /// Top `k` entries by descending similarity to `text`.
    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<(String, f32)>, IndexError> {
        let hits = self.search(text, k, &IndexFilter::default()).await?;
        Ok(hits.into_iter().map(|h| (h.id, h.score)).collect())
    }

    /// Embed `text` and return the top `k` entries matching `filter`.
    pub async fn search(
        &self,
        text: &str,
        k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<IndexHit>, IndexError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query = self.embedder.embed_one(text).await?;
        self.search_embedding(&query, k, filter).await
    }

    /// Top `k` entries matching `filter` for a precomputed query vector.
    ///
    /// Ties are broken by most recent update first, then by ID.
    pub async fn search_embedding(
        &self,
        query: &[f32],
        k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<IndexHit>, IndexError> {
        self.check_dimensions(query)?;

        let state = self.state.read().await;
        let mut scored: Vec<(f32, u64, &String, &IndexEntry)> = state
            .entries
            .iter()
            .filter(|(_, entry)| filter.matches(entry))
            .map(|(id, entry)| (cosine_similarity(&entry.embedding, query), entry.seq, id, entry))
            .collect();

        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| a.2.cmp(b.2))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(score, _, id, entry)| IndexHit {
                id: id.clone(),
                score,
                source: entry.source,
                text: entry.text.clone(),
                embedding: entry.embedding.clone(),
            })
            .collect())
    }

    /// IDs of every entry matching `filter`, sorted.
    pub async fn ids(&self, filter: &IndexFilter) -> Vec<String> {
        let state = self.state.read().await;
        let mut ids: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| filter.matches(entry))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Distinct owners that have at least one entry from `source`.
    pub async fn owners(&self, source: ChunkSource) -> Vec<OwnerId> {
        let state = self.state.read().await;
        let mut owners: Vec<OwnerId> = state
            .entries
            .values()
            .filter(|e| e.source == source)
            .filter_map(|e| e.owner_id.clone())
            .collect();
        owners.sort();
        owners.dedup();
        owners
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.state.read().await.entries.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_dimensions(&self, embedding: &[f32]) -> Result<(), IndexError> {
        if embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: embedding.len(),
            });
        }
        Ok(())
    }
}
