//! Transient retrieval and prompt types. Never persisted.

use serde::{Deserialize, Serialize};

use crate::message::ConversationTurn;

/// Where a context chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkSource {
    Note,
    History,
    Document,
}

impl ChunkSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkSource::Note => "note",
            ChunkSource::History => "history",
            ChunkSource::Document => "document",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "note" => Some(ChunkSource::Note),
            "history" => Some(ChunkSource::History),
            "document" => Some(ChunkSource::Document),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChunkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A piece of retrieved context with its relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextChunk {
    pub source: ChunkSource,

    /// Note ID, turn ID, or document chunk ID
    pub source_id: String,

    pub text: String,

    /// Absent for history turns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    pub relevance_score: f32,
}

impl ContextChunk {
    pub fn new(
        source: ChunkSource,
        source_id: impl Into<String>,
        text: impl Into<String>,
        relevance_score: f32,
    ) -> Self {
        Self {
            source,
            source_id: source_id.into(),
            text: text.into(),
            embedding: None,
            relevance_score,
        }
    }
}

/// A provider-agnostic prompt that already fits the model's input budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub system_preamble: String,

    /// Highest priority first
    pub context: Vec<ContextChunk>,

    /// Chronological
    pub history_window: Vec<ConversationTurn>,

    pub user_query: String,

    pub total_token_estimate: usize,
}

impl Prompt {
    /// The system prompt with the context section appended, as sent to providers.
    pub fn render_system(&self) -> String {
        let mut out = self.system_preamble.clone();
        let section = render_context_section(&self.context);
        if !section.is_empty() {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&section);
        }
        out
    }
}

/// Header that opens the context section of the system prompt.
pub const CONTEXT_HEADER: &str =
    "Use the following context to answer the user's question when it is relevant:\n";

/// Render one context chunk as it appears in the system prompt.
pub fn render_chunk(chunk: &ContextChunk) -> String {
    format!("[{}:{}] {}\n", chunk.source, chunk.source_id, chunk.text)
}

/// Render the whole context section, or an empty string when there is none.
pub fn render_context_section(chunks: &[ContextChunk]) -> String {
    if chunks.is_empty() {
        return String::new();
    }
    let mut out = String::from(CONTEXT_HEADER);
    for chunk in chunks {
        out.push_str(&render_chunk(chunk));
    }
    out
}
