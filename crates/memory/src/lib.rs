//! Storage and retrieval for fastrag: the embedding index, embedders,
//! the note indexer, and history/note stores.

pub mod embedding;
pub mod in_memory;
pub mod index;
pub mod indexer;
pub mod vector;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use embedding::HashEmbedder;
pub use in_memory::{InMemoryHistoryStore, InMemoryNoteStore};
pub use index::{EmbeddingIndex, EntryMeta, IndexFilter, IndexHit};
pub use indexer::{NoteIndexer, ResyncReport};
pub use vector::cosine_similarity;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use chrono::{DateTime, Duration, SubsecRound, Utc};

/// Buffered note events per subscriber before it lags.
pub(crate) const NOTE_EVENT_CAPACITY: usize = 256;

/// Timestamp for a new turn or note revision: now, at microsecond
/// precision, bumped past `last` when the clock has not moved on.
pub(crate) fn next_timestamp(last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now().trunc_subsecs(6);
    match last {
        Some(last) if now <= last => last + Duration::microseconds(1),
        _ => now,
    }
}
