//! Storage traits for conversation history and notes.
//!
//! The RAG pipeline only talks to storage through these traits.
//! Implementations live in `fastrag-memory` (in-memory and SQLite).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::message::{Conversation, ConversationId, ConversationTurn, OwnerId, Role, TurnOrigin};
use crate::note::{Note, NoteEvent, NoteUpdate};

type StoreResult<T> = std::result::Result<T, StoreError>;

/// A `skip`/`limit` window over a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub skip: usize,
    pub limit: usize,
}

impl Page {
    pub const DEFAULT_LIMIT: usize = 100;
    pub const MAX_LIMIT: usize = 1000;

    /// Build a page, filling in defaults and capping `limit` at [`Page::MAX_LIMIT`].
    pub fn new(skip: Option<usize>, limit: Option<usize>) -> Self {
        Self {
            skip: skip.unwrap_or(0),
            limit: limit.unwrap_or(Self::DEFAULT_LIMIT).min(Self::MAX_LIMIT),
        }
    }

    /// Cut this page out of an already ordered list.
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items.into_iter().skip(self.skip).take(self.limit).collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Append-only conversation log.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create the conversation for `owner_id` if it does not exist yet.
    ///
    /// Fails with [`StoreError::OwnerMismatch`] when it exists under another owner.
    async fn ensure_conversation(
        &self,
        conversation_id: &ConversationId,
        owner_id: &OwnerId,
    ) -> StoreResult<Conversation>;

    /// Persist a new turn and return its ID.
    async fn append_turn(
        &self,
        conversation_id: &ConversationId,
        role: Role,
        text: &str,
    ) -> StoreResult<String> {
        self.append_turn_from(conversation_id, role, text, None).await
    }

    /// Persist a new turn tagged with the provider and model it was
    /// exchanged with, and return its ID.
    ///
    /// `created_at` is strictly increasing within a conversation.
    async fn append_turn_from(
        &self,
        conversation_id: &ConversationId,
        role: Role,
        text: &str,
        origin: Option<&TurnOrigin>,
    ) -> StoreResult<String>;

    /// The `k` most recent turns, oldest first.
    async fn get_recent(
        &self,
        conversation_id: &ConversationId,
        k: usize,
    ) -> StoreResult<Vec<ConversationTurn>>;

    /// The full conversation, oldest first.
    async fn get_history(&self, conversation_id: &ConversationId) -> StoreResult<Vec<ConversationTurn>>;

    /// One page of the conversation, oldest first.
    async fn get_history_page(
        &self,
        conversation_id: &ConversationId,
        page: Page,
    ) -> StoreResult<Vec<ConversationTurn>> {
        Ok(page.apply(self.get_history(conversation_id).await?))
    }
}

/// CRUD over notes with change notifications.
#[async_trait]
pub trait NoteStore: Send + Sync {
    /// An owner's notes, most recently updated first.
    async fn list_notes(&self, owner_id: &OwnerId) -> StoreResult<Vec<Note>>;

    /// One page of [`list_notes`](NoteStore::list_notes).
    async fn list_notes_page(&self, owner_id: &OwnerId, page: Page) -> StoreResult<Vec<Note>> {
        Ok(page.apply(self.list_notes(owner_id).await?))
    }

    /// Every owner with at least one note, sorted.
    async fn list_owners(&self) -> StoreResult<Vec<OwnerId>>;

    async fn get_note(&self, note_id: &str) -> StoreResult<Option<Note>>;

    async fn create_note(&self, note: Note) -> StoreResult<Note>;

    /// Replace the editable fields. Clears the stored embedding and moves
    /// `updated_at` strictly forward.
    async fn update_note(&self, note_id: &str, update: NoteUpdate) -> StoreResult<Note>;

    /// Delete and return the note.
    async fn delete_note(&self, note_id: &str) -> StoreResult<Note>;

    /// Remember the embedding computed for the note version stamped
    /// `computed_for` (its `updated_at`).
    ///
    /// Returns `false` and stores nothing when the note has changed since.
    async fn record_embedding(
        &self,
        note_id: &str,
        embedding: &[f32],
        computed_for: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Receive an event for every create, update and delete.
    fn subscribe(&self) -> broadcast::Receiver<NoteEvent>;
}
