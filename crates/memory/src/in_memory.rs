//! In-memory stores — useful for testing and ephemeral sessions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use fastrag_core::error::StoreError;
use fastrag_core::message::{
    Conversation, ConversationId, ConversationTurn, OwnerId, Role, TurnOrigin,
};
use fastrag_core::note::{Note, NoteEvent, NoteUpdate};
use fastrag_core::store::{HistoryStore, NoteStore};
use tokio::sync::{RwLock, broadcast};

use crate::{NOTE_EVENT_CAPACITY, next_timestamp};

struct ConversationLog {
    header: Conversation,
    turns: Vec<ConversationTurn>,
}

/// Conversation history kept in a map of per-conversation logs.
pub struct InMemoryHistoryStore {
    conversations: Arc<RwLock<HashMap<ConversationId, ConversationLog>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self {
            conversations: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn ensure_conversation(
        &self,
        conversation_id: &ConversationId,
        owner_id: &OwnerId,
    ) -> Result<Conversation, StoreError> {
        let mut conversations = self.conversations.write().await;
        let log = conversations
            .entry(conversation_id.clone())
            .or_insert_with(|| ConversationLog {
                header: Conversation::new(conversation_id.clone(), owner_id.clone()),
                turns: Vec::new(),
            });

        if &log.header.owner_id != owner_id {
            return Err(StoreError::OwnerMismatch {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(log.header.clone())
    }

    async fn append_turn_from(
        &self,
        conversation_id: &ConversationId,
        role: Role,
        text: &str,
        origin: Option<&TurnOrigin>,
    ) -> Result<String, StoreError> {
        let mut conversations = self.conversations.write().await;
        let log = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;

        let mut turn = ConversationTurn::new(conversation_id.clone(), role, text).with_origin(origin);
        turn.created_at = next_timestamp(log.turns.last().map(|t| t.created_at));
        let id = turn.turn_id.clone();
        log.turns.push(turn);
        Ok(id)
    }

    async fn get_recent(
        &self,
        conversation_id: &ConversationId,
        k: usize,
    ) -> Result<Vec<ConversationTurn>, StoreError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(conversation_id)
            .map(|log| {
                let start = log.turns.len().saturating_sub(k);
                log.turns[start..].to_vec()
            })
            .unwrap_or_default())
    }

    async fn get_history(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ConversationTurn>, StoreError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(conversation_id)
            .map(|log| log.turns.clone())
            .unwrap_or_default())
    }
}

/// Notes kept in a map, with change notifications on a broadcast channel.
pub struct InMemoryNoteStore {
    notes: Arc<RwLock<HashMap<String, Note>>>,
    events: broadcast::Sender<NoteEvent>,
}

impl InMemoryNoteStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(NOTE_EVENT_CAPACITY);
        Self {
            notes: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    fn publish(&self, event: NoteEvent) {
        // No subscribers is fine; the indexer may not be running.
        let _ = self.events.send(event);
    }
}

impl Default for InMemoryNoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NoteStore for InMemoryNoteStore {
    async fn list_notes(&self, owner_id: &OwnerId) -> Result<Vec<Note>, StoreError> {
        let notes = self.notes.read().await;
        let mut owned: Vec<Note> = notes
            .values()
            .filter(|n| &n.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.note_id.cmp(&b.note_id)));
        Ok(owned)
    }

    async fn list_owners(&self) -> Result<Vec<OwnerId>, StoreError> {
        let notes = self.notes.read().await;
        let mut owners: Vec<OwnerId> = notes.values().map(|n| n.owner_id.clone()).collect();
        owners.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        owners.dedup();
        Ok(owners)
    }

    async fn get_note(&self, note_id: &str) -> Result<Option<Note>, StoreError> {
        Ok(self.notes.read().await.get(note_id).cloned())
    }

    async fn create_note(&self, mut note: Note) -> Result<Note, StoreError> {
        note.updated_at = note.updated_at.trunc_subsecs(6);
        {
            let mut notes = self.notes.write().await;
            if notes.contains_key(&note.note_id) {
                return Err(StoreError::Storage(format!(
                    "note {} already exists",
                    note.note_id
                )));
            }
            notes.insert(note.note_id.clone(), note.clone());
        }
        self.publish(NoteEvent::Upserted(note.clone()));
        Ok(note)
    }

    async fn update_note(&self, note_id: &str, update: NoteUpdate) -> Result<Note, StoreError> {
        let updated = {
            let mut notes = self.notes.write().await;
            let note = notes
                .get_mut(note_id)
                .ok_or_else(|| StoreError::NotFound(format!("note {note_id}")))?;
            note.title = update.title;
            note.body = update.body;
            note.tags = update.tags;
            note.url = update.url;
            note.comments = update.comments;
            note.embedding = None;
            note.updated_at = next_timestamp(Some(note.updated_at));
            note.clone()
        };
        self.publish(NoteEvent::Upserted(updated.clone()));
        Ok(updated)
    }

    async fn delete_note(&self, note_id: &str) -> Result<Note, StoreError> {
        let removed = self
            .notes
            .write()
            .await
            .remove(note_id)
            .ok_or_else(|| StoreError::NotFound(format!("note {note_id}")))?;
        self.publish(NoteEvent::Deleted {
            note_id: removed.note_id.clone(),
            owner_id: removed.owner_id.clone(),
        });
        Ok(removed)
    }

    async fn record_embedding(
        &self,
        note_id: &str,
        embedding: &[f32],
        computed_for: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut notes = self.notes.write().await;
        let note = notes
            .get_mut(note_id)
            .ok_or_else(|| StoreError::NotFound(format!("note {note_id}")))?;
        if note.updated_at != computed_for {
            return Ok(false);
        }
        note.embedding = Some(embedding.to_vec());
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<NoteEvent> {
        self.events.subscribe()
    }
}
