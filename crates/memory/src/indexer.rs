//! Keeps the embedding index in step with the note store.
//!
//! Two paths: push (apply [`NoteEvent`]s from the store's broadcast channel)
//! and poll (`resync` an owner against `list_notes`). Both are idempotent.

use std::collections::HashSet;
use std::sync::Arc;

use fastrag_core::context::ChunkSource;
use fastrag_core::error::Result;
use fastrag_core::message::OwnerId;
use fastrag_core::note::{Note, NoteEvent};
use fastrag_core::store::NoteStore;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::index::{EmbeddingIndex, EntryMeta, IndexFilter};

/// Outcome of a resync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub indexed: usize,
    /// Reused a stored embedding instead of recomputing
    pub reused: usize,
    pub purged: usize,
}

pub struct NoteIndexer {
    index: Arc<EmbeddingIndex>,
    notes: Arc<dyn NoteStore>,
}

impl NoteIndexer {
    pub fn new(index: Arc<EmbeddingIndex>, notes: Arc<dyn NoteStore>) -> Self {
        Self { index, notes }
    }

    /// Apply one change notification.
    pub async fn apply(&self, event: &NoteEvent) -> Result<()> {
        match event {
            NoteEvent::Upserted(note) => {
                self.index_note(note).await?;
            }
            NoteEvent::Deleted { note_id, .. } => {
                self.index.remove(note_id).await;
                debug!(note_id = %note_id, "Note purged from index");
            }
        }
        Ok(())
    }

    /// Reconcile the index with the store for one owner.
    ///
    /// Indexes every note the owner has and purges index entries for notes
    /// that no longer exist.
    pub async fn resync(&self, owner_id: &OwnerId) -> Result<ResyncReport> {
        let notes = self.notes.list_notes(owner_id).await?;
        let live: HashSet<&str> = notes.iter().map(|n| n.note_id.as_str()).collect();

        let mut report = ResyncReport::default();
        for stale in self.index.ids(&IndexFilter::notes_of(owner_id)).await {
            if !live.contains(stale.as_str()) {
                self.index.remove(&stale).await;
                report.purged += 1;
            }
        }

        for note in &notes {
            if self.index_note(note).await? {
                report.reused += 1;
            } else {
                report.indexed += 1;
            }
        }

        info!(
            owner = %owner_id,
            indexed = report.indexed,
            reused = report.reused,
            purged = report.purged,
            "Note index resynced"
        );
        Ok(report)
    }

    /// Resync every owner the store knows about.
    pub async fn resync_all(&self) -> Result<ResyncReport> {
        let mut total = ResyncReport::default();
        for owner in self.notes.list_owners().await? {
            let report = self.resync(&owner).await?;
            total.indexed += report.indexed;
            total.reused += report.reused;
            total.purged += report.purged;
        }
        Ok(total)
    }

    /// Consume store events until the channel closes.
    ///
    /// Indexing failures are logged and skipped so one bad note cannot stall
    /// the loop; a lagged receiver triggers a resync of every known owner.
    pub async fn run(&self, mut events: broadcast::Receiver<NoteEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = self.apply(&event).await {
                        warn!(error = %e, "Failed to index note change");
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Note indexer lagged; resyncing all owners");
                    // Owners whose last note was deleted only appear in the index.
                    let mut owners = self.index.owners(ChunkSource::Note).await;
                    if let Ok(stored) = self.notes.list_owners().await {
                        owners.extend(stored);
                    }
                    owners.sort_by(|a, b| a.as_str().cmp(b.as_str()));
                    owners.dedup();
                    for owner in owners {
                        if let Err(e) = self.resync(&owner).await {
                            warn!(owner = %owner, error = %e, "Resync after lag failed");
                        }
                    }
                }
                Err(RecvError::Closed) => {
                    debug!("Note event channel closed; indexer stopping");
                    break;
                }
            }
        }
    }

    /// Index a note. Returns true when a stored embedding was reused.
    async fn index_note(&self, note: &Note) -> Result<bool> {
        let meta = EntryMeta {
            owner_id: Some(note.owner_id.clone()),
            source: ChunkSource::Note,
        };
        let text = note.indexed_text();

        if let Some(embedding) = &note.embedding {
            if embedding.len() == self.index.dimensions() {
                self.index
                    .upsert_embedding(&note.note_id, &text, embedding.clone(), meta)
                    .await?;
                return Ok(true);
            }
        }

        let embedding = self.index.upsert_entry(&note.note_id, &text, meta).await?;
        let recorded = self
            .notes
            .record_embedding(&note.note_id, &embedding, note.updated_at)
            .await?;
        if recorded {
            debug!(note_id = %note.note_id, "Note embedded");
        } else {
            // A newer revision exists; its own event or the next resync indexes it.
            debug!(note_id = %note.note_id, "Note changed while embedding, write-back skipped");
        }
        Ok(false)
    }
}
