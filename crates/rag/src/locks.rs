//! Per-conversation locks so turns on one conversation never interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use fastrag_core::message::ConversationId;
use tokio::sync::OwnedMutexGuard;

/// Hands out one async mutex per conversation.
///
/// Only weak references are kept, so a conversation's lock is freed as soon
/// as no turn holds or waits on it. Tokio mutexes queue waiters in FIFO
/// order, which keeps turns in arrival order.
#[derive(Default)]
pub struct ConversationLocks {
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `conversation_id`.
    pub async fn acquire(&self, conversation_id: &ConversationId) -> OwnedMutexGuard<()> {
        self.lock_for(conversation_id).lock_owned().await
    }

    fn lock_for(&self, conversation_id: &ConversationId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(conversation_id.as_str()).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(conversation_id.as_str().to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Conversations whose lock is currently held or awaited.
    pub fn active(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.values().filter(|weak| weak.strong_count() > 0).count()
    }
}
