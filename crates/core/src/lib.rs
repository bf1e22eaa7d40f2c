//! # fastrag Core
//!
//! Domain types, traits, and error definitions for the fastrag RAG assistant.
//! This crate has **zero framework dependencies** — it defines the domain model
//! that all other crates implement against.
//!
//! Every collaborator of the RAG pipeline (LLM provider, embedder, history
//! store, note store) is a trait here. Implementations live in their
//! respective crates, so tests can swap in fakes.

pub mod context;
pub mod embedding;
pub mod error;
pub mod message;
pub mod note;
pub mod provider;
pub mod store;
pub mod token;

// Re-export key types at crate root for ergonomics
pub use context::{ChunkSource, ContextChunk, Prompt};
pub use embedding::Embedder;
pub use error::{AssemblyError, Error, IndexError, ProviderError, Result, StoreError};
pub use message::{Conversation, ConversationId, ConversationTurn, OwnerId, Role, TurnOrigin};
pub use note::{Note, NoteEvent, NoteUpdate};
pub use provider::{
    Answer, AnswerStream, FinishReason, Provider, ProviderConfig, ProviderFactory, StreamEvent,
    Usage,
};
pub use store::{HistoryStore, NoteStore, Page};
