//! The fastrag pipeline: retrieve context, assemble a prompt, generate an
//! answer, persist the exchange.
//!
//! 1. **Retrieve** the owner's most similar notes and the latest turns
//! 2. **Assemble** them with the preamble and query under a token budget
//! 3. **Generate** through the configured provider
//! 4. **Persist** the user and assistant turns
//!
//! [`ConversationOrchestrator`] runs these steps as a per-turn state machine.

pub mod cancel;
pub mod context;
pub mod locks;
pub mod orchestrator;
pub mod retriever;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use cancel::CancelToken;
pub use context::{AssemblyReport, PromptAssembler, TokenEstimator};
pub use locks::ConversationLocks;
pub use orchestrator::{
    ContextRef, ConversationOrchestrator, TurnError, TurnEvent, TurnOptions, TurnOverrides,
    TurnResponse, TurnResult, TurnState,
};
pub use retriever::{ContextRetriever, RetrievalParams, RetrievedContext};
