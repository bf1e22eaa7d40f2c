//! Error types for the fastrag domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`Error`] rolls them up.

use thiserror::Error;

/// The top-level error type for all fastrag operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Embedding index errors ---
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    // --- Storage errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Prompt assembly errors ---
    #[error("Assembly error: {0}")]
    Assembly(#[from] AssemblyError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures an LLM backend can report.
///
/// Adapters translate every transport and HTTP failure into one of these
/// four kinds; raw provider errors never cross the adapter boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Network failure, authentication failure, or a 5xx from the backend.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// The backend asked us to slow down.
    #[error("Rate limited by provider{}", retry_suffix(.retry_after_secs))]
    RateLimited { retry_after_secs: Option<u64> },

    /// The backend refused the request or its content. Never retried.
    #[error("Content rejected: {0}")]
    ContentRejected(String),

    #[error("Request timed out: {0}")]
    Timeout(String),
}

impl ProviderError {
    /// Whether a caller may try the same request again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ContentRejected(_))
    }

    /// Short kind name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "Unavailable",
            Self::RateLimited { .. } => "RateLimited",
            Self::ContentRejected(_) => "ContentRejected",
            Self::Timeout(_) => "Timeout",
        }
    }
}

fn retry_suffix(retry_after_secs: &Option<u64>) -> String {
    match retry_after_secs {
        Some(secs) => format!(", retry after {secs}s"),
        None => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("Embedding computation failed: {0}")]
    EmbeddingComputationFailed(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conversation {conversation_id} belongs to another owner")]
    OwnerMismatch { conversation_id: String },

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Errors from prompt assembly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblyError {
    /// The preamble and user query alone do not fit in the input budget.
    #[error(
        "Budget exceeded: preamble ({preamble_tokens}) + query ({query_tokens}) > budget ({budget})"
    )]
    BudgetExceeded {
        preamble_tokens: usize,
        query_tokens: usize,
        budget: usize,
    },
}
