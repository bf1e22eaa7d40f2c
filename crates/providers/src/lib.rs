//! LLM provider adapters for fastrag.
//!
//! All providers implement the `fastrag_core::Provider` trait. The router
//! picks the variant from configuration, and [`RetryingProvider`] wraps it so
//! transient failures never reach the orchestrator unretried.

pub mod anthropic;
pub mod gemini;
pub mod http;
pub mod models;
pub mod openai_compat;
pub mod retry;
pub mod router;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use retry::{RetryPolicy, RetryingProvider};
pub use router::{RouterFactory, build_embedder, build_from_config, build_with_retry};
