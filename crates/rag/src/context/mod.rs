//! Prompt assembly: fitting ranked context into the model's input budget.

pub mod assembler;
pub mod token;

pub use assembler::{AssemblyReport, PromptAssembler};
pub use token::{HeuristicEstimator, ProviderEstimator, TokenEstimator};
