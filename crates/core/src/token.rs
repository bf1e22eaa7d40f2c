//! Token estimation heuristic shared by every crate.
//!
//! 1 token ≈ 4 characters, rounded up. Accurate to roughly 10% for BPE
//! tokenizers on English text; providers may override it.

/// Per-message overhead for role names and delimiters in chat wire formats.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Estimate the token count for a string.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    chars.div_ceil(4)
}
