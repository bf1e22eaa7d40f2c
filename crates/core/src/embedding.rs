//! Embedder trait — turns text into fixed-size vectors.

use async_trait::async_trait;

use crate::error::IndexError;

/// Computes embeddings for the embedding index.
///
/// Every vector an embedder returns has exactly [`Embedder::dimensions`]
/// components. Backend failures surface as
/// [`IndexError::EmbeddingComputationFailed`].
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, IndexError>;

    /// Embed a single text.
    async fn embed_one(&self, text: &str) -> std::result::Result<Vec<f32>, IndexError> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| {
            IndexError::EmbeddingComputationFailed(format!(
                "embedder '{}' returned no vectors",
                self.name()
            ))
        })
    }
}
