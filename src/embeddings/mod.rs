//! Embedder abstraction (C1).
//!
//! Grounded in `rag/core/mod.rs::BaseEmbedding` from the teacher crate,
//! narrowed to the single trait spec'd in §4.1 and extended with usage
//! reporting.

use async_trait::async_trait;

use crate::conversation::Usage;
use crate::error::CoreError;

/// Maps text to a fixed-dimension, unit-scale vector. Stateless and safe to
/// call concurrently.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Stable identifier for this embedder (model name or similar).
    fn id(&self) -> &str;

    /// Declared output dimensionality. `embed`'s result always has this
    /// length.
    fn dimensions(&self) -> usize;

    /// Embed a single text. Fails with `CoreError::EmptyInput` for `""`.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CoreError> {
        let (v, _) = self.embed_with_usage(text).await?;
        Ok(v)
    }

    /// Embed a single text, also reporting token usage for the call.
    async fn embed_with_usage(&self, text: &str) -> Result<(Vec<f32>, Usage), CoreError>;

    /// Embed many texts in one call. Default implementation embeds
    /// sequentially; backends with batch APIs should override.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }
}

/// A deterministic embedder for tests: derives a unit vector from a hash of
/// the input text. Never calls out to a network.
pub struct MockEmbedder {
    dims: usize,
    id: String,
}

impl MockEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            id: format!("mock-{dims}"),
        }
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn id(&self) -> &str {
        &self.id
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed_with_usage(&self, text: &str) -> Result<(Vec<f32>, Usage), CoreError> {
        if text.is_empty() {
            return Err(CoreError::EmptyInput);
        }
        let mut state: u64 = 1469598103934665603; // FNV offset basis
        for byte in text.bytes() {
            state ^= byte as u64;
            state = state.wrapping_mul(1099511628211);
        }
        let mut vec = Vec::with_capacity(self.dims);
        let mut s = state;
        for i in 0..self.dims {
            // Mix in the index so every dimension differs deterministically.
            s = s.wrapping_add((i as u64).wrapping_mul(2654435761) + 1);
            s ^= s >> 33;
            s = s.wrapping_mul(0xff51afd7ed558ccd);
            s ^= s >> 33;
            let v = ((s % 2001) as f32 - 1000.0) / 1000.0;
            vec.push(v);
        }
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vec.iter_mut() {
                *v /= norm;
            }
        }
        let usage = Usage {
            input_tokens: text.split_whitespace().count() as u64,
            output_tokens: 0,
            reasoning_tokens: 0,
        };
        Ok((vec, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embed_length_matches_dimensions() {
        let e = MockEmbedder::new(16);
        let v = e.embed("hello there").await.unwrap();
        assert_eq!(v.len(), 16);
    }

    #[tokio::test]
    async fn embed_empty_fails() {
        let e = MockEmbedder::new(16);
        let err = e.embed("").await.unwrap_err();
        assert!(matches!(err, CoreError::EmptyInput));
    }

    #[tokio::test]
    async fn embed_is_deterministic() {
        let e = MockEmbedder::new(8);
        let a = e.embed("same text").await.unwrap();
        let b = e.embed("same text").await.unwrap();
        assert_eq!(a, b);
        let c = e.embed("different text").await.unwrap();
        assert_ne!(a, c);
    }
}
