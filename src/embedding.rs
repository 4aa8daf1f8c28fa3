//! Embedding provider seam.
//!
//! Vectors are produced outside the subsystem and treated as opaque. The service only
//! calls the provider to fill in missing embeddings and to embed text references for
//! similarity search. A provider that errors or times out never fails a store, but
//! one that hands back an empty or non-finite vector does.

use crate::error::{MemoryError, Result};
use crate::types::validate_embedding;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;
    fn dimension(&self) -> usize;

    /// One vector per input text, in order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single text under a deadline
pub(crate) async fn embed_one(
    provider: &dyn EmbeddingProvider,
    text: &str,
    timeout: Duration,
) -> Result<Vec<f32>> {
    let texts = [text.to_string()];
    let mut vectors = tokio::time::timeout(timeout, provider.embed(&texts))
        .await
        .map_err(|_| MemoryError::Timeout(format!("embedding provider '{}'", provider.name())))??;
    if vectors.len() != 1 {
        return Err(MemoryError::Validation(format!(
            "embedding provider '{}' returned {} vectors for 1 text",
            provider.name(),
            vectors.len()
        )));
    }
    let vector = vectors.remove(0);
    validate_embedding(&vector).map_err(|e| match e {
        MemoryError::Validation(reason) => {
            MemoryError::Validation(format!("embedding provider '{}': {reason}", provider.name()))
        }
        other => other,
    })?;
    Ok(vector)
}

/// Deterministic bag-of-words hashing embedder for development and tests.
///
/// Tokens are lowercased and hashed (FNV-1a) into buckets, then L2-normalised. Texts
/// sharing words score high under cosine similarity. No network, no model.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dimension: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hash = 0xcbf2_9ce4_8422_2325u64;
            for b in token.to_lowercase().bytes() {
                hash ^= b as u64;
                hash = hash.wrapping_mul(0x0100_0000_01b3);
            }
            vector[(hash % self.dimension as u64) as usize] += 1.0;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

impl Default for HashEmbeddingProvider {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    fn name(&self) -> &str {
        "hash"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::cosine_similarity;

    #[test]
    fn same_words_embed_identically_regardless_of_case() {
        let provider = HashEmbeddingProvider::new(64);
        let a = provider.embed_text("Deploy the Service");
        let b = provider.embed_text("deploy the service");
        assert_eq!(a, b);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_text_is_the_zero_vector() {
        let provider = HashEmbeddingProvider::new(8);
        assert!(provider.embed_text("  ").iter().all(|v| *v == 0.0));
    }

    #[tokio::test]
    async fn embed_one_returns_a_single_vector() {
        let provider = HashEmbeddingProvider::new(16);
        let v = embed_one(&provider, "hello world", Duration::from_secs(1)).await.unwrap();
        assert_eq!(v.len(), 16);
    }

    struct BrokenProvider(Vec<f32>);

    #[async_trait]
    impl EmbeddingProvider for BrokenProvider {
        fn name(&self) -> &str {
            "broken"
        }

        fn dimension(&self) -> usize {
            self.0.len()
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| self.0.clone()).collect())
        }
    }

    #[tokio::test]
    async fn embed_one_rejects_invalid_vectors() {
        for vector in [vec![0.5, f32::NAN], vec![f32::INFINITY], Vec::new()] {
            let err = embed_one(&BrokenProvider(vector), "text", Duration::from_secs(1))
                .await
                .unwrap_err();
            match err {
                MemoryError::Validation(reason) => assert!(reason.contains("broken"), "{reason}"),
                other => panic!("expected a validation error, got {other:?}"),
            }
        }
    }
}
