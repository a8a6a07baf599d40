//! Feature-hashing embedder
//!
//! Deterministic, dependency-free vectors for offline use and tests: each
//! token is hashed with blake3 into a signed bucket, the result L2-normalized.
//! Identical texts embed identically; texts sharing tokens score higher.

use super::{normalize_embedding, Embedder};
use crate::error::Result;
use crate::rank::tokenize;
use async_trait::async_trait;

pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let mut head = [0u8; 8];
            head.copy_from_slice(&bytes[..8]);
            let bucket = (u64::from_le_bytes(head) % self.dimension as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize_embedding(&vector)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "hashing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_similarity;

    #[test]
    fn test_identical_text_is_identical_vector() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed_one("hello world");
        assert_eq!(a, embedder.embed_one("hello world"));
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_tokens_score_higher() {
        let embedder = HashingEmbedder::new(256);
        let q = embedder.embed_one("rust async runtime");
        let near = embedder.embed_one("the tokio async runtime for rust");
        let far = embedder.embed_one("baking sourdough bread");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }
}
