//! Embedding generation
//!
//! This module provides an abstraction over embedding models with:
//! - A trait for different embedding backends
//! - HTTP embedding backend
//! - A deterministic offline hashing embedder
//! - Optional local models via fastembed (`local-embed` feature)

mod hashing;
mod http_backend;

#[cfg(feature = "local-embed")]
mod fastembed_impl;

pub use hashing::HashingEmbedder;
pub use http_backend::HttpEmbedder;

#[cfg(feature = "local-embed")]
pub use fastembed_impl::FastEmbedder;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

pub fn normalize_embedding(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|v| v / norm).collect()
}

/// Trait for embedding providers
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input in order
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.backend.as_str() {
        "http" => Ok(Arc::new(HttpEmbedder::new(config)?)),
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.dimension))),
        #[cfg(feature = "local-embed")]
        "fastembed" => Ok(Arc::new(FastEmbedder::new(config)?)),
        other => Err(Error::Config(format!(
            "Unsupported embedding backend '{}'",
            other
        ))),
    }
}

/// Embed in fixed-size batches, checking the provider returned one vector per text
pub async fn embed_in_batches(
    embedder: &dyn Embedder,
    texts: Vec<String>,
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut all_embeddings = Vec::with_capacity(texts.len());

    for chunk in texts.chunks(batch_size.max(1)) {
        let embeddings = embedder.embed(chunk.to_vec()).await?;
        if embeddings.len() != chunk.len() {
            return Err(Error::Embedding(format!(
                "Provider returned {} vectors for {} texts",
                embeddings.len(),
                chunk.len()
            )));
        }
        all_embeddings.extend(embeddings);
    }

    Ok(all_embeddings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_batch_splitting() {
        let embedder = HashingEmbedder::new(16);
        let texts: Vec<String> = (0..10).map(|i| format!("text {}", i)).collect();
        let vectors = embed_in_batches(&embedder, texts, 3).await.unwrap();

        assert_eq!(vectors.len(), 10);
        assert!(vectors.iter().all(|v| v.len() == 16));
    }

    #[test]
    fn test_normalize_zero_vector() {
        assert_eq!(normalize_embedding(&[0.0, 0.0]), vec![0.0, 0.0]);
        let unit = normalize_embedding(&[3.0, 4.0]);
        assert!((unit[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_create_embedder_rejects_unknown_backend() {
        let config = EmbeddingConfig {
            backend: "word2vec".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());
    }
}
