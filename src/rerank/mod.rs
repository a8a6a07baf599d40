//! Reranking support for knowledge base search results

mod http_backend;

pub use http_backend::*;

use crate::config::{EmbeddingConfig, RerankerConfig};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct RerankResult {
    /// Position in the documents passed to `rerank`
    pub index: usize,
    pub score: f32,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, documents: Vec<String>) -> Result<Vec<RerankResult>>;
    fn model_name(&self) -> &str;
}

/// Build the configured reranker, if reranking is enabled. The rerank backend
/// defaults to the embedding sidecar.
pub fn create_reranker(
    config: &RerankerConfig,
    embedding: &EmbeddingConfig,
) -> Result<Option<Arc<dyn Reranker>>> {
    if !config.enabled {
        return Ok(None);
    }
    let url = config
        .backend_url
        .as_deref()
        .unwrap_or(&embedding.backend_url);
    Ok(Some(Arc::new(HttpReranker::new(config, url)?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_reranker_is_none() {
        let reranker = create_reranker(&RerankerConfig::default(), &EmbeddingConfig::default());
        assert!(reranker.unwrap().is_none());
    }

    #[test]
    fn test_enabled_reranker_uses_embedding_url() {
        let config = RerankerConfig {
            enabled: true,
            ..RerankerConfig::default()
        };
        let reranker = create_reranker(&config, &EmbeddingConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(reranker.model_name(), "BAAI/bge-reranker-base");
    }
}
