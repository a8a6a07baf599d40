//! Local embeddings through fastembed (`local-embed` feature)

use super::Embedder;
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

fn local_model(name: &str) -> Option<EmbeddingModel> {
    Some(match name {
        "BAAI/bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
        "BAAI/bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
        "BAAI/bge-large-en-v1.5" => EmbeddingModel::BGELargeENV15,
        "sentence-transformers/all-MiniLM-L6-v2" => EmbeddingModel::AllMiniLML6V2,
        _ => return None,
    })
}

pub struct FastEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
    model_name: String,
    dimension: usize,
}

impl FastEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = local_model(&config.model).ok_or_else(|| {
            Error::Config(format!("Model '{}' is not available through fastembed", config.model))
        })?;

        info!("Loading local embedding model {}", config.model);
        // fastembed reports through anyhow
        let model = TextEmbedding::try_new(InitOptions::new(model))?;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            model_name: config.model.clone(),
            dimension: config.resolved_dimension(),
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Embedding {} texts locally", texts.len());

        let model = self.model.clone();
        let embedded = tokio::task::spawn_blocking(move || model.blocking_lock().embed(texts, None))
            .await
            .map_err(|e| Error::Embedding(format!("embedding task panicked: {}", e)))?;
        embedded.map_err(|e| Error::Embedding(e.to_string()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_model_rejected() {
        let config = EmbeddingConfig {
            backend: "fastembed".to_string(),
            model: "nope/nope".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(FastEmbedder::new(&config).is_err());
    }

    // Requires model download
    #[tokio::test]
    #[ignore]
    async fn test_fastembed_integration() {
        let config = EmbeddingConfig {
            backend: "fastembed".to_string(),
            ..EmbeddingConfig::default()
        };
        let embedder = FastEmbedder::new(&config).unwrap();
        let embeddings = embedder
            .embed(vec!["Hello world".to_string()])
            .await
            .unwrap();
        assert_eq!(embeddings[0].len(), 384);
    }
}
