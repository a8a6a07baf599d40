//! Configuration management for quarry
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where knowledge base chunks live
    #[serde(default)]
    pub vector_store: VectorStoreConfig,

    /// Embedding model configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Reranker configuration
    #[serde(default)]
    pub reranker: RerankerConfig,

    /// Knowledge base search defaults
    #[serde(default)]
    pub knowledge_base: KnowledgeBaseConfig,

    /// Plan executor limits
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Model and agent invocation
    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// External data sources registered at startup
    #[serde(default, rename = "source", skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceConfig>,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Vector store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    /// "memory" or "qdrant"
    #[serde(default = "default_vector_backend")]
    pub backend: String,

    /// Qdrant connection URL
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,

    /// Environment variable name for Qdrant API key
    #[serde(default = "default_qdrant_api_key_env")]
    pub qdrant_api_key_env: String,

    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,
}

/// Embedding configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// "http", "hashing" or "fastembed"
    #[serde(default = "default_embedding_backend")]
    pub backend: String,

    /// Model name/identifier
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension (must match model)
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Base URL of the embedding backend
    #[serde(default = "default_embedding_backend_url")]
    pub backend_url: String,

    /// Batch size for embedding
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

/// Lookup the expected embedding dimension for a known model
pub fn embedding_dimension_for_model(model: &str) -> Option<usize> {
    match model {
        "BAAI/bge-small-en-v1.5" => Some(384),
        "BAAI/bge-base-en-v1.5" => Some(768),
        "BAAI/bge-large-en-v1.5" => Some(1024),
        "sentence-transformers/all-MiniLM-L6-v2" => Some(384),
        _ => None,
    }
}

impl EmbeddingConfig {
    /// Resolve the effective embedding dimension based on the configured model
    pub fn resolved_dimension(&self) -> usize {
        if self.backend == "hashing" {
            return self.dimension;
        }
        if let Some(expected) = embedding_dimension_for_model(&self.model) {
            if expected != self.dimension {
                warn!(
                    "Embedding dimension {} does not match model '{}' ({}); using {}",
                    self.dimension, self.model, expected, expected
                );
            }
            expected
        } else {
            self.dimension
        }
    }
}

/// Reranker configuration (cross-encoder model for result reranking)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    /// Enable reranking for knowledge bases that don't say otherwise
    #[serde(default = "default_reranker_enabled")]
    pub enabled: bool,

    /// Model name/identifier for cross-encoder reranker
    #[serde(default = "default_reranker_model")]
    pub model: String,

    /// Base URL of the rerank backend; falls back to the embedding backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_url: Option<String>,

    /// Over-fetch multiplier applied before reranking
    #[serde(default = "default_rerank_factor")]
    pub rerank_factor: usize,
}

/// Knowledge base search defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBaseConfig {
    /// Blend BM25 keyword scores into vector relevance
    #[serde(default)]
    pub hybrid_search: bool,

    /// BM25 weight when hybrid is enabled (0.0 - 1.0)
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f32,

    /// Results returned by a search without LIMIT
    #[serde(default = "default_search_k")]
    pub default_k: usize,
}

/// Plan executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Worker pool size per statement
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,

    /// Connection pool size per source adapter
    #[serde(default = "default_source_max_connections")]
    pub source_max_connections: usize,

    /// Retries for transient source failures
    #[serde(default = "default_source_retries")]
    pub source_retries: u32,
}

/// Inference gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Rows per endpoint call
    #[serde(default = "default_inference_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_inference_max_retries")]
    pub max_retries: u32,

    /// Per-call timeout for model endpoints
    #[serde(default = "default_inference_timeout_secs")]
    pub timeout_secs: u64,

    /// Per-call timeout for agents
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,

    /// Calls per second per endpoint
    #[serde(default = "default_inference_rate_limit")]
    pub requests_per_second: u32,

    /// First retry delay; doubled on every further attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Chat completions base URL used by agents that don't name one
    #[serde(default = "default_chat_base_url")]
    pub chat_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Sleep between due-job sweeps in `jobs run`
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Run records kept per job
    #[serde(default = "default_max_run_history")]
    pub max_run_history: usize,
}

/// Kind of a declared external source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// SQLite database file; every table becomes `<name>.<table>`
    Sqlite,
    /// Directory of `*.jsonl` files; every file becomes `<name>.<stem>`
    Jsonl,
}

/// One `[[source]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKind,
    pub path: PathBuf,
    /// Overrides `executor.source_max_connections`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for quarry data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to the SQLite catalog
    pub db_file: PathBuf,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_vector_backend(),
            qdrant_url: default_qdrant_url(),
            qdrant_api_key_env: default_qdrant_api_key_env(),
            collection_prefix: default_collection_prefix(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: default_embedding_backend(),
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            backend_url: default_embedding_backend_url(),
            batch_size: default_embedding_batch_size(),
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            enabled: default_reranker_enabled(),
            model: default_reranker_model(),
            backend_url: None,
            rerank_factor: default_rerank_factor(),
        }
    }
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            hybrid_search: false,
            keyword_weight: default_keyword_weight(),
            default_k: default_search_k(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: default_max_parallel_steps(),
            statement_timeout_secs: default_statement_timeout_secs(),
            source_max_connections: default_source_max_connections(),
            source_retries: default_source_retries(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            batch_size: default_inference_batch_size(),
            max_retries: default_inference_max_retries(),
            timeout_secs: default_inference_timeout_secs(),
            agent_timeout_secs: default_agent_timeout_secs(),
            requests_per_second: default_inference_rate_limit(),
            backoff_base_ms: default_backoff_base_ms(),
            chat_base_url: default_chat_base_url(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_run_history: default_max_run_history(),
        }
    }
}

impl Config {
    /// Get the default base directory for quarry (~/.quarry)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".quarry")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig {
            config_file: base.join("config.toml"),
            db_file: base.join("catalog.db"),
            base_dir: base,
        };
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig {
            config_file: config_path.to_path_buf(),
            db_file: base.join("catalog.db"),
            base_dir: base,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a base directory, falling back to defaults
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::default();
        config.init_paths(base_dir);

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
        } else {
            debug!("No config file found, using defaults");
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Get the Qdrant API key from environment
    pub fn qdrant_api_key(&self) -> Option<String> {
        if self.vector_store.qdrant_api_key_env.is_empty() {
            return None;
        }
        std::env::var(&self.vector_store.qdrant_api_key_env).ok()
    }

    /// Check if quarry is initialized (config and catalog exist)
    pub fn is_initialized(&self) -> bool {
        self.paths.config_file.exists() && self.paths.db_file.exists()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.vector_store.backend.as_str() {
            "memory" | "qdrant" => {}
            other => {
                return Err(Error::Config(format!(
                    "vector_store.backend must be \"memory\" or \"qdrant\", got \"{}\"",
                    other
                )))
            }
        }

        match self.embedding.backend.as_str() {
            "http" | "hashing" => {}
            "fastembed" if cfg!(feature = "local-embed") => {}
            "fastembed" => {
                return Err(Error::Config(
                    "embedding.backend = \"fastembed\" requires the local-embed feature"
                        .to_string(),
                ))
            }
            other => {
                return Err(Error::Config(format!(
                    "Unknown embedding.backend \"{}\"",
                    other
                )))
            }
        }

        if self.embedding.dimension == 0 {
            return Err(Error::Config(
                "embedding.dimension must be positive".to_string(),
            ));
        }

        if self.embedding.batch_size == 0 || self.inference.batch_size == 0 {
            return Err(Error::Config(
                "embedding.batch_size and inference.batch_size must be positive".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.knowledge_base.keyword_weight) {
            return Err(Error::Config(
                "knowledge_base.keyword_weight must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.reranker.rerank_factor == 0 {
            return Err(Error::Config(
                "reranker.rerank_factor must be at least 1".to_string(),
            ));
        }

        if self.executor.max_parallel_steps == 0 || self.executor.source_max_connections == 0 {
            return Err(Error::Config(
                "executor.max_parallel_steps and executor.source_max_connections must be positive"
                    .to_string(),
            ));
        }

        if self.inference.requests_per_second == 0 {
            return Err(Error::Config(
                "inference.requests_per_second must be positive".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.name.to_lowercase()) {
                return Err(Error::Config(format!(
                    "Duplicate source name: {}",
                    source.name
                )));
            }
            if source.name.contains('.') || source.name.is_empty() {
                return Err(Error::Config(format!(
                    "Invalid source name \"{}\": must be non-empty and contain no dots",
                    source.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.vector_store.backend, "memory");
        assert_eq!(config.reranker.rerank_factor, 4);
        assert!((config.knowledge_base.keyword_weight - 0.3).abs() < f32::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        config.executor.max_parallel_steps = 9;
        config.sources.push(SourceConfig {
            name: "crm".to_string(),
            kind: SourceKind::Sqlite,
            path: tmp.path().join("crm.db"),
            max_connections: None,
        });

        config.save().unwrap();
        assert!(config.paths.config_file.exists());

        let loaded = Config::load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(loaded.executor.max_parallel_steps, 9);
        assert_eq!(loaded.sources.len(), 1);
        assert_eq!(loaded.sources[0].kind, SourceKind::Sqlite);
        assert_eq!(loaded.paths.db_file, tmp.path().join("catalog.db"));
    }

    #[test]
    fn test_parse_source_tables() {
        let config: Config = toml::from_str(
            r#"
            [executor]
            statement_timeout_secs = 10

            [[source]]
            name = "files"
            kind = "jsonl"
            path = "/data/files"
            "#,
        )
        .unwrap();
        assert_eq!(config.executor.statement_timeout_secs, 10);
        assert_eq!(config.sources[0].kind, SourceKind::Jsonl);
        assert_eq!(config.inference.batch_size, default_inference_batch_size());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.knowledge_base.keyword_weight = 1.5;
        assert!(config.validate().is_err());
        config.knowledge_base.keyword_weight = 0.5;
        assert!(config.validate().is_ok());

        config.vector_store.backend = "faiss".to_string();
        assert!(config.validate().is_err());
        config.vector_store.backend = "qdrant".to_string();
        assert!(config.validate().is_ok());

        config.executor.max_parallel_steps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_source_names_rejected() {
        let mut config = Config::default();
        for _ in 0..2 {
            config.sources.push(SourceConfig {
                name: "Files".to_string(),
                kind: SourceKind::Jsonl,
                path: PathBuf::from("/tmp"),
                max_connections: None,
            });
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolved_dimension_matches_model() {
        let mut config = Config::default();
        config.embedding.model = "BAAI/bge-base-en-v1.5".to_string();
        config.embedding.dimension = 384;

        assert_eq!(config.embedding.resolved_dimension(), 768);

        config.embedding.backend = "hashing".to_string();
        assert_eq!(config.embedding.resolved_dimension(), 384);
    }
}
