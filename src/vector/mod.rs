//! Vector collection storage
//!
//! Named collections of document chunks with insert / search / scan / delete
//! and metadata filtering. Two backends:
//! - [`MemoryVectorStore`], the default, in-process
//! - [`QdrantVectorStore`] over qdrant-client

mod memory;
mod qdrant;

pub use memory::MemoryVectorStore;
pub use qdrant::QdrantVectorStore;

use crate::config::Config;
use crate::error::{PlanError, Result};
use crate::value::{LikePattern, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::cmp::Ordering;
use std::sync::Arc;

/// One embedded piece of a knowledge base
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    /// blake3 of `content`
    pub content_hash: String,
}

impl DocumentChunk {
    pub fn new(id: impl Into<String>, content: impl Into<String>, embedding: Vec<f32>) -> Self {
        let content = content.into();
        Self {
            id: id.into(),
            content_hash: content_hash(&content),
            content,
            embedding,
            metadata: Map::new(),
            source_ref: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, JsonValue>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Value of a filterable field: `id`, `content`, or a metadata key
    pub fn field(&self, name: &str) -> Value {
        match name {
            "id" => Value::Text(self.id.clone()),
            "content" => Value::Text(self.content.clone()),
            _ => self
                .metadata
                .get(name)
                .cloned()
                .map(Value::from_json)
                .unwrap_or(Value::Null),
        }
    }
}

pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// A search result; `seq` is the chunk's insertion sequence in its collection
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk: DocumentChunk,
    pub score: f32,
    pub seq: u64,
}

/// Descending score, ties by insertion order
pub fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.seq.cmp(&b.seq))
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl FilterOp {
    fn accepts(self, ord: Ordering) -> bool {
        match self {
            FilterOp::Eq => ord == Ordering::Equal,
            FilterOp::NotEq => ord != Ordering::Equal,
            FilterOp::Lt => ord == Ordering::Less,
            FilterOp::LtEq => ord != Ordering::Greater,
            FilterOp::Gt => ord == Ordering::Greater,
            FilterOp::GtEq => ord != Ordering::Less,
        }
    }
}

/// Metadata / keyword condition. All conditions of a search are conjoined
/// and never relaxed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataFilter {
    Compare {
        field: String,
        op: FilterOp,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
        negated: bool,
    },
    Like {
        field: String,
        pattern: String,
        negated: bool,
    },
    IsNull {
        field: String,
        negated: bool,
    },
}

impl MetadataFilter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        MetadataFilter::Compare {
            field: field.to_string(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            MetadataFilter::Compare { field, .. }
            | MetadataFilter::In { field, .. }
            | MetadataFilter::Like { field, .. }
            | MetadataFilter::IsNull { field, .. } => field,
        }
    }
}

/// Filters compiled once per search
pub struct CompiledFilter {
    parts: Vec<(MetadataFilter, Option<LikePattern>)>,
}

impl CompiledFilter {
    pub fn new(filters: &[MetadataFilter]) -> std::result::Result<Self, PlanError> {
        let parts = filters
            .iter()
            .map(|f| {
                let like = match f {
                    MetadataFilter::Like { pattern, .. } => Some(LikePattern::new(pattern)?),
                    _ => None,
                };
                Ok((f.clone(), like))
            })
            .collect::<std::result::Result<Vec<_>, PlanError>>()?;
        Ok(Self { parts })
    }

    /// SQL semantics: an unknown (NULL) comparison rejects the chunk
    pub fn matches(&self, chunk: &DocumentChunk) -> bool {
        self.parts.iter().all(|(filter, like)| match filter {
            MetadataFilter::Compare { field, op, value } => chunk
                .field(field)
                .compare(value)
                .is_some_and(|ord| op.accepts(ord)),
            MetadataFilter::In {
                field,
                values,
                negated,
            } => {
                let v = chunk.field(field);
                if v.is_null() {
                    return false;
                }
                let found = values.iter().any(|c| v.sql_eq(c) == Some(true));
                found != *negated
            }
            MetadataFilter::Like { field, negated, .. } => match chunk.field(field).to_text() {
                Some(text) => like.as_ref().is_some_and(|p| p.matches(&text)) != *negated,
                None => false,
            },
            MetadataFilter::IsNull { field, negated } => chunk.field(field).is_null() != *negated,
        })
    }
}

/// Collection-level statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionStats {
    pub name: String,
    pub dimension: usize,
    pub count: usize,
}

/// Backend-neutral collection store
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create or open a collection. Opening with a different dimension fails.
    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()>;

    async fn drop_collection(&self, name: &str) -> Result<bool>;

    /// Upsert by id; a replaced chunk keeps its insertion position
    async fn insert(&self, collection: &str, chunks: Vec<DocumentChunk>) -> Result<()>;

    /// Top `k` by cosine similarity among chunks passing `filter`
    async fn search(
        &self,
        collection: &str,
        embedding: &[f32],
        k: usize,
        filter: &[MetadataFilter],
    ) -> Result<Vec<SearchHit>>;

    /// Filtered chunks in insertion order
    async fn scan(
        &self,
        collection: &str,
        filter: &[MetadataFilter],
        limit: Option<usize>,
    ) -> Result<Vec<DocumentChunk>>;

    async fn get(&self, collection: &str, ids: &[String]) -> Result<Vec<DocumentChunk>>;

    /// Returns how many chunks were removed
    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize>;

    async fn stats(&self, collection: &str) -> Result<CollectionStats>;

    fn backend_name(&self) -> &'static str;
}

/// Cosine similarity in [-1, 1]; zero vectors score 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Open the configured backend
pub async fn create_vector_store(config: &Config) -> Result<Arc<dyn VectorStore>> {
    match config.vector_store.backend.as_str() {
        "qdrant" => Ok(Arc::new(
            QdrantVectorStore::connect(
                &config.vector_store.qdrant_url,
                config.qdrant_api_key(),
                &config.vector_store.collection_prefix,
            )
            .await?,
        )),
        _ => Ok(Arc::new(MemoryVectorStore::new())),
    }
}
