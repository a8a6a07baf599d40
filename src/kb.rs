//! Knowledge bases
//!
//! A knowledge base is a vector collection plus the embedding function,
//! optional reranker and column layout used to turn rows into chunks and
//! search hits back into rows.

use crate::ast::{BinaryOp, Expr, Using};
use crate::config::{Config, EmbeddingConfig};
use crate::embed::{create_embedder, embed_in_batches, Embedder};
use crate::error::{Error, PlanError, Result};
use crate::rank::Ranker;
use crate::rerank::{create_reranker, Reranker};
use crate::value::{Batch, Field, Row, Schema, Value};
use crate::vector::{
    content_hash, sort_hits, DocumentChunk, FilterOp, MetadataFilter, SearchHit, VectorStore,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Column layout and search options, parsed from `CREATE KNOWLEDGE_BASE ... USING`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBaseDef {
    /// Joined with a newline, in this order, to form the embedded text
    pub content_columns: Vec<String>,
    pub id_column: Option<String>,
    /// Empty = every column that is neither content nor id goes to `metadata`
    pub metadata_columns: Vec<String>,
    pub hybrid_search: bool,
    /// BM25 weight `w` in `(1 - w) * vector + w * bm25`
    pub keyword_weight: f32,
    pub reranking: bool,
    pub embedding: EmbeddingConfig,
}

fn string_list(value: &JsonValue, key: &str) -> Result<Vec<String>> {
    match value {
        JsonValue::String(s) => Ok(vec![s.clone()]),
        JsonValue::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(String::from)
                    .ok_or_else(|| Error::Config(format!("{} must list column names", key)))
            })
            .collect(),
        _ => Err(Error::Config(format!("{} must be a string or list", key))),
    }
}

impl KnowledgeBaseDef {
    pub fn from_using(using: &Using, config: &Config) -> Result<Self> {
        let mut def = Self {
            content_columns: vec!["content".to_string()],
            id_column: None,
            metadata_columns: Vec::new(),
            hybrid_search: config.knowledge_base.hybrid_search,
            keyword_weight: config.knowledge_base.keyword_weight,
            reranking: config.reranker.enabled,
            embedding: config.embedding.clone(),
        };

        for (key, value) in using {
            match key.to_lowercase().as_str() {
                "content_columns" => def.content_columns = string_list(value, key)?,
                "id_column" => {
                    def.id_column = Some(
                        value
                            .as_str()
                            .ok_or_else(|| Error::Config("id_column must be a string".into()))?
                            .to_string(),
                    )
                }
                "metadata_columns" => def.metadata_columns = string_list(value, key)?,
                "hybrid_search" => {
                    def.hybrid_search = value
                        .as_bool()
                        .ok_or_else(|| Error::Config("hybrid_search must be a boolean".into()))?
                }
                "hybrid_search_alpha" | "keyword_weight" => {
                    let w = value
                        .as_f64()
                        .ok_or_else(|| Error::Config(format!("{} must be a number", key)))?;
                    if !(0.0..=1.0).contains(&w) {
                        return Err(Error::Config(format!("{} must be within 0..=1", key)));
                    }
                    def.keyword_weight = w as f32;
                    def.hybrid_search = true;
                }
                "reranking_model" | "reranking" => {
                    def.reranking = match value {
                        JsonValue::Bool(b) => *b,
                        JsonValue::Null => false,
                        _ => true,
                    }
                }
                "embedding_model" => apply_embedding_override(&mut def.embedding, value)?,
                other => warn!("Ignoring unknown knowledge base option '{}'", other),
            }
        }

        if def.content_columns.is_empty() {
            return Err(Error::Config("content_columns must not be empty".into()));
        }
        Ok(def)
    }
}

/// `embedding_model = {provider | backend, model_name, dimension, base_url}`
fn apply_embedding_override(embedding: &mut EmbeddingConfig, value: &JsonValue) -> Result<()> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::Config("embedding_model must be a map".into()))?;
    for (key, v) in obj {
        match key.as_str() {
            "provider" | "backend" => {
                embedding.backend = v.as_str().unwrap_or_default().to_lowercase()
            }
            "model_name" | "model" => embedding.model = v.as_str().unwrap_or_default().to_string(),
            "dimension" => {
                embedding.dimension = v
                    .as_u64()
                    .filter(|d| *d > 0)
                    .ok_or_else(|| Error::Config("dimension must be a positive integer".into()))?
                    as usize
            }
            "base_url" => embedding.backend_url = v.as_str().unwrap_or_default().to_string(),
            other => debug!("Ignoring embedding_model option '{}'", other),
        }
    }
    Ok(())
}

/// One row that could not be written
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowFailure {
    pub row_id: String,
    pub reason: String,
}

/// Outcome of a write; partial success is normal
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteSummary {
    pub inserted: usize,
    pub unchanged: usize,
    pub failures: Vec<RowFailure>,
}

impl WriteSummary {
    pub fn merge(&mut self, other: WriteSummary) {
        self.inserted += other.inserted;
        self.unchanged += other.unchanged;
        self.failures.extend(other.failures);
    }
}

pub struct KnowledgeBase {
    name: String,
    def: KnowledgeBaseDef,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    ranker: Ranker,
    rerank_factor: usize,
    batch_size: usize,
}

impl KnowledgeBase {
    /// Build providers from the definition and open (or create) the collection
    pub async fn open(
        name: &str,
        def: KnowledgeBaseDef,
        store: Arc<dyn VectorStore>,
        config: &Config,
    ) -> Result<Self> {
        let embedder = create_embedder(&def.embedding)?;
        let reranker = if def.reranking {
            let mut reranker_config = config.reranker.clone();
            reranker_config.enabled = true;
            create_reranker(&reranker_config, &def.embedding)?
        } else {
            None
        };
        Self::with_providers(name, def, store, embedder, reranker, config.reranker.rerank_factor)
            .await
    }

    pub async fn with_providers(
        name: &str,
        def: KnowledgeBaseDef,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        rerank_factor: usize,
    ) -> Result<Self> {
        store.ensure_collection(name, embedder.dimension()).await?;
        info!(
            "Knowledge base '{}' ready ({} dims, model {})",
            name,
            embedder.dimension(),
            embedder.model_name()
        );
        Ok(Self {
            name: name.to_string(),
            ranker: Ranker::new(def.keyword_weight),
            batch_size: def.embedding.batch_size,
            def,
            store,
            embedder,
            reranker,
            rerank_factor: rerank_factor.max(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn def(&self) -> &KnowledgeBaseDef {
        &self.def
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn has_reranker(&self) -> bool {
        self.reranker.is_some()
    }

    /// `id, content, <metadata columns>, metadata, relevance, distance`
    pub fn schema(&self) -> Schema {
        let mut names = vec!["id".to_string(), "content".to_string()];
        names.extend(self.def.metadata_columns.iter().cloned());
        names.extend(["metadata", "relevance", "distance"].map(String::from));
        Schema::new(names.into_iter().map(Field::new).collect())
    }

    /// Canonical chunk field for a column of this knowledge base, if filterable
    fn filter_field(&self, column: &str) -> Option<String> {
        if column.eq_ignore_ascii_case("id") {
            return Some("id".to_string());
        }
        if column.eq_ignore_ascii_case("content") {
            return Some("content".to_string());
        }
        self.def
            .metadata_columns
            .iter()
            .find(|m| m.eq_ignore_ascii_case(column))
            .cloned()
    }

    /// Translate one conjunct into a metadata filter. `None` = evaluate it
    /// after the search (relevance, distance, the metadata blob, anything
    /// non-trivial).
    pub fn metadata_filter(&self, expr: &Expr) -> Option<MetadataFilter> {
        let literal = |e: &Expr| match e {
            Expr::Literal(v) => Some(v.clone()),
            _ => None,
        };
        let column = |e: &Expr| match e {
            Expr::Column(c) => self.filter_field(&c.name),
            _ => None,
        };
        match expr {
            Expr::Binary { left, op, right } if op.is_comparison() => {
                let (field, op, value) = match (column(left), literal(right)) {
                    (Some(f), Some(v)) => (f, *op, v),
                    _ => (column(right)?, op.flipped(), literal(left)?),
                };
                let op = match op {
                    BinaryOp::Eq => FilterOp::Eq,
                    BinaryOp::NotEq => FilterOp::NotEq,
                    BinaryOp::Lt => FilterOp::Lt,
                    BinaryOp::LtEq => FilterOp::LtEq,
                    BinaryOp::Gt => FilterOp::Gt,
                    _ => FilterOp::GtEq,
                };
                Some(MetadataFilter::Compare { field, op, value })
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => Some(MetadataFilter::In {
                field: column(expr)?,
                values: list.iter().map(literal).collect::<Option<Vec<_>>>()?,
                negated: *negated,
            }),
            Expr::Like {
                expr,
                pattern,
                negated,
            } => match literal(pattern)? {
                Value::Text(pattern) => Some(MetadataFilter::Like {
                    field: column(expr)?,
                    pattern,
                    negated: *negated,
                }),
                _ => None,
            },
            Expr::IsNull { expr, negated } => Some(MetadataFilter::IsNull {
                field: column(expr)?,
                negated: *negated,
            }),
            _ => None,
        }
    }

    /// Semantic search: embed, over-fetch when a second ranking pass follows,
    /// blend keyword scores if hybrid, rerank, keep the best `k`
    pub async fn search(
        &self,
        query: &str,
        filters: &[MetadataFilter],
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        let embedding = self
            .embedder
            .embed(vec![query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("provider returned no vector".to_string()))?;

        let second_pass = self.reranker.is_some() || self.def.hybrid_search;
        let fetch_k = if second_pass {
            k.saturating_mul(self.rerank_factor)
        } else {
            k
        };
        let mut hits = self
            .store
            .search(&self.name, &embedding, fetch_k, filters)
            .await?;
        debug!("{}: {} candidates for k={}", self.name, hits.len(), k);

        hits = if self.def.hybrid_search {
            self.ranker.rank_hybrid(query, hits)
        } else {
            self.ranker.rank_vector_only(hits)
        };
        if let Some(reranker) = &self.reranker {
            hits = self.rerank(reranker.as_ref(), query, hits).await?;
        }
        hits.truncate(k);
        Ok(hits)
    }

    /// Search ranking every chunk in the collection
    pub async fn search_all(&self, query: &str, filters: &[MetadataFilter]) -> Result<Vec<SearchHit>> {
        let count = self.store.stats(&self.name).await?.count;
        self.search(query, filters, count.max(1)).await
    }

    async fn rerank(
        &self,
        reranker: &dyn Reranker,
        query: &str,
        hits: Vec<SearchHit>,
    ) -> Result<Vec<SearchHit>> {
        if hits.is_empty() {
            return Ok(hits);
        }
        let documents = hits.iter().map(|h| h.chunk.content.clone()).collect();
        let results = reranker.rerank(query, documents).await?;
        let mut slots: Vec<Option<SearchHit>> = hits.into_iter().map(Some).collect();
        let mut reranked: Vec<SearchHit> = results
            .into_iter()
            .filter_map(|r| {
                slots.get_mut(r.index)?.take().map(|mut hit| {
                    hit.score = r.score;
                    hit
                })
            })
            .collect();
        sort_hits(&mut reranked);
        Ok(reranked)
    }

    /// Filtered chunks in insertion order, no relevance
    pub async fn scan(&self, filters: &[MetadataFilter], limit: Option<usize>) -> Result<Vec<DocumentChunk>> {
        self.store.scan(&self.name, filters, limit).await
    }

    fn chunk_row(&self, chunk: &DocumentChunk, relevance: Option<f32>) -> Row {
        let mut row = vec![Value::Text(chunk.id.clone()), Value::Text(chunk.content.clone())];
        for column in &self.def.metadata_columns {
            row.push(chunk.field(column));
        }
        row.push(Value::Json(JsonValue::Object(chunk.metadata.clone())));
        match relevance {
            Some(r) => {
                row.push(Value::Float(r as f64));
                row.push(Value::Float(1.0 - r as f64));
            }
            None => {
                row.push(Value::Null);
                row.push(Value::Null);
            }
        }
        row
    }

    pub fn hits_to_batch(&self, hits: &[SearchHit]) -> Batch {
        Batch::new(
            self.schema(),
            hits.iter()
                .map(|h| self.chunk_row(&h.chunk, Some(h.score)))
                .collect(),
        )
    }

    pub fn chunks_to_batch(&self, chunks: &[DocumentChunk]) -> Batch {
        Batch::new(
            self.schema(),
            chunks.iter().map(|c| self.chunk_row(c, None)).collect(),
        )
    }

    /// Upsert rows as chunks. Missing content columns fail the statement;
    /// everything that goes wrong for a single row is recorded and skipped.
    pub async fn write(&self, batch: &Batch) -> Result<WriteSummary> {
        let layout = RowLayout::resolve(&self.def, &batch.schema)?;
        let mut summary = WriteSummary::default();

        // Build candidate chunks
        let mut pending: Vec<DocumentChunk> = Vec::with_capacity(batch.len());
        for (index, row) in batch.rows.iter().enumerate() {
            match layout.chunk(index, row) {
                Ok(chunk) => pending.push(chunk),
                Err(reason) => {
                    warn!("{}: skipping row {}: {}", self.name, index, reason);
                    summary.failures.push(RowFailure {
                        row_id: layout.row_id(index, row),
                        reason,
                    });
                }
            }
        }
        if pending.is_empty() {
            return Ok(summary);
        }

        // Reuse embeddings whose content is unchanged
        let ids: Vec<String> = pending.iter().map(|c| c.id.clone()).collect();
        let existing: HashMap<String, DocumentChunk> = self
            .store
            .get(&self.name, &ids)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut to_embed = Vec::new();
        let mut ready = Vec::new();
        for mut chunk in pending {
            match existing.get(&chunk.id) {
                Some(old) if old.content_hash == chunk.content_hash => {
                    if old.metadata == chunk.metadata {
                        summary.unchanged += 1;
                    } else {
                        chunk.embedding = old.embedding.clone();
                        ready.push(chunk);
                    }
                }
                _ => to_embed.push(chunk),
            }
        }

        let embedded = self.embed_chunks(to_embed, &mut summary).await;
        ready.extend(embedded);

        if !ready.is_empty() {
            summary.inserted += ready.len();
            self.store.insert(&self.name, ready).await?;
        }
        info!(
            "{}: {} written, {} unchanged, {} failed",
            self.name,
            summary.inserted,
            summary.unchanged,
            summary.failures.len()
        );
        Ok(summary)
    }

    /// Embed in batches; a failed batch falls back to one call per row so a
    /// single bad row only costs itself
    async fn embed_chunks(
        &self,
        chunks: Vec<DocumentChunk>,
        summary: &mut WriteSummary,
    ) -> Vec<DocumentChunk> {
        let dimension = self.embedder.dimension();
        let mut done = Vec::with_capacity(chunks.len());

        for group in chunks.chunks(self.batch_size.max(1)) {
            let texts: Vec<String> = group.iter().map(|c| c.content.clone()).collect();
            let vectors = match embed_in_batches(self.embedder.as_ref(), texts, group.len()).await {
                Ok(vectors) => vectors.into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => {
                    warn!("{}: batch embedding failed, retrying per row: {}", self.name, e);
                    let mut per_row = Vec::with_capacity(group.len());
                    for chunk in group {
                        per_row.push(
                            self.embedder
                                .embed(vec![chunk.content.clone()])
                                .await
                                .and_then(|mut v| {
                                    v.pop().ok_or_else(|| {
                                        Error::Embedding("provider returned no vector".into())
                                    })
                                }),
                        );
                    }
                    per_row
                }
            };

            for (chunk, vector) in group.iter().zip(vectors) {
                match vector {
                    Ok(v) if v.len() == dimension => {
                        let mut chunk = chunk.clone();
                        chunk.embedding = v;
                        done.push(chunk);
                    }
                    Ok(v) => summary.failures.push(RowFailure {
                        row_id: chunk.id.clone(),
                        reason: format!("embedding has {} dimensions, expected {}", v.len(), dimension),
                    }),
                    Err(e) => summary.failures.push(RowFailure {
                        row_id: chunk.id.clone(),
                        reason: e.to_string(),
                    }),
                }
            }
        }
        done
    }

    /// Remove chunks by id
    pub async fn delete(&self, ids: &[String]) -> Result<usize> {
        self.store.delete(&self.name, ids).await
    }
}

/// Where content, id and metadata live in an incoming batch
struct RowLayout {
    content: Vec<usize>,
    id: Option<usize>,
    metadata: Vec<(String, usize)>,
    relation: Option<String>,
}

impl RowLayout {
    fn resolve(def: &KnowledgeBaseDef, schema: &Schema) -> Result<Self> {
        let find = |name: &str| -> Result<usize> {
            schema
                .fields
                .iter()
                .position(|f| f.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| PlanError::UnknownColumn(name.to_string()).into())
        };
        let content = def
            .content_columns
            .iter()
            .map(|c| find(c))
            .collect::<Result<Vec<_>>>()?;
        let id = def.id_column.as_deref().map(find).transpose()?;

        let metadata = if def.metadata_columns.is_empty() {
            schema
                .fields
                .iter()
                .enumerate()
                .filter(|(i, _)| !content.contains(i) && Some(*i) != id)
                .map(|(i, f)| (f.name.clone(), i))
                .collect()
        } else {
            def.metadata_columns
                .iter()
                .map(|m| Ok((m.clone(), find(m)?)))
                .collect::<Result<Vec<_>>>()?
        };

        let relation = content
            .first()
            .and_then(|i| schema.fields[*i].relation.clone());
        Ok(Self {
            content,
            id,
            metadata,
            relation,
        })
    }

    fn row_id(&self, index: usize, row: &Row) -> String {
        self.id
            .and_then(|i| row[i].to_text())
            .unwrap_or_else(|| format!("row {}", index))
    }

    fn chunk(&self, index: usize, row: &Row) -> std::result::Result<DocumentChunk, String> {
        let content = self
            .content
            .iter()
            .filter_map(|i| row[*i].to_text())
            .collect::<Vec<_>>()
            .join("\n");
        if content.trim().is_empty() {
            return Err("empty content".to_string());
        }

        let id = match self.id {
            Some(i) => row[i].to_text().ok_or_else(|| "missing id".to_string())?,
            None => content_hash(&content)[..16].to_string(),
        };

        let metadata: Map<String, JsonValue> = self
            .metadata
            .iter()
            .filter(|(_, i)| !row[*i].is_null())
            .map(|(name, i)| (name.clone(), row[*i].to_json()))
            .collect();

        let mut chunk = DocumentChunk::new(id, content, Vec::new()).with_metadata(metadata);
        chunk.source_ref = self
            .relation
            .as_ref()
            .map(|r| format!("{}#{}", r, index));
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashingEmbedder;
    use crate::vector::MemoryVectorStore;
    use async_trait::async_trait;
    use serde_json::json;

    fn def(using: JsonValue) -> KnowledgeBaseDef {
        let mut config = Config::default();
        config.embedding.backend = "hashing".to_string();
        config.embedding.dimension = 64;
        KnowledgeBaseDef::from_using(using.as_object().unwrap(), &config).unwrap()
    }

    async fn kb(using: JsonValue) -> KnowledgeBase {
        KnowledgeBase::with_providers(
            "kb",
            def(using),
            Arc::new(MemoryVectorStore::new()),
            Arc::new(HashingEmbedder::new(64)),
            None,
            4,
        )
        .await
        .unwrap()
    }

    fn rows(names: &[&str], rows: Vec<Row>) -> Batch {
        Batch::new(Schema::from_names(names), rows)
    }

    #[test]
    fn test_def_parsing() {
        let d = def(json!({
            "content_columns": ["title", "body"],
            "id_column": "doc_id",
            "metadata_columns": "lang",
            "hybrid_search_alpha": 0.6
        }));
        assert_eq!(d.content_columns, vec!["title", "body"]);
        assert_eq!(d.metadata_columns, vec!["lang"]);
        assert!(d.hybrid_search);
        assert!((d.keyword_weight - 0.6).abs() < 1e-6);

        let config = Config::default();
        let bad = json!({"keyword_weight": 2.0});
        assert!(KnowledgeBaseDef::from_using(bad.as_object().unwrap(), &config).is_err());
    }

    #[tokio::test]
    async fn test_write_then_search_exact_content() {
        let kb = kb(json!({})).await;
        let summary = kb
            .write(&rows(&["content"], vec![vec![Value::from("hello")]]))
            .await
            .unwrap();
        assert_eq!(summary.inserted, 1);

        let hits = kb.search("hello", &[], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_search_all_ranks_every_chunk() {
        let kb = kb(json!({"id_column": "id"})).await;
        let batch = rows(
            &["id", "content"],
            (0..12)
                .map(|i| vec![Value::from(format!("d{}", i).as_str()), Value::from(format!("note {}", i).as_str())])
                .collect(),
        );
        kb.write(&batch).await.unwrap();

        let hits = kb.search_all("note 3", &[]).await.unwrap();
        assert_eq!(hits.len(), 12);
        assert_eq!(hits[0].chunk.id, "d3");
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_unchanged_content_is_not_rewritten() {
        let kb = kb(json!({"id_column": "id"})).await;
        let batch = rows(
            &["id", "content", "lang"],
            vec![vec![Value::from("a"), Value::from("first"), Value::from("en")]],
        );
        kb.write(&batch).await.unwrap();
        let again = kb.write(&batch).await.unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.unchanged, 1);
    }

    #[tokio::test]
    async fn test_bad_rows_are_recorded_not_fatal() {
        let kb = kb(json!({"id_column": "id"})).await;
        let summary = kb
            .write(&rows(
                &["id", "content"],
                vec![
                    vec![Value::from("a"), Value::from("ok")],
                    vec![Value::from("b"), Value::Null],
                    vec![Value::Null, Value::from("no id")],
                ],
            ))
            .await
            .unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.failures.len(), 2);
        assert_eq!(summary.failures[0].row_id, "b");
        assert_eq!(summary.failures[1].row_id, "row 2");
    }

    #[tokio::test]
    async fn test_missing_content_column_is_fatal() {
        let kb = kb(json!({})).await;
        let err = kb
            .write(&rows(&["body"], vec![vec![Value::from("x")]]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Plan(PlanError::UnknownColumn(_))));
    }

    struct FlakyEmbedder(HashingEmbedder);

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.contains("poison")) {
                return Err(Error::Embedding("rejected input".to_string()));
            }
            self.0.embed(texts).await
        }

        fn dimension(&self) -> usize {
            self.0.dimension()
        }

        fn model_name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_batch_failure_falls_back_per_row() {
        let kb = KnowledgeBase::with_providers(
            "kb",
            def(json!({})),
            Arc::new(MemoryVectorStore::new()),
            Arc::new(FlakyEmbedder(HashingEmbedder::new(64))),
            None,
            4,
        )
        .await
        .unwrap();
        let summary = kb
            .write(&rows(
                &["content"],
                vec![
                    vec![Value::from("fine one")],
                    vec![Value::from("poison pill")],
                    vec![Value::from("fine two")],
                ],
            ))
            .await
            .unwrap();
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.failures.len(), 1);
        assert!(summary.failures[0].reason.contains("rejected"));
    }

    #[tokio::test]
    async fn test_metadata_filter_translation() {
        let kb = kb(json!({"metadata_columns": ["lang"]})).await;
        assert_eq!(
            kb.metadata_filter(&Expr::eq(Expr::col("LANG"), Expr::lit("en"))),
            Some(MetadataFilter::eq("lang", "en"))
        );
        assert_eq!(
            kb.metadata_filter(&Expr::binary(Expr::lit(3), BinaryOp::Lt, Expr::col("lang"))),
            Some(MetadataFilter::Compare {
                field: "lang".to_string(),
                op: FilterOp::Gt,
                value: Value::Int(3),
            })
        );
        assert!(kb
            .metadata_filter(&Expr::binary(Expr::col("relevance"), BinaryOp::Gt, Expr::lit(0.5)))
            .is_none());
    }
}
