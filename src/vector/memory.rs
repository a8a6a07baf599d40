//! In-process vector store

use super::{
    cosine_similarity, sort_hits, CollectionStats, CompiledFilter, DocumentChunk, MetadataFilter,
    SearchHit, VectorStore,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

struct Collection {
    dimension: usize,
    data: RwLock<CollectionData>,
}

#[derive(Default)]
struct CollectionData {
    /// (insertion sequence, chunk), kept in insertion order
    chunks: Vec<(u64, DocumentChunk)>,
    by_id: HashMap<String, usize>,
    next_seq: u64,
}

impl CollectionData {
    fn reindex(&mut self) {
        self.by_id = self
            .chunks
            .iter()
            .enumerate()
            .map(|(i, (_, c))| (c.id.clone(), i))
            .collect();
    }
}

/// Collections live in memory. Each collection has its own lock: writers to
/// one collection queue behind each other while readers share access.
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, Arc<Collection>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.collections
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownRelation(format!("collection {}", name)))
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()> {
        let mut collections = self.collections.write().await;
        if let Some(existing) = collections.get(name) {
            if existing.dimension != dimension {
                return Err(Error::Execution(format!(
                    "Collection '{}' has dimension {}, requested {}",
                    name, existing.dimension, dimension
                )));
            }
            return Ok(());
        }
        debug!("Creating in-memory collection {} (dim {})", name, dimension);
        collections.insert(
            name.to_string(),
            Arc::new(Collection {
                dimension,
                data: RwLock::new(CollectionData::default()),
            }),
        );
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<bool> {
        Ok(self.collections.write().await.remove(name).is_some())
    }

    async fn insert(&self, collection: &str, chunks: Vec<DocumentChunk>) -> Result<()> {
        let coll = self.collection(collection).await?;
        if let Some(bad) = chunks.iter().find(|c| c.embedding.len() != coll.dimension) {
            return Err(Error::Execution(format!(
                "Vector dimension mismatch for collection '{}': expected {}, got {} (chunk {})",
                collection,
                coll.dimension,
                bad.embedding.len(),
                bad.id
            )));
        }

        let mut data = coll.data.write().await;
        for chunk in chunks {
            match data.by_id.get(&chunk.id).copied() {
                Some(pos) => data.chunks[pos].1 = chunk,
                None => {
                    let seq = data.next_seq;
                    data.next_seq += 1;
                    let pos = data.chunks.len();
                    data.by_id.insert(chunk.id.clone(), pos);
                    data.chunks.push((seq, chunk));
                }
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        embedding: &[f32],
        k: usize,
        filter: &[MetadataFilter],
    ) -> Result<Vec<SearchHit>> {
        let coll = self.collection(collection).await?;
        if embedding.len() != coll.dimension {
            return Err(Error::Execution(format!(
                "Query vector has dimension {}, collection '{}' expects {}",
                embedding.len(),
                collection,
                coll.dimension
            )));
        }
        let compiled = CompiledFilter::new(filter)?;

        let data = coll.data.read().await;
        let mut hits: Vec<SearchHit> = data
            .chunks
            .iter()
            .filter(|(_, c)| compiled.matches(c))
            .map(|(seq, c)| SearchHit {
                score: cosine_similarity(embedding, &c.embedding),
                chunk: c.clone(),
                seq: *seq,
            })
            .collect();
        drop(data);

        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn scan(
        &self,
        collection: &str,
        filter: &[MetadataFilter],
        limit: Option<usize>,
    ) -> Result<Vec<DocumentChunk>> {
        let coll = self.collection(collection).await?;
        let compiled = CompiledFilter::new(filter)?;
        let data = coll.data.read().await;
        Ok(data
            .chunks
            .iter()
            .map(|(_, c)| c)
            .filter(|c| compiled.matches(c))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn get(&self, collection: &str, ids: &[String]) -> Result<Vec<DocumentChunk>> {
        let coll = self.collection(collection).await?;
        let data = coll.data.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| data.by_id.get(id).map(|&pos| data.chunks[pos].1.clone()))
            .collect())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize> {
        let coll = self.collection(collection).await?;
        let mut data = coll.data.write().await;
        let before = data.chunks.len();
        data.chunks.retain(|(_, c)| !ids.contains(&c.id));
        let removed = before - data.chunks.len();
        if removed > 0 {
            data.reindex();
        }
        Ok(removed)
    }

    async fn stats(&self, collection: &str) -> Result<CollectionStats> {
        let coll = self.collection(collection).await?;
        let count = coll.data.read().await.chunks.len();
        Ok(CollectionStats {
            name: collection.to_string(),
            dimension: coll.dimension,
            count,
        })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store_with(chunks: Vec<DocumentChunk>) -> MemoryVectorStore {
        let store = MemoryVectorStore::new();
        store.ensure_collection("docs", 2).await.unwrap();
        store.insert("docs", chunks).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_search_returns_top_k_descending() {
        let store = store_with(vec![
            DocumentChunk::new("a", "a", vec![1.0, 0.0]),
            DocumentChunk::new("b", "b", vec![0.0, 1.0]),
            DocumentChunk::new("c", "c", vec![0.7, 0.7]),
        ])
        .await;

        let hits = store.search("docs", &[1.0, 0.1], 2, &[]).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, "a");
        assert_eq!(hits[1].chunk.id, "c");
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_search_is_deterministic_on_ties() {
        let store = store_with(vec![
            DocumentChunk::new("x", "x", vec![1.0, 0.0]),
            DocumentChunk::new("y", "y", vec![1.0, 0.0]),
            DocumentChunk::new("z", "z", vec![1.0, 0.0]),
        ])
        .await;

        let first = store.search("docs", &[1.0, 0.0], 3, &[]).await.unwrap();
        let second = store.search("docs", &[1.0, 0.0], 3, &[]).await.unwrap();
        assert_eq!(first, second);
        let ids: Vec<_> = first.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y", "z"]);
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_and_keeps_position() {
        let store = store_with(vec![
            DocumentChunk::new("a", "first", vec![1.0, 0.0]),
            DocumentChunk::new("b", "second", vec![0.0, 1.0]),
        ])
        .await;
        store
            .insert("docs", vec![DocumentChunk::new("a", "first v2", vec![1.0, 0.0])])
            .await
            .unwrap();

        let all = store.scan("docs", &[], None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "a");
        assert_eq!(all[0].content, "first v2");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let store = store_with(Vec::new()).await;
        let err = store
            .insert("docs", vec![DocumentChunk::new("a", "a", vec![1.0, 0.0, 0.0])])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));
        assert!(store.ensure_collection("docs", 3).await.is_err());
    }

    #[tokio::test]
    async fn test_filtered_search_never_returns_non_matching() {
        let store = store_with(vec![
            DocumentChunk::new("a", "a", vec![1.0, 0.0])
                .with_metadata(json!({"lang": "en"}).as_object().unwrap().clone()),
            DocumentChunk::new("b", "b", vec![1.0, 0.0])
                .with_metadata(json!({"lang": "de"}).as_object().unwrap().clone()),
        ])
        .await;

        let hits = store
            .search("docs", &[1.0, 0.0], 10, &[MetadataFilter::eq("lang", "de")])
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.id, "b");
    }

    #[tokio::test]
    async fn test_delete_and_stats() {
        let store = store_with(vec![
            DocumentChunk::new("a", "a", vec![1.0, 0.0]),
            DocumentChunk::new("b", "b", vec![0.0, 1.0]),
        ])
        .await;
        assert_eq!(store.delete("docs", &["a".to_string()]).await.unwrap(), 1);
        let stats = store.stats("docs").await.unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(store.get("docs", &["b".to_string()]).await.unwrap().len(), 1);
    }
}
