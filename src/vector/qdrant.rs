//! Qdrant-backed vector store
//!
//! One Qdrant collection per knowledge base, cosine distance. Chunk ids are
//! mapped to v5 UUID point ids; the original id, content, hash and metadata
//! travel in the payload. Filters are pushed to Qdrant where they map onto a
//! keyword match and always re-checked client side.

use super::{
    sort_hits, CollectionStats, CompiledFilter, DocumentChunk, FilterOp, MetadataFilter,
    SearchHit, VectorStore,
};
use crate::error::{Error, Result};
use crate::value::Value;
use async_trait::async_trait;
use qdrant_client::qdrant::{
    value::Kind, vectors_config, vectors_output, Condition,
    CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter,
    GetCollectionInfoResponse, GetPointsBuilder, ListValue, PointId, PointStruct,
    ScrollPointsBuilder, SearchPointsBuilder, Struct, UpsertPointsBuilder, Value as QdrantValue,
    VectorParamsBuilder, VectorsOutput,
};
use qdrant_client::Qdrant;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;

const SCROLL_PAGE: u32 = 256;

pub struct QdrantVectorStore {
    client: Qdrant,
    prefix: String,
}

impl QdrantVectorStore {
    pub async fn connect(url: &str, api_key: Option<String>, prefix: &str) -> Result<Self> {
        debug!("Connecting to Qdrant at {}", url);

        let client = Qdrant::from_url(url)
            .api_key(api_key)
            .skip_compatibility_check()
            .build()
            .map_err(|e| Error::Qdrant(e.to_string()))?;

        Ok(Self {
            client,
            prefix: prefix.to_string(),
        })
    }

    fn physical(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name.replace('.', "_"))
    }

    async fn collection_dimension(&self, physical: &str) -> Result<Option<u64>> {
        let info = self.client.collection_info(physical).await?;
        Ok(extract_vector_size(&info))
    }

    /// Sequence numbers of already stored points, so replacements keep their slot
    async fn existing_seqs(&self, physical: &str, ids: &[PointId]) -> Result<HashMap<String, u64>> {
        let response = self
            .client
            .get_points(GetPointsBuilder::new(physical, ids.to_vec()).with_payload(true))
            .await?;
        Ok(response
            .result
            .into_iter()
            .filter_map(|p| {
                let payload = payload_to_json(p.payload);
                let id = payload.get("chunk_id")?.as_str()?.to_string();
                let seq = payload.get("seq")?.as_u64()?;
                Some((id, seq))
            })
            .collect())
    }
}

pub fn point_id_for(chunk_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes())
}

fn point_id(chunk_id: &str) -> PointId {
    PointId::from(point_id_for(chunk_id).to_string())
}

fn now_seq() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Subset of filters Qdrant can evaluate as keyword matches
fn to_qdrant_filter(filters: &[MetadataFilter]) -> Option<Filter> {
    let mut must = Vec::new();
    for filter in filters {
        if let MetadataFilter::Compare {
            field,
            op: FilterOp::Eq,
            value,
        } = filter
        {
            let key = match field.as_str() {
                "id" => "chunk_id".to_string(),
                "content" => continue,
                other => format!("metadata.{}", other),
            };
            match value {
                Value::Text(s) => must.push(Condition::matches(key, s.clone())),
                Value::Int(i) => must.push(Condition::matches(key, *i)),
                Value::Bool(b) => must.push(Condition::matches(key, *b)),
                _ => {}
            }
        }
    }
    if must.is_empty() {
        None
    } else {
        Some(Filter::must(must))
    }
}

fn chunk_to_point(chunk: DocumentChunk, seq: u64) -> PointStruct {
    let mut payload: HashMap<String, QdrantValue> = HashMap::new();
    payload.insert("chunk_id".to_string(), json_to_qdrant_value(JsonValue::String(chunk.id.clone())));
    payload.insert("content".to_string(), json_to_qdrant_value(JsonValue::String(chunk.content)));
    payload.insert(
        "content_hash".to_string(),
        json_to_qdrant_value(JsonValue::String(chunk.content_hash)),
    );
    payload.insert("seq".to_string(), json_to_qdrant_value(JsonValue::from(seq)));
    if let Some(source_ref) = chunk.source_ref {
        payload.insert("source_ref".to_string(), json_to_qdrant_value(JsonValue::String(source_ref)));
    }
    payload.insert(
        "metadata".to_string(),
        json_to_qdrant_value(JsonValue::Object(chunk.metadata)),
    );
    PointStruct::new(point_id(&chunk.id), chunk.embedding, payload)
}

fn chunk_from_payload(
    payload: HashMap<String, QdrantValue>,
    vectors: Option<VectorsOutput>,
) -> (DocumentChunk, u64) {
    let mut json = payload_to_json(payload);
    let take_str = |json: &mut Map<String, JsonValue>, key: &str| match json.remove(key) {
        Some(JsonValue::String(s)) => Some(s),
        _ => None,
    };
    let id = take_str(&mut json, "chunk_id").unwrap_or_default();
    let content = take_str(&mut json, "content").unwrap_or_default();
    let content_hash = take_str(&mut json, "content_hash").unwrap_or_default();
    let source_ref = take_str(&mut json, "source_ref");
    let seq = json.get("seq").and_then(JsonValue::as_u64).unwrap_or(u64::MAX);
    let metadata = match json.remove("metadata") {
        Some(JsonValue::Object(m)) => m,
        _ => Map::new(),
    };
    let embedding = vectors
        .and_then(|v| v.vectors_options)
        .and_then(|opts| match opts {
            vectors_output::VectorsOptions::Vector(v) => Some(v.data),
            _ => None,
        })
        .unwrap_or_default();

    (
        DocumentChunk {
            id,
            content,
            embedding,
            metadata,
            source_ref,
            content_hash,
        },
        seq,
    )
}

fn payload_to_json(payload: HashMap<String, QdrantValue>) -> Map<String, JsonValue> {
    payload
        .into_iter()
        .map(|(k, v)| (k, json_from_qdrant_value(v)))
        .collect()
}

fn json_to_qdrant_value(v: JsonValue) -> QdrantValue {
    let kind = match v {
        JsonValue::Null => Kind::NullValue(0),
        JsonValue::Bool(b) => Kind::BoolValue(b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Kind::IntegerValue(i),
            None => Kind::DoubleValue(n.as_f64().unwrap_or(0.0)),
        },
        JsonValue::String(s) => Kind::StringValue(s),
        JsonValue::Array(items) => Kind::ListValue(ListValue {
            values: items.into_iter().map(json_to_qdrant_value).collect(),
        }),
        JsonValue::Object(map) => Kind::StructValue(Struct {
            fields: map
                .into_iter()
                .map(|(k, v)| (k, json_to_qdrant_value(v)))
                .collect(),
        }),
    };
    QdrantValue { kind: Some(kind) }
}

/// Convert Qdrant value to serde_json Value
fn json_from_qdrant_value(v: QdrantValue) -> JsonValue {
    match v.kind {
        Some(Kind::NullValue(_)) | None => JsonValue::Null,
        Some(Kind::BoolValue(b)) => JsonValue::Bool(b),
        Some(Kind::IntegerValue(i)) => JsonValue::Number(i.into()),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(d)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Some(Kind::StringValue(s)) => JsonValue::String(s),
        Some(Kind::ListValue(list)) => {
            JsonValue::Array(list.values.into_iter().map(json_from_qdrant_value).collect())
        }
        Some(Kind::StructValue(s)) => JsonValue::Object(
            s.fields
                .into_iter()
                .map(|(k, v)| (k, json_from_qdrant_value(v)))
                .collect(),
        ),
    }
}

fn extract_vector_size(info: &GetCollectionInfoResponse) -> Option<u64> {
    let result = info.result.as_ref()?;
    let config = result.config.as_ref()?;
    let params = config.params.as_ref()?;
    let vectors = params.vectors_config.as_ref()?;
    match vectors.config.as_ref()? {
        vectors_config::Config::Params(p) => Some(p.size),
        // Named vectors are not produced by this store
        vectors_config::Config::ParamsMap(_) => None,
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()> {
        let physical = self.physical(name);
        if self.client.collection_exists(&physical).await? {
            match self.collection_dimension(&physical).await? {
                Some(size) if size as usize != dimension => Err(Error::Qdrant(format!(
                    "Collection '{}' has vector size {}, but {} was requested",
                    physical, size, dimension
                ))),
                Some(_) => Ok(()),
                None => Err(Error::Qdrant(format!(
                    "Collection '{}' uses named vectors which are not supported",
                    physical
                ))),
            }
        } else {
            info!("Creating collection {} with dimension {}", physical, dimension);
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&physical)
                        .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine)),
                )
                .await?;
            Ok(())
        }
    }

    async fn drop_collection(&self, name: &str) -> Result<bool> {
        let physical = self.physical(name);
        if !self.client.collection_exists(&physical).await? {
            return Ok(false);
        }
        info!("Deleting collection {}", physical);
        self.client.delete_collection(&physical).await?;
        Ok(true)
    }

    async fn insert(&self, collection: &str, chunks: Vec<DocumentChunk>) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let physical = self.physical(collection);
        if let Some(size) = self.collection_dimension(&physical).await? {
            if let Some(bad) = chunks.iter().find(|c| c.embedding.len() as u64 != size) {
                return Err(Error::Qdrant(format!(
                    "Vector dimension mismatch for collection '{}': expected {}, got {}",
                    physical,
                    size,
                    bad.embedding.len()
                )));
            }
        }

        let ids: Vec<PointId> = chunks.iter().map(|c| point_id(&c.id)).collect();
        let existing = self.existing_seqs(&physical, &ids).await?;
        let base = now_seq();
        let points: Vec<PointStruct> = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let seq = existing.get(&chunk.id).copied().unwrap_or(base + i as u64);
                chunk_to_point(chunk, seq)
            })
            .collect();

        debug!("Upserting {} points to collection {}", points.len(), physical);
        self.client
            .upsert_points(UpsertPointsBuilder::new(&physical, points).wait(true))
            .await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        embedding: &[f32],
        k: usize,
        filter: &[MetadataFilter],
    ) -> Result<Vec<SearchHit>> {
        let physical = self.physical(collection);
        let compiled = CompiledFilter::new(filter)?;
        let pushed = to_qdrant_filter(filter);
        let mut limit = k.max(1) as u64;

        loop {
            let mut builder = SearchPointsBuilder::new(&physical, embedding.to_vec(), limit)
                .with_payload(true)
                .with_vectors(true);
            if let Some(f) = pushed.clone() {
                builder = builder.filter(f);
            }
            let response = self.client.search_points(builder).await?;
            let raw = response.result.len() as u64;

            let mut hits: Vec<SearchHit> = response
                .result
                .into_iter()
                .map(|p| {
                    let (chunk, seq) = chunk_from_payload(p.payload, p.vectors);
                    SearchHit {
                        chunk,
                        score: p.score,
                        seq,
                    }
                })
                .filter(|h| compiled.matches(&h.chunk))
                .collect();

            // Residual filters dropped some hits and more may exist
            if hits.len() < k && raw == limit {
                limit *= 4;
                continue;
            }
            sort_hits(&mut hits);
            hits.truncate(k);
            return Ok(hits);
        }
    }

    async fn scan(
        &self,
        collection: &str,
        filter: &[MetadataFilter],
        limit: Option<usize>,
    ) -> Result<Vec<DocumentChunk>> {
        let physical = self.physical(collection);
        let compiled = CompiledFilter::new(filter)?;
        let pushed = to_qdrant_filter(filter);
        let mut all: Vec<(DocumentChunk, u64)> = Vec::new();
        let mut offset: Option<PointId> = None;

        loop {
            let mut builder = ScrollPointsBuilder::new(&physical)
                .limit(SCROLL_PAGE)
                .with_payload(true)
                .with_vectors(true);
            if let Some(ref f) = pushed {
                builder = builder.filter(f.clone());
            }
            if let Some(ref o) = offset {
                builder = builder.offset(o.clone());
            }
            let response = self.client.scroll(builder).await?;
            for point in response.result {
                let (chunk, seq) = chunk_from_payload(point.payload, point.vectors);
                if compiled.matches(&chunk) {
                    all.push((chunk, seq));
                }
            }
            offset = response.next_page_offset;
            if offset.is_none() {
                break;
            }
        }

        all.sort_by_key(|(_, seq)| *seq);
        Ok(all
            .into_iter()
            .map(|(c, _)| c)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn get(&self, collection: &str, ids: &[String]) -> Result<Vec<DocumentChunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let physical = self.physical(collection);
        let point_ids: Vec<PointId> = ids.iter().map(|id| point_id(id)).collect();
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(&physical, point_ids)
                    .with_payload(true)
                    .with_vectors(true),
            )
            .await?;
        Ok(response
            .result
            .into_iter()
            .map(|p| chunk_from_payload(p.payload, p.vectors).0)
            .collect())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let physical = self.physical(collection);
        let present = self.get(collection, ids).await?.len();
        let point_ids: Vec<PointId> = ids.iter().map(|id| point_id(id)).collect();
        self.client
            .delete_points(DeletePointsBuilder::new(&physical).points(point_ids).wait(true))
            .await?;
        Ok(present)
    }

    async fn stats(&self, collection: &str) -> Result<CollectionStats> {
        let physical = self.physical(collection);
        let dimension = self.collection_dimension(&physical).await?.unwrap_or(0) as usize;
        let count = self
            .client
            .count(CountPointsBuilder::new(&physical).exact(true))
            .await?
            .result
            .map(|r| r.count)
            .unwrap_or(0) as usize;
        Ok(CollectionStats {
            name: collection.to_string(),
            dimension,
            count,
        })
    }

    fn backend_name(&self) -> &'static str {
        "qdrant"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qdrant_client::qdrant::point_id::PointIdOptions;
    use serde_json::json;

    fn point_id_to_uuid(id: &PointId) -> Option<Uuid> {
        match &id.point_id_options {
            Some(PointIdOptions::Uuid(uuid_str)) => Uuid::try_parse(uuid_str).ok(),
            _ => None,
        }
    }

    #[test]
    fn test_point_ids_are_stable() {
        assert_eq!(point_id_for("doc-1"), point_id_for("doc-1"));
        assert_ne!(point_id_for("doc-1"), point_id_for("doc-2"));
        assert_eq!(point_id_to_uuid(&point_id("doc-1")), Some(point_id_for("doc-1")));
    }

    #[test]
    fn test_only_keyword_equalities_are_pushed() {
        let filters = vec![
            MetadataFilter::eq("lang", "en"),
            MetadataFilter::eq("content", "hello"),
            MetadataFilter::Compare {
                field: "year".to_string(),
                op: FilterOp::Gt,
                value: Value::Int(2000),
            },
        ];
        let pushed = to_qdrant_filter(&filters).unwrap();
        assert_eq!(pushed.must.len(), 1);
        assert!(to_qdrant_filter(&filters[1..]).is_none());
    }

    #[test]
    fn test_payload_roundtrip() {
        let chunk = DocumentChunk::new("a", "hello", vec![0.5, 0.5])
            .with_metadata(json!({"lang": "en", "tags": ["x"]}).as_object().unwrap().clone());
        let point = chunk_to_point(chunk.clone(), 7);
        let (back, seq) = chunk_from_payload(point.payload, None);
        assert_eq!(seq, 7);
        assert_eq!(back.id, "a");
        assert_eq!(back.content_hash, chunk.content_hash);
        assert_eq!(back.metadata, chunk.metadata);
    }
}
