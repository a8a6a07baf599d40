//! Default values for configuration

/// Default vector store backend
pub fn default_vector_backend() -> String {
    "memory".to_string()
}

/// Default Qdrant gRPC URL for local development (port 6334, not 6333 REST)
pub fn default_qdrant_url() -> String {
    std::env::var("QDRANT_URL").unwrap_or_else(|_| "http://127.0.0.1:6334".to_string())
}

/// Default environment variable name for Qdrant API key
pub fn default_qdrant_api_key_env() -> String {
    "".to_string()
}

/// Prefix for Qdrant collection names, one collection per knowledge base
pub fn default_collection_prefix() -> String {
    "quarry_".to_string()
}

/// Default embedding backend kind
pub fn default_embedding_backend() -> String {
    "http".to_string()
}

/// Default embedding model (BAAI/bge-small-en-v1.5)
pub fn default_embedding_model() -> String {
    "BAAI/bge-small-en-v1.5".to_string()
}

pub fn default_embedding_dimension() -> usize {
    384
}

/// Default embedding backend URL
pub fn default_embedding_backend_url() -> String {
    std::env::var("QUARRY_EMBEDDING_BACKEND_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:7997".to_string())
}

/// Default batch size for embedding
pub fn default_embedding_batch_size() -> usize {
    32
}

pub fn default_http_timeout_secs() -> u64 {
    30
}

/// Default reranker model (cross-encoder)
pub fn default_reranker_model() -> String {
    "BAAI/bge-reranker-base".to_string()
}

/// Default: reranker disabled
pub fn default_reranker_enabled() -> bool {
    false
}

/// Candidates fetched per requested result when reranking
pub fn default_rerank_factor() -> usize {
    4
}

/// Default keyword (BM25) weight for hybrid search
pub fn default_keyword_weight() -> f32 {
    0.3
}

/// Default number of results for an unlimited knowledge base search
pub fn default_search_k() -> usize {
    10
}

/// Default maximum steps running at once
pub fn default_max_parallel_steps() -> usize {
    4
}

/// Default statement timeout (5 minutes)
pub fn default_statement_timeout_secs() -> u64 {
    300
}

/// Default concurrent connections per source adapter
pub fn default_source_max_connections() -> usize {
    5
}

/// Default retries for transient source failures
pub fn default_source_retries() -> u32 {
    2
}

pub fn default_inference_batch_size() -> usize {
    16
}

pub fn default_inference_max_retries() -> u32 {
    3
}

pub fn default_inference_timeout_secs() -> u64 {
    60
}

/// Agents get longer, they may do retrieval plus a long completion
pub fn default_agent_timeout_secs() -> u64 {
    300
}

/// Default requests per second per inference endpoint
pub fn default_inference_rate_limit() -> u32 {
    10
}

pub fn default_backoff_base_ms() -> u64 {
    200
}

/// Default chat endpoint for agents
pub fn default_chat_base_url() -> String {
    std::env::var("QUARRY_CHAT_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:11434".to_string())
}

/// Default polling interval for `jobs run`
pub fn default_poll_interval_secs() -> u64 {
    30
}

/// Default run history rows kept per job
pub fn default_max_run_history() -> usize {
    100
}
