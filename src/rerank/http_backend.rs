use super::{RerankResult, Reranker};
use crate::config::RerankerConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RerankResponse {
    results: Vec<RerankItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct RerankItem {
    index: usize,
    #[serde(alias = "relevance_score")]
    score: f32,
}

pub struct HttpReranker {
    client: Client,
    base_url: Url,
    model_id: String,
}

impl HttpReranker {
    pub fn new(config: &RerankerConfig, backend_url: &str) -> Result<Self> {
        let base_url = Url::parse(backend_url)
            .map_err(|e| Error::Config(format!("Invalid reranker backend URL: {}", e)))?;
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base_url,
            model_id: config.model.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid reranker backend URL: {}", e)))
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, documents: Vec<String>) -> Result<Vec<RerankResult>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let count = documents.len();
        debug!("Reranking {} documents", count);
        let url = self.endpoint("/v1/rerank")?;
        let request = RerankRequest {
            model: &self.model_id,
            query,
            documents,
        };

        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let parsed = response.json::<RerankResponse>().await?;
        if let Some(bad) = parsed.results.iter().find(|r| r.index >= count) {
            return Err(Error::Execution(format!(
                "Reranker returned index {} for {} documents",
                bad.index, count
            )));
        }
        Ok(parsed
            .results
            .into_iter()
            .map(|item| RerankResult {
                index: item.index,
                score: item.score,
            })
            .collect())
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_rerank_parses_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/rerank"))
            .and(body_partial_json(json!({"query": "rust"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"index": 1, "score": 0.9}, {"index": 0, "relevance_score": 0.1}]
            })))
            .mount(&server)
            .await;

        let reranker = HttpReranker::new(&RerankerConfig::default(), &server.uri()).unwrap();
        let results = reranker
            .rerank("rust", vec!["python".to_string(), "rust".to_string()])
            .await
            .unwrap();
        assert_eq!(results[0], RerankResult { index: 1, score: 0.9 });
        assert_eq!(results[1].index, 0);
    }

    #[tokio::test]
    async fn test_out_of_range_index_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/rerank"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"results": [{"index": 5, "score": 0.9}]})),
            )
            .mount(&server)
            .await;

        let reranker = HttpReranker::new(&RerankerConfig::default(), &server.uri()).unwrap();
        assert!(reranker.rerank("q", vec!["a".to_string()]).await.is_err());
    }
}
