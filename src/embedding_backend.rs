//! Thin client for an HTTP embedding sidecar

use crate::error::{Error, Result};
use crate::retry::{retry_async, RetrySettings};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Serialize)]
struct EmbedTextRequest<'a> {
    model: &'a str,
    inputs: &'a [String],
}

/// Accepts the three response shapes seen in the wild
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EmbeddingResponse {
    Embeddings { embeddings: Vec<Vec<f32>> },
    Vectors { vectors: Vec<Vec<f32>> },
    Data { data: Vec<EmbeddingData> },
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl EmbeddingResponse {
    fn into_embeddings(self) -> Vec<Vec<f32>> {
        match self {
            EmbeddingResponse::Embeddings { embeddings } => embeddings,
            EmbeddingResponse::Vectors { vectors } => vectors,
            EmbeddingResponse::Data { data } => data.into_iter().map(|d| d.embedding).collect(),
        }
    }
}

/// 429 and 5xx are worth another attempt; other client errors are final
fn status_error(status: StatusCode, body: String) -> Error {
    let message = format!("embedding backend returned {}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Error::inference_transient(message)
    } else {
        Error::inference_permanent(message)
    }
}

pub struct EmbeddingBackendClient {
    client: Client,
    embed_url: Url,
    retry: RetrySettings,
}

impl EmbeddingBackendClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let embed_url = Url::parse(base_url)?
            .join("/v1/embed/text")
            .map_err(|e| Error::Config(format!("Invalid embedding backend URL: {}", e)))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            embed_url,
            retry: RetrySettings::new(2, 200),
        })
    }

    async fn post_once(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(self.embed_url.clone())
            .json(&EmbedTextRequest { model, inputs })
            .send()
            .await
            .map_err(|e| Error::inference_transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::inference_permanent(format!("Malformed backend response: {}", e)))?;
        Ok(parsed.into_embeddings())
    }

    pub async fn embed_text(&self, model: &str, inputs: Vec<String>) -> Result<Vec<Vec<f32>>> {
        debug!("Embedding {} texts via {}", inputs.len(), self.embed_url);
        retry_async("embed", self.retry, || self.post_once(model, &inputs))
            .await
            .map_err(|e| match e {
                Error::Inference { message, .. } => Error::Embedding(message),
                other => other,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_accepts_openai_style_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embed/text"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [0.1, 0.2]}, {"embedding": [0.3, 0.4]}]
            })))
            .mount(&server)
            .await;

        let client = EmbeddingBackendClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let vectors = client
            .embed_text("m", vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embed/text"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/embed/text"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[1.0, 0.0]]})),
            )
            .mount(&server)
            .await;

        let client = EmbeddingBackendClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let vectors = client.embed_text("m", vec!["a".to_string()]).await.unwrap();
        assert_eq!(vectors.len(), 1);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embed/text"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let client = EmbeddingBackendClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        assert!(client.embed_text("m", vec!["a".to_string()]).await.is_err());
    }
}
