//! HTTP endpoints: row prediction and OpenAI-style chat completions

use super::{status_error, transport_error, InferenceEndpoint, JsonRow};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

fn join_url(base: &str, path: &str) -> Result<Url> {
    let base = Url::parse(base)?;
    base.join(path)
        .map_err(|e| Error::Config(format!("Invalid endpoint URL {}: {}", base, e)))
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    model: &'a str,
    rows: Vec<JsonRow>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PredictResponse {
    Rows { rows: Vec<JsonRow> },
    Predictions { predictions: Vec<JsonRow> },
    Data { data: Vec<JsonRow> },
}

impl PredictResponse {
    fn into_rows(self) -> Vec<JsonRow> {
        match self {
            PredictResponse::Rows { rows } => rows,
            PredictResponse::Predictions { predictions } => predictions,
            PredictResponse::Data { data } => data,
        }
    }
}

/// `POST /v1/predict` with `{"model", "rows"}`
pub struct HttpModelEndpoint {
    client: Client,
    url: Url,
    model: String,
}

impl HttpModelEndpoint {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url: join_url(base_url, "/v1/predict")?,
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl InferenceEndpoint for HttpModelEndpoint {
    async fn predict(&self, rows: Vec<JsonRow>) -> Result<Vec<JsonRow>> {
        let request = PredictRequest {
            model: &self.model,
            rows,
        };
        let response = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(&self.model, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.model, status, &body));
        }
        let parsed: PredictResponse = response.json().await.map_err(|e| {
            Error::inference_permanent(format!("{}: malformed response: {}", self.model, e))
        })?;
        Ok(parsed.into_rows())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// OpenAI-compatible `/v1/chat/completions` client
pub struct ChatClient {
    client: Client,
    url: Url,
    model: String,
    api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatClient {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url: join_url(base_url, "/v1/chat/completions")?,
            model: model.to_string(),
            api_key,
            temperature: 0.0,
            max_tokens: 8096,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Content of the first choice
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        debug!("Chat completion with {} ({} messages)", self.model, messages.len());
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let mut builder = self.client.post(self.url.clone()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(&self.model, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.model, status, &body));
        }
        let parsed: ChatResponse = response.json().await.map_err(|e| {
            Error::inference_permanent(format!("{}: malformed response: {}", self.model, e))
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::inference_permanent(format!("{}: no choices returned", self.model)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn row(value: serde_json::Value) -> JsonRow {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_predict_accepts_predictions_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/predict"))
            .and(body_partial_json(json!({"model": "sentiment"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "predictions": [{"label": "pos"}]
            })))
            .mount(&server)
            .await;

        let endpoint =
            HttpModelEndpoint::new(&server.uri(), "sentiment", Duration::from_secs(5)).unwrap();
        let out = endpoint.predict(vec![row(json!({"text": "great"}))]).await.unwrap();
        assert_eq!(out[0]["label"], "pos");
    }

    #[tokio::test]
    async fn test_predict_classifies_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/predict"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let endpoint = HttpModelEndpoint::new(&server.uri(), "m", Duration::from_secs(5)).unwrap();
        let err = endpoint.predict(vec![row(json!({}))]).await.unwrap_err();
        assert!(matches!(err, Error::Inference { retryable: false, .. }));
    }

    #[tokio::test]
    async fn test_malformed_response_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/predict"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"nope": 1})))
            .mount(&server)
            .await;

        let endpoint = HttpModelEndpoint::new(&server.uri(), "m", Duration::from_secs(5)).unwrap();
        let err = endpoint.predict(vec![row(json!({}))]).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_chat_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "42"}}]
            })))
            .mount(&server)
            .await;

        let client = ChatClient::new(
            &server.uri(),
            "gpt-4o",
            Some("sk-test".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        let answer = client.complete(&[ChatMessage::user("meaning?")]).await.unwrap();
        assert_eq!(answer, "42");
    }

    #[tokio::test]
    async fn test_chat_overload_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = ChatClient::new(&server.uri(), "m", None, Duration::from_secs(5)).unwrap();
        assert!(client.complete(&[ChatMessage::user("hi")]).await.unwrap_err().is_transient());
    }
}
