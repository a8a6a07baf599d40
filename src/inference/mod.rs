//! Inference gateway
//!
//! Models and agents are remote endpoints that turn input rows into
//! prediction columns. The gateway batches rows, rate-limits calls per
//! endpoint, enforces a per-call timeout and retries transient failures.

mod agent;
mod http;

pub use agent::{
    AgentDef, AgentEndpoint, ChatModelSpec, ANSWER_COLUMN, CONTEXT_COLUMN, QUESTION_COLUMN,
    SUPPORTED_PROVIDERS, TRACE_ID_COLUMN,
};
pub use http::{ChatClient, ChatMessage, HttpModelEndpoint};

use crate::config::InferenceConfig;
use crate::error::{Error, Result};
use crate::retry::{retry_async, timeout_error, RetrySettings};
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One input or output row, keyed by column name
pub type JsonRow = Map<String, JsonValue>;

/// A remote model or agent
#[async_trait]
pub trait InferenceEndpoint: Send + Sync {
    /// One output row per input row, in the same order
    async fn predict(&self, rows: Vec<JsonRow>) -> Result<Vec<JsonRow>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Model,
    Agent,
}

/// Registered model or agent: its columns plus the endpoint behind it
pub struct InferenceTarget {
    pub name: String,
    pub kind: TargetKind,
    /// Columns the endpoint expects; empty = whatever the caller supplies
    pub input_columns: Vec<String>,
    pub output_columns: Vec<String>,
    pub endpoint: Arc<dyn InferenceEndpoint>,
    pub timeout: Duration,
}

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

pub struct InferenceGateway {
    batch_size: usize,
    retry: RetrySettings,
    limiter: KeyedLimiter,
}

impl InferenceGateway {
    pub fn new(config: &InferenceConfig) -> Self {
        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(nonzero!(1u32));
        Self {
            batch_size: config.batch_size.max(1),
            retry: RetrySettings::new(config.max_retries, config.backoff_base_ms),
            limiter: RateLimiter::keyed(Quota::per_second(rps)),
        }
    }

    /// Run `rows` through `target`, one endpoint call per batch
    pub async fn invoke(&self, target: &InferenceTarget, rows: Vec<JsonRow>) -> Result<Vec<JsonRow>> {
        let mut output = Vec::with_capacity(rows.len());
        for batch in rows.chunks(self.batch_size) {
            debug!("Invoking {} with {} rows", target.name, batch.len());
            let predicted = retry_async(&format!("infer {}", target.name), self.retry, || {
                self.call(target, batch)
            })
            .await?;
            output.extend(predicted);
        }
        Ok(output)
    }

    async fn call(&self, target: &InferenceTarget, batch: &[JsonRow]) -> Result<Vec<JsonRow>> {
        self.limiter.until_key_ready(&target.name).await;
        let predicted = tokio::time::timeout(target.timeout, target.endpoint.predict(batch.to_vec()))
            .await
            .map_err(|_| timeout_error(&target.name, target.timeout))??;
        if predicted.len() != batch.len() {
            return Err(Error::inference_permanent(format!(
                "{} returned {} rows for {} inputs",
                target.name,
                predicted.len(),
                batch.len()
            )));
        }
        Ok(predicted)
    }
}

/// HTTP status classification shared by model and chat endpoints
pub(crate) fn status_error(endpoint: &str, status: reqwest::StatusCode, body: &str) -> Error {
    let message = format!("{} returned {}: {}", endpoint, status, body.trim());
    if status.as_u16() == 429 || status.is_server_error() {
        Error::inference_transient(message)
    } else {
        Error::inference_permanent(message)
    }
}

/// Connection-level failures are worth retrying; decoding failures are not
pub(crate) fn transport_error(endpoint: &str, err: reqwest::Error) -> Error {
    let message = format!("{}: {}", endpoint, err);
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Error::inference_transient(message)
    } else {
        Error::inference_permanent(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes `x * 2` as `y`; fails transiently the first `flaky` calls
    struct Doubler {
        calls: AtomicUsize,
        flaky: usize,
        sizes: std::sync::Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl InferenceEndpoint for Doubler {
        async fn predict(&self, rows: Vec<JsonRow>) -> Result<Vec<JsonRow>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.sizes.lock().unwrap().push(rows.len());
            if n < self.flaky {
                return Err(Error::inference_transient("503"));
            }
            Ok(rows
                .iter()
                .map(|r| {
                    let x = r.get("x").and_then(|v| v.as_i64()).unwrap_or(0);
                    json!({"y": x * 2}).as_object().unwrap().clone()
                })
                .collect())
        }
    }

    fn target(endpoint: Arc<dyn InferenceEndpoint>) -> InferenceTarget {
        InferenceTarget {
            name: "doubler".to_string(),
            kind: TargetKind::Model,
            input_columns: vec!["x".to_string()],
            output_columns: vec!["y".to_string()],
            endpoint,
            timeout: Duration::from_secs(5),
        }
    }

    fn config() -> InferenceConfig {
        InferenceConfig {
            batch_size: 2,
            backoff_base_ms: 1,
            requests_per_second: 1000,
            ..InferenceConfig::default()
        }
    }

    fn inputs(n: i64) -> Vec<JsonRow> {
        (0..n)
            .map(|x| json!({ "x": x }).as_object().unwrap().clone())
            .collect()
    }

    #[tokio::test]
    async fn test_batches_and_preserves_order() {
        let doubler = Arc::new(Doubler {
            calls: AtomicUsize::new(0),
            flaky: 0,
            sizes: Default::default(),
        });
        let gateway = InferenceGateway::new(&config());
        let out = gateway.invoke(&target(doubler.clone()), inputs(5)).await.unwrap();
        let ys: Vec<i64> = out.iter().map(|r| r["y"].as_i64().unwrap()).collect();
        assert_eq!(ys, vec![0, 2, 4, 6, 8]);
        assert_eq!(*doubler.sizes.lock().unwrap(), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let doubler = Arc::new(Doubler {
            calls: AtomicUsize::new(0),
            flaky: 2,
            sizes: Default::default(),
        });
        let gateway = InferenceGateway::new(&config());
        let out = gateway.invoke(&target(doubler.clone()), inputs(1)).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(doubler.calls.load(Ordering::SeqCst), 3);
    }

    struct Short;

    #[async_trait]
    impl InferenceEndpoint for Short {
        async fn predict(&self, _rows: Vec<JsonRow>) -> Result<Vec<JsonRow>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_row_count_mismatch_is_permanent() {
        let gateway = InferenceGateway::new(&config());
        let err = gateway.invoke(&target(Arc::new(Short)), inputs(2)).await.unwrap_err();
        assert!(matches!(err, Error::Inference { retryable: false, .. }));
    }

    struct Slow;

    #[async_trait]
    impl InferenceEndpoint for Slow {
        async fn predict(&self, rows: Vec<JsonRow>) -> Result<Vec<JsonRow>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(rows)
        }
    }

    #[tokio::test]
    async fn test_timeout_is_transient_and_bounded() {
        let gateway = InferenceGateway::new(&InferenceConfig {
            max_retries: 1,
            ..config()
        });
        let mut slow = target(Arc::new(Slow));
        slow.timeout = Duration::from_millis(20);
        let err = gateway.invoke(&slow, inputs(1)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_status_classification() {
        use reqwest::StatusCode;
        assert!(status_error("m", StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(status_error("m", StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!status_error("m", StatusCode::UNAUTHORIZED, "").is_transient());
        assert!(!status_error("m", StatusCode::UNPROCESSABLE_ENTITY, "").is_transient());
    }
}
