//! Fixtures shared by unit tests

use crate::config::Config;
use crate::embed::HashingEmbedder;
use crate::error::Result;
use crate::inference::{InferenceEndpoint, InferenceTarget, JsonRow, TargetKind};
use crate::kb::{KnowledgeBase, KnowledgeBaseDef};
use crate::registry::Registry;
use crate::retry::RetrySettings;
use crate::source::{MemorySource, SourceHandle};
use crate::value::{Batch, Schema, Value};
use crate::vector::MemoryVectorStore;
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;

pub fn config() -> Config {
    let mut config = Config::default();
    config.embedding.backend = "hashing".to_string();
    config.embedding.dimension = 64;
    config.inference.backoff_base_ms = 1;
    config.inference.requests_per_second = 1000;
    config
}

pub fn customers_schema() -> Schema {
    Schema::from_names(&["id", "name", "city", "tier"])
}

pub fn orders_schema() -> Schema {
    Schema::from_names(&["id", "customer_id", "amount", "status"])
}

/// `crm.customers` (5 rows, one NULL city) and `crm.orders` (6 rows)
pub fn crm_source() -> Arc<MemorySource> {
    let source = MemorySource::new("crm");
    source.create_table(
        "customers",
        Batch::new(
            customers_schema(),
            vec![
                vec![Value::Int(1), Value::from("Ada"), Value::from("London"), Value::from("gold")],
                vec![Value::Int(2), Value::from("Brian"), Value::from("Paris"), Value::from("silver")],
                vec![Value::Int(3), Value::from("Chen"), Value::from("London"), Value::from("silver")],
                vec![Value::Int(4), Value::from("Dora"), Value::Null, Value::from("gold")],
                vec![Value::Int(5), Value::from("Eve"), Value::from("Berlin"), Value::from("bronze")],
            ],
        ),
    );
    source.create_table(
        "orders",
        Batch::new(
            orders_schema(),
            vec![
                vec![Value::Int(10), Value::Int(1), Value::Int(120), Value::from("paid")],
                vec![Value::Int(11), Value::Int(1), Value::Int(80), Value::from("open")],
                vec![Value::Int(12), Value::Int(2), Value::Int(200), Value::from("paid")],
                vec![Value::Int(13), Value::Int(3), Value::Int(50), Value::from("paid")],
                vec![Value::Int(14), Value::Null, Value::Int(15), Value::from("open")],
                vec![Value::Int(15), Value::Int(4), Value::Null, Value::from("open")],
            ],
        ),
    );
    Arc::new(source)
}

pub fn crm_handle() -> SourceHandle {
    SourceHandle::new(crm_source(), 4, RetrySettings::new(0, 0))
}

/// `docs` with `id` ids and a `category` metadata column
pub async fn knowledge_base(name: &str) -> Arc<KnowledgeBase> {
    let using = json!({"id_column": "id", "metadata_columns": ["category"]});
    let def = KnowledgeBaseDef::from_using(using.as_object().unwrap(), &config()).unwrap();
    let kb = KnowledgeBase::with_providers(
        name,
        def,
        Arc::new(MemoryVectorStore::new()),
        Arc::new(HashingEmbedder::new(64)),
        None,
        4,
    )
    .await
    .unwrap();
    Arc::new(kb)
}

/// Answers `question` with `"echo: <question>"`; scores `name` by length
pub struct EchoModel;

#[async_trait]
impl InferenceEndpoint for EchoModel {
    async fn predict(&self, rows: Vec<JsonRow>) -> Result<Vec<JsonRow>> {
        Ok(rows
            .into_iter()
            .map(|row| {
                let mut out = JsonRow::new();
                let text = |key: &str| row.get(key).and_then(JsonValue::as_str).map(String::from);
                if let Some(q) = text("question") {
                    out.insert("answer".into(), JsonValue::String(format!("echo: {}", q)));
                }
                if let Some(t) = text("name") {
                    out.insert("score".into(), json!(t.len()));
                }
                out
            })
            .collect())
    }
}

struct SlowModel(Duration);

#[async_trait]
impl InferenceEndpoint for SlowModel {
    async fn predict(&self, rows: Vec<JsonRow>) -> Result<Vec<JsonRow>> {
        tokio::time::sleep(self.0).await;
        Ok(rows)
    }
}

pub fn target(name: &str, inputs: &[&str], outputs: &[&str], endpoint: Arc<dyn InferenceEndpoint>) -> Arc<InferenceTarget> {
    Arc::new(InferenceTarget {
        name: name.to_string(),
        kind: TargetKind::Model,
        input_columns: inputs.iter().map(|s| s.to_string()).collect(),
        output_columns: outputs.iter().map(|s| s.to_string()).collect(),
        endpoint,
        timeout: Duration::from_secs(30),
    })
}

/// `crm` source, `docs` knowledge base, `echo` (question → answer) and
/// `scorer` (name → score) models
pub async fn registry() -> Arc<Registry> {
    let registry = Registry::new();
    registry.register_source(crm_handle()).unwrap();
    registry.register_knowledge_base(knowledge_base("docs").await).unwrap();
    registry
        .register_inference(target("echo", &["question"], &["answer"], Arc::new(EchoModel)))
        .unwrap();
    registry
        .register_inference(target("scorer", &["name"], &["score"], Arc::new(EchoModel)))
        .unwrap();
    registry
}

pub fn registry_with_slow_model(delay: Duration) -> Arc<Registry> {
    let registry = Registry::new();
    registry
        .register_inference(target("slow", &["question"], &["answer"], Arc::new(SlowModel(delay))))
        .unwrap();
    registry
}
