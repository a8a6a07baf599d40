//! Shared fixtures for the end-to-end tests

#![allow(dead_code)]

use quarry::ast::Statement;
use quarry::catalog::Catalog;
use quarry::engine::{Engine, StatementOutcome};
use quarry::registry::Registry;
use quarry::retry::RetrySettings;
use quarry::source::{MemorySource, SourceHandle};
use quarry::value::{Batch, Schema, Value};
use quarry::vector::MemoryVectorStore;
use quarry::Config;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tempfile::TempDir;

pub fn config() -> Config {
    let mut config = Config::default();
    config.embedding.backend = "hashing".to_string();
    config.embedding.dimension = 64;
    config.inference.backoff_base_ms = 1;
    config.inference.requests_per_second = 1000;
    config
}

/// `crm.customers(id, code, name)`, 5 rows, codes `c1` to `c5`
pub fn crm() -> Arc<MemorySource> {
    let source = MemorySource::new("crm");
    let names = ["Ada", "Brian", "Chen", "Dora", "Eve"];
    source.create_table(
        "customers",
        Batch::new(
            Schema::from_names(&["id", "code", "name"]),
            names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    vec![
                        Value::Int(i as i64 + 1),
                        Value::Text(format!("c{}", i + 1)),
                        Value::from(*name),
                    ]
                })
                .collect(),
        ),
    );
    Arc::new(source)
}

/// `app.events(id, body, created_at)` with two rows
pub fn events() -> Arc<MemorySource> {
    let source = MemorySource::new("app");
    source.create_table(
        "events",
        Batch::new(
            Schema::from_names(&["id", "body", "created_at"]),
            vec![
                vec![Value::Int(1), Value::from("disk full on node a"), Value::Int(100)],
                vec![Value::Int(2), Value::from("login from new device"), Value::Int(200)],
            ],
        ),
    );
    Arc::new(source)
}

pub struct Harness {
    pub dir: TempDir,
    pub engine: Arc<Engine>,
    pub events: Arc<MemorySource>,
}

pub async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let catalog = Catalog::open(&dir.path().join("catalog.db")).await.unwrap();
    let registry = Registry::new();
    let events = events();
    registry
        .register_source(SourceHandle::new(crm(), 4, RetrySettings::new(0, 0)))
        .unwrap();
    registry
        .register_source(SourceHandle::new(events.clone(), 4, RetrySettings::new(0, 0)))
        .unwrap();
    let engine = Engine::with_parts(config(), registry, catalog, Arc::new(MemoryVectorStore::new()));
    Harness { dir, engine, events }
}

pub fn statement(value: JsonValue) -> Statement {
    serde_json::from_value(value).unwrap()
}

pub async fn execute(engine: &Engine, value: JsonValue) -> StatementOutcome {
    engine.execute(&statement(value), None).await.unwrap()
}

pub fn rows(outcome: StatementOutcome) -> Batch {
    match outcome {
        StatementOutcome::Rows(stream) => stream.into_batch(),
        other => panic!("expected rows, got {:?}", other),
    }
}
