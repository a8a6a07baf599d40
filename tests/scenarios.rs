mod common;

use chrono::{TimeDelta, Utc};
use common::{execute, harness, rows, statement};
use quarry::commands::{cmd_explain, cmd_run, parse_statements, StatementReport};
use quarry::scheduler::{ManualClock, TickOutcome};
use quarry::value::Value;
use quarry::vector::{DocumentChunk, MemoryVectorStore, VectorStore};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

fn column(relation: Option<&str>, name: &str) -> serde_json::Value {
    match relation {
        Some(r) => json!({"column": {"relation": r, "name": name}}),
        None => json!({"column": {"name": name}}),
    }
}

fn item(expr: serde_json::Value, alias: Option<&str>) -> serde_json::Value {
    match alias {
        Some(a) => json!({"expr": {"expr": expr, "alias": a}}),
        None => json!({"expr": {"expr": expr}}),
    }
}

fn binary(left: serde_json::Value, op: &str, right: serde_json::Value) -> serde_json::Value {
    json!({"binary": {"left": left, "op": op, "right": right}})
}

#[tokio::test]
async fn search_returns_top_k_by_descending_score() {
    let store = MemoryVectorStore::new();
    store.ensure_collection("c", 3).await.unwrap();
    store
        .insert(
            "c",
            vec![
                DocumentChunk::new("a", "alpha", vec![1.0, 0.0, 0.0]),
                DocumentChunk::new("b", "beta", vec![0.7, 0.7, 0.0]),
                DocumentChunk::new("c", "gamma", vec![0.0, 0.0, 1.0]),
            ],
        )
        .await
        .unwrap();

    let hits = store.search("c", &[1.0, 0.1, 0.0], 2, &[]).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits[0].score >= hits[1].score);
    let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn inserted_text_is_found_at_top_relevance() {
    let h = harness().await;
    execute(
        &h.engine,
        json!({"create_knowledge_base": {"name": "kb", "using": {"content_columns": ["content"]}}}),
    )
    .await;
    let insert = execute(
        &h.engine,
        json!({"insert": {
            "target": "kb",
            "query": {"select": {"projection": [item(json!({"literal": "hello"}), Some("content"))]}}
        }}),
    )
    .await;
    let summary = rows(insert);
    assert_eq!(summary.rows[0][0], Value::Int(1));

    let found = rows(
        execute(
            &h.engine,
            json!({"query": {"select": {
                "projection": ["wildcard"],
                "from": {"relation": {"name": "kb"}},
                "where": binary(column(None, "content"), "eq", json!({"literal": "hello"}))
            }}}),
        )
        .await,
    );
    assert_eq!(found.len(), 1);
    let content = found.column("content").unwrap();
    let relevance = found.column("relevance").unwrap();
    assert_eq!(found.rows[0][content], Value::from("hello"));
    match found.rows[0][relevance] {
        Value::Float(score) => assert!(score > 0.99, "relevance {}", score),
        ref other => panic!("relevance should be a float, got {:?}", other),
    }
}

#[tokio::test]
async fn table_to_knowledge_base_join_keeps_true_multiplicity() {
    let h = harness().await;
    execute(
        &h.engine,
        json!({"create_knowledge_base": {"name": "kb", "using": {"id_column": "id"}}}),
    )
    .await;
    execute(
        &h.engine,
        json!({"insert": {"target": "kb", "query": {"select": {
            "projection": [
                item(column(None, "code"), Some("id")),
                item(column(None, "name"), Some("content"))
            ],
            "from": {"relation": {"name": "crm.customers"}},
            "where": binary(column(None, "id"), "lt_eq", json!({"literal": 3}))
        }}}}),
    )
    .await;

    let joined = rows(
        execute(
            &h.engine,
            json!({"query": {"select": {
                "projection": [item(column(Some("c"), "name"), None), item(column(Some("k"), "id"), None)],
                "from": {"join": {
                    "left": {"relation": {"name": "crm.customers", "alias": "c"}},
                    "right": {"relation": {"name": "kb", "alias": "k"}},
                    "kind": "inner",
                    "on": binary(column(Some("c"), "code"), "eq", column(Some("k"), "id"))
                }}
            }}}),
        )
        .await,
    );
    assert!(joined.len() <= 3);
    assert_eq!(joined.len(), 3);
    let keys: HashSet<String> = joined.rows.iter().map(|r| r[1].to_string()).collect();
    assert_eq!(keys.len(), joined.len());
}

#[tokio::test]
async fn job_does_not_reprocess_rows() {
    let h = harness().await;
    execute(
        &h.engine,
        json!({"create_knowledge_base": {"name": "notes", "using": {"id_column": "id"}}}),
    )
    .await;
    execute(
        &h.engine,
        json!({"create_job": {
            "name": "ingest",
            "every": "1 day",
            "statements": [{"insert": {"target": "notes", "query": {"select": {
                "projection": [
                    item(column(None, "id"), None),
                    item(column(None, "body"), Some("content"))
                ],
                "from": {"relation": {"name": "app.events"}},
                "where": binary(column(None, "created_at"), "gt", json!("last"))
            }}}}]
        }}),
    )
    .await;

    h.events
        .insert_rows(
            "events",
            vec![vec![Value::Int(3), Value::from("backup finished"), Value::Int(300)]],
        )
        .unwrap();

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let scheduler = h.engine.scheduler(clock.clone());
    assert_eq!(
        scheduler.tick("ingest").await.unwrap(),
        TickOutcome::Completed { rows: 1 }
    );

    clock.advance(TimeDelta::days(1));
    assert_eq!(
        scheduler.tick("ingest").await.unwrap(),
        TickOutcome::Completed { rows: 0 }
    );

    let history = rows(
        execute(
            &h.engine,
            json!({"query": {"select": {"projection": ["wildcard"], "from": {"relation": {"name": "jobs.ingest"}}}}}),
        )
        .await,
    );
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn limit_matches_row_limit_truncation() {
    let h = harness().await;
    let ordered = |limit: Option<usize>| {
        let mut select = json!({
            "projection": [item(column(None, "name"), None)],
            "from": {"relation": {"name": "crm.customers"}},
            "order_by": [{"expr": column(None, "name"), "asc": false}]
        });
        if let Some(n) = limit {
            select["limit"] = json!(n);
        }
        statement(json!({"query": {"select": select}}))
    };

    let limited = rows(h.engine.execute(&ordered(Some(3)), None).await.unwrap());
    let truncated = rows(h.engine.execute(&ordered(None), Some(3)).await.unwrap());
    assert_eq!(limited.rows, truncated.rows);
    assert_eq!(limited.rows[0][0], Value::from("Eve"));
}

#[tokio::test]
async fn statement_documents_run_in_order() {
    let h = harness().await;
    let document = json!([
        {"create_view": {
            "name": "early_events",
            "query": {"select": {
                "projection": ["wildcard"],
                "from": {"relation": {"name": "app.events"}},
                "where": binary(column(None, "created_at"), "lt", json!({"literal": 150}))
            }}
        }},
        {"query": {"select": {"projection": ["wildcard"], "from": {"relation": {"name": "early_events"}}}}}
    ]);
    let statements = parse_statements(&document.to_string()).unwrap();

    let plans = cmd_explain(&h.engine, &statements[1..]).await;
    assert!(plans.is_err(), "the view does not exist yet");

    let reports = cmd_run(&h.engine, &statements, None).await.unwrap();
    assert!(matches!(&reports[0], StatementReport::Created { name, .. } if name == "early_events"));
    match &reports[1] {
        StatementReport::Rows { rows, .. } => assert_eq!(rows.as_array().map(Vec::len), Some(1)),
        other => panic!("expected rows, got {:?}", other),
    }

    let plans = cmd_explain(&h.engine, &statements[1..]).await.unwrap();
    assert!(plans[0].contains("app.events"));
}
