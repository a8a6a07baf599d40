//! `information_schema.*` and `jobs.*` relations, generated at fetch time

use super::{Capabilities, FetchRequest, SourceAdapter};
use crate::error::{Error, Result, SourceErrorKind};
use crate::inference::TargetKind;
use crate::registry::{Registry, RelationKind};
use crate::value::{Batch, Row, Schema, Value};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::{Arc, Weak};
use tracing::debug;

pub const SYSTEM_SCHEMA: &str = "information_schema";
pub const JOBS_SCHEMA: &str = "jobs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemTable {
    Tables,
    Columns,
    KnowledgeBases,
    Models,
    Agents,
    Jobs,
}

impl SystemTable {
    pub const ALL: [SystemTable; 6] = [
        SystemTable::Tables,
        SystemTable::Columns,
        SystemTable::KnowledgeBases,
        SystemTable::Models,
        SystemTable::Agents,
        SystemTable::Jobs,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "tables" => Some(SystemTable::Tables),
            "columns" => Some(SystemTable::Columns),
            "knowledge_bases" => Some(SystemTable::KnowledgeBases),
            "models" => Some(SystemTable::Models),
            "agents" => Some(SystemTable::Agents),
            "jobs" => Some(SystemTable::Jobs),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SystemTable::Tables => "tables",
            SystemTable::Columns => "columns",
            SystemTable::KnowledgeBases => "knowledge_bases",
            SystemTable::Models => "models",
            SystemTable::Agents => "agents",
            SystemTable::Jobs => "jobs",
        }
    }

    pub fn schema(&self) -> Schema {
        let names: &[&str] = match self {
            SystemTable::Tables => &["table_schema", "table_name", "table_type"],
            SystemTable::Columns => &["table_schema", "table_name", "column_name", "ordinal_position"],
            SystemTable::KnowledgeBases => &[
                "name",
                "embedding_model",
                "dimension",
                "content_columns",
                "metadata_columns",
                "id_column",
                "hybrid_search",
                "keyword_weight",
                "reranking",
                "vector_backend",
            ],
            SystemTable::Models | SystemTable::Agents => {
                &["name", "input_columns", "output_columns", "timeout_secs"]
            }
            SystemTable::Jobs => &["name", "schedule", "next_run_at", "last_run_at", "run_count"],
        };
        Schema::from_names(names)
    }
}

fn json_list(items: &[String]) -> Value {
    Value::Json(JsonValue::Array(
        items.iter().cloned().map(JsonValue::String).collect(),
    ))
}

fn unknown_table(source: &str, table: &str) -> Error {
    Error::source_failure(
        SourceErrorKind::Schema,
        format!("no such table: {}.{}", source, table),
    )
}

/// Splits a dotted relation name into `(schema, table)` columns
fn split_name(name: &str) -> (Value, Value) {
    match name.split_once('.') {
        Some((schema, table)) => (Value::from(schema), Value::from(table)),
        None => (Value::Null, Value::from(name)),
    }
}

/// Keep only the requested columns, in request order
fn project(batch: Batch, columns: Option<&Vec<String>>) -> Result<Batch> {
    let Some(columns) = columns else {
        return Ok(batch);
    };
    let indices = columns
        .iter()
        .map(|c| batch.schema.index_of(None, c).map_err(Error::from))
        .collect::<Result<Vec<_>>>()?;
    let rows = batch
        .rows
        .into_iter()
        .map(|row| indices.iter().map(|i| row[*i].clone()).collect())
        .collect();
    Ok(Batch::new(Schema::from_names(columns), rows))
}

/// Catalog views over the registry it belongs to
pub struct SystemSource {
    registry: Weak<Registry>,
}

impl SystemSource {
    pub fn new(registry: Weak<Registry>) -> Self {
        Self { registry }
    }

    fn registry(&self) -> Result<Arc<Registry>> {
        self.registry
            .upgrade()
            .ok_or_else(|| Error::source_failure(SourceErrorKind::Connection, "registry was torn down"))
    }

    async fn rows(&self, table: SystemTable) -> Result<Vec<Row>> {
        let registry = self.registry()?;
        let rows = match table {
            SystemTable::Tables => {
                let mut rows = Vec::new();
                for (name, kind) in registry.relations().await? {
                    let (schema, table) = split_name(&name);
                    rows.push(vec![schema, table, Value::from(kind.as_str())]);
                }
                rows
            }
            SystemTable::Columns => {
                let mut rows = Vec::new();
                for (name, kind) in registry.relations().await? {
                    if matches!(kind, RelationKind::View) {
                        continue;
                    }
                    let resolved = registry.resolve(&name).await?;
                    let (schema, table) = split_name(&name);
                    for (i, field) in resolved.descriptor.schema.fields.iter().enumerate() {
                        rows.push(vec![
                            schema.clone(),
                            table.clone(),
                            Value::from(field.name.clone()),
                            Value::from(i + 1),
                        ]);
                    }
                }
                rows
            }
            SystemTable::KnowledgeBases => registry
                .knowledge_bases()
                .into_iter()
                .map(|kb| {
                    let def = kb.def();
                    vec![
                        Value::from(kb.name()),
                        Value::from(def.embedding.model.clone()),
                        Value::from(def.embedding.resolved_dimension()),
                        json_list(&def.content_columns),
                        json_list(&def.metadata_columns),
                        Value::from(def.id_column.clone()),
                        Value::from(def.hybrid_search),
                        Value::from(def.keyword_weight as f64),
                        Value::from(kb.has_reranker()),
                        Value::from(kb.store().backend_name()),
                    ]
                })
                .collect(),
            SystemTable::Models | SystemTable::Agents => {
                let wanted = if table == SystemTable::Models {
                    TargetKind::Model
                } else {
                    TargetKind::Agent
                };
                registry
                    .inference_targets()
                    .into_iter()
                    .filter(|t| t.kind == wanted)
                    .map(|t| {
                        vec![
                            Value::from(t.name.clone()),
                            json_list(&t.input_columns),
                            json_list(&t.output_columns),
                            Value::Int(t.timeout.as_secs() as i64),
                        ]
                    })
                    .collect()
            }
            SystemTable::Jobs => match registry.catalog() {
                Some(catalog) => catalog
                    .list_jobs()
                    .await?
                    .into_iter()
                    .map(|job| {
                        let schedule = job.definition().map(|d| d.every).ok();
                        vec![
                            Value::from(job.name),
                            Value::from(schedule),
                            Value::from(job.next_run_at),
                            Value::from(job.last_run_at),
                            Value::Int(job.run_count),
                        ]
                    })
                    .collect(),
                None => Vec::new(),
            },
        };
        Ok(rows)
    }
}

#[async_trait]
impl SourceAdapter for SystemSource {
    fn name(&self) -> &str {
        SYSTEM_SCHEMA
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            projection: true,
            ..Capabilities::none()
        }
    }

    async fn tables(&self) -> Result<Vec<String>> {
        Ok(SystemTable::ALL.iter().map(|t| t.name().to_string()).collect())
    }

    async fn schema(&self, table: &str) -> Result<Schema> {
        SystemTable::from_name(table)
            .map(|t| t.schema())
            .ok_or_else(|| unknown_table(SYSTEM_SCHEMA, table))
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Batch> {
        let table =
            SystemTable::from_name(&request.table).ok_or_else(|| unknown_table(SYSTEM_SCHEMA, &request.table))?;
        debug!("Generating {}.{}", SYSTEM_SCHEMA, table.name());
        let batch = Batch::new(table.schema(), self.rows(table).await?);
        project(batch, request.columns.as_ref())
    }
}

/// Run history of every stored job, one table per job
pub struct JobHistorySource {
    registry: Weak<Registry>,
}

impl JobHistorySource {
    pub fn new(registry: Weak<Registry>) -> Self {
        Self { registry }
    }

    pub fn history_schema() -> Schema {
        Schema::from_names(&[
            "run_id",
            "started_at",
            "completed_at",
            "status",
            "rows_processed",
            "error",
        ])
    }

    async fn catalog(&self) -> Result<crate::catalog::Catalog> {
        self.registry
            .upgrade()
            .and_then(|r| r.catalog())
            .ok_or_else(|| Error::source_failure(SourceErrorKind::Connection, "no catalog attached"))
    }
}

#[async_trait]
impl SourceAdapter for JobHistorySource {
    fn name(&self) -> &str {
        JOBS_SCHEMA
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            projection: true,
            limit: true,
            ..Capabilities::none()
        }
    }

    async fn tables(&self) -> Result<Vec<String>> {
        Ok(self
            .catalog()
            .await?
            .list_jobs()
            .await?
            .into_iter()
            .map(|j| j.name)
            .collect())
    }

    async fn schema(&self, table: &str) -> Result<Schema> {
        let catalog = self.catalog().await?;
        match catalog.get_job(&table.to_lowercase()).await? {
            Some(_) => Ok(Self::history_schema()),
            None => Err(unknown_table(JOBS_SCHEMA, table)),
        }
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Batch> {
        let catalog = self.catalog().await?;
        let name = request.table.to_lowercase();
        if catalog.get_job(&name).await?.is_none() {
            return Err(unknown_table(JOBS_SCHEMA, &request.table));
        }
        let runs = catalog
            .list_runs(&name, request.limit.unwrap_or(i64::MAX as usize))
            .await?;
        let rows = runs
            .into_iter()
            .map(|run| {
                vec![
                    Value::from(run.id),
                    Value::from(run.started_at),
                    Value::from(run.completed_at),
                    Value::from(run.status),
                    Value::Int(run.rows_processed),
                    Value::from(run.error),
                ]
            })
            .collect();
        project(
            Batch::new(Self::history_schema(), rows),
            request.columns.as_ref(),
        )
    }
}
