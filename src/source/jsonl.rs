//! Directory of JSON-lines files, one table per `<table>.jsonl`

use super::{Capabilities, FetchRequest, FilterSupport, SourceAdapter};
use crate::error::{Error, Result, SourceErrorKind};
use crate::value::{Batch, Schema, Value};
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub struct JsonlSource {
    name: String,
    root: PathBuf,
}

impl JsonlSource {
    pub fn new(name: &str, root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::source_failure(
                SourceErrorKind::Connection,
                format!("not a directory: {}", root.display()),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            root: root.to_path_buf(),
        })
    }

    fn table_path(&self, table: &str) -> Result<PathBuf> {
        WalkDir::new(&self.root)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .find(|p| {
                p.extension().is_some_and(|ext| ext == "jsonl")
                    && p
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .is_some_and(|s| s.eq_ignore_ascii_case(table))
            })
            .ok_or_else(|| {
                Error::source_failure(
                    SourceErrorKind::Schema,
                    format!("no such table: {}.{}", self.name, table),
                )
            })
    }

    /// Read up to `limit` objects; blank lines are skipped
    async fn read_objects(&self, table: &str, limit: Option<usize>) -> Result<Vec<Map<String, JsonValue>>> {
        let path = self.table_path(table)?;
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::source_failure(SourceErrorKind::Connection, format!("{}: {}", path.display(), e))
        })?;

        let mut objects = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if limit.is_some_and(|n| objects.len() >= n) {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonValue>(line) {
                Ok(JsonValue::Object(obj)) => objects.push(obj),
                Ok(_) => {
                    return Err(Error::source_failure(
                        SourceErrorKind::Schema,
                        format!("{}:{}: expected a JSON object", path.display(), line_no + 1),
                    ))
                }
                Err(e) => {
                    warn!("Skipping malformed line {} of {:?}: {}", line_no + 1, path, e);
                }
            }
        }
        debug!("Read {} rows from {:?}", objects.len(), path);
        Ok(objects)
    }
}

#[async_trait]
impl SourceAdapter for JsonlSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            filter: FilterSupport::None,
            projection: true,
            order_by: false,
            limit: true,
            ..Capabilities::none()
        }
    }

    async fn tables(&self) -> Result<Vec<String>> {
        let mut tables: Vec<String> = WalkDir::new(&self.root)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
            .filter_map(|e| e.path().file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        tables.sort();
        Ok(tables)
    }

    /// Union of keys over the whole file, in first-seen order
    async fn schema(&self, table: &str) -> Result<Schema> {
        Ok(Batch::from_json_rows(self.read_objects(table, None).await?).schema)
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Batch> {
        if !request.filters.is_empty() || !request.order_by.is_empty() {
            return Err(Error::Execution(format!(
                "{} cannot evaluate filters or ordering",
                self.name
            )));
        }
        let full_schema = self.schema(&request.table).await?;
        let objects = self.read_objects(&request.table, request.limit).await?;

        let columns = match &request.columns {
            Some(cols) => cols.clone(),
            None => full_schema.names(),
        };
        for column in &columns {
            if !full_schema.contains(None, column) {
                return Err(Error::source_failure(
                    SourceErrorKind::Schema,
                    format!("no such column: {}.{}.{}", self.name, request.table, column),
                ));
            }
        }

        let rows = objects
            .into_iter()
            .map(|obj| {
                columns
                    .iter()
                    .map(|c| {
                        obj.iter()
                            .find(|(k, _)| k.eq_ignore_ascii_case(c))
                            .map(|(_, v)| Value::from_json(v.clone()))
                            .unwrap_or(Value::Null)
                    })
                    .collect()
            })
            .collect();
        Ok(Batch::new(Schema::from_names(&columns), rows))
    }
}
