//! In-process tables, mainly for tests and scratch data

use super::{Capabilities, FetchRequest, SourceAdapter};
use crate::error::{Error, Result, SourceErrorKind};
use crate::exec::expr::bind;
use crate::value::{Batch, Row, Schema};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

pub struct MemorySource {
    name: String,
    capabilities: Capabilities,
    tables: RwLock<HashMap<String, Batch>>,
}

impl MemorySource {
    pub fn new(name: &str) -> Self {
        Self::with_capabilities(name, Capabilities::all())
    }

    /// Restrict pushdown, e.g. to exercise residual filtering
    pub fn with_capabilities(name: &str, capabilities: Capabilities) -> Self {
        Self {
            name: name.to_string(),
            capabilities,
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Create or replace a table. The batch schema is stored unqualified.
    pub fn create_table(&self, table: &str, batch: Batch) {
        let batch = Batch::new(Schema::from_names(&batch.schema.names()), batch.rows);
        self.tables
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(table.to_lowercase(), batch);
    }

    /// Append rows to an existing table
    pub fn insert_rows(&self, table: &str, rows: Vec<Row>) -> Result<()> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let batch = tables
            .get_mut(&table.to_lowercase())
            .ok_or_else(|| unknown_table(&self.name, table))?;
        if let Some(bad) = rows.iter().find(|r| r.len() != batch.schema.len()) {
            return Err(Error::source_failure(
                SourceErrorKind::Schema,
                format!(
                    "row has {} values, {}.{} has {} columns",
                    bad.len(),
                    self.name,
                    table,
                    batch.schema.len()
                ),
            ));
        }
        batch.rows.extend(rows);
        Ok(())
    }

    fn snapshot(&self, table: &str) -> Result<Batch> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&table.to_lowercase())
            .cloned()
            .ok_or_else(|| unknown_table(&self.name, table))
    }
}

fn unknown_table(source: &str, table: &str) -> Error {
    Error::source_failure(
        SourceErrorKind::Schema,
        format!("no such table: {}.{}", source, table),
    )
}

#[async_trait]
impl SourceAdapter for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn tables(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn schema(&self, table: &str) -> Result<Schema> {
        Ok(self.snapshot(table)?.schema)
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Batch> {
        let Batch { schema, mut rows } = self.snapshot(&request.table)?;

        for filter in &request.filters {
            let predicate = bind(filter, &schema)?;
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows {
                if predicate.matches(&row)? {
                    kept.push(row);
                }
            }
            rows = kept;
        }

        if !request.order_by.is_empty() {
            let keys = request
                .order_by
                .iter()
                .map(|k| Ok((schema.index_of(None, &k.column)?, k.asc)))
                .collect::<Result<Vec<_>>>()?;
            rows.sort_by(|a, b| {
                keys.iter()
                    .map(|(i, asc)| a[*i].order_cmp(&b[*i], *asc))
                    .find(|o| o.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        if let Some(limit) = request.limit {
            rows.truncate(limit);
        }

        match &request.columns {
            None => Ok(Batch::new(schema, rows)),
            Some(columns) => {
                let indices = columns
                    .iter()
                    .map(|c| Ok(schema.index_of(None, c)?))
                    .collect::<Result<Vec<_>>>()?;
                let rows = rows
                    .into_iter()
                    .map(|row| indices.iter().map(|i| row[*i].clone()).collect())
                    .collect();
                Ok(Batch::new(Schema::from_names(columns), rows))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Expr;
    use crate::source::SortKey;
    use crate::value::Value;

    fn source() -> MemorySource {
        let source = MemorySource::new("mem");
        source.create_table(
            "people",
            Batch::new(
                Schema::from_names(&["id", "name", "age"]),
                vec![
                    vec![Value::Int(1), Value::from("ann"), Value::Int(40)],
                    vec![Value::Int(2), Value::from("bob"), Value::Null],
                    vec![Value::Int(3), Value::from("cy"), Value::Int(25)],
                ],
            ),
        );
        source
    }

    #[tokio::test]
    async fn test_fetch_with_pushdown() {
        let request = FetchRequest {
            table: "People".to_string(),
            columns: Some(vec!["name".to_string()]),
            filters: vec![Expr::binary(
                Expr::col("age"),
                crate::ast::BinaryOp::Gt,
                Expr::lit(20),
            )],
            order_by: vec![SortKey {
                column: "age".to_string(),
                asc: true,
            }],
            limit: Some(5),
        };
        let batch = source().fetch(&request).await.unwrap();
        assert_eq!(batch.schema.names(), vec!["name"]);
        assert_eq!(batch.rows, vec![vec![Value::from("cy")], vec![Value::from("ann")]]);
    }

    #[tokio::test]
    async fn test_unknown_table_is_schema_error() {
        let err = source().fetch(&FetchRequest::table("nope")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Source {
                kind: SourceErrorKind::Schema,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_insert_rows_checks_width() {
        let source = source();
        assert!(source.insert_rows("people", vec![vec![Value::Int(9)]]).is_err());
        source
            .insert_rows("people", vec![vec![Value::Int(4), Value::from("di"), Value::Int(31)]])
            .unwrap();
        assert_eq!(source.fetch(&FetchRequest::table("people")).await.unwrap().len(), 4);
    }
}
