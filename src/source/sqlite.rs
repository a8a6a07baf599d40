//! SQLite tables with full pushdown
//!
//! Pushed filters, projection, ordering and limit are rendered into one
//! SELECT with `?` binds, so the database evaluates them exactly.

use super::{Capabilities, FetchRequest, SourceAdapter};
use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::{Error, PlanError, Result, SourceErrorKind};
use crate::value::{Batch, Schema, Value};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, TypeInfo, ValueRef};
use std::path::Path;
use tracing::debug;

pub struct SqliteSource {
    name: String,
    pool: SqlitePool,
}

impl SqliteSource {
    /// Open an existing database file read-only
    pub async fn open(name: &str, path: &Path) -> Result<Self> {
        Self::open_with(name, path, 5).await
    }

    pub async fn open_with(name: &str, path: &Path, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(false)
            .read_only(true);

        debug!("Opening SQLite source '{}' at {:?}", name, path);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self::from_pool(name, pool))
    }

    pub fn from_pool(name: &str, pool: SqlitePool) -> Self {
        Self {
            name: name.to_string(),
            pool,
        }
    }
}

/// Classify driver errors into source error kinds
fn map_sqlx_error(err: sqlx::Error) -> Error {
    let kind = match &err {
        sqlx::Error::PoolTimedOut => SourceErrorKind::Timeout,
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            SourceErrorKind::Connection
        }
        sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => SourceErrorKind::Schema,
        sqlx::Error::Database(db) => {
            let message = db.message();
            if message.contains("no such table") || message.contains("no such column") {
                SourceErrorKind::Schema
            } else if message.contains("not authorized") || message.contains("unable to open") {
                SourceErrorKind::Auth
            } else if message.contains("locked") || message.contains("busy") {
                SourceErrorKind::Timeout
            } else {
                SourceErrorKind::Other
            }
        }
        _ => SourceErrorKind::Other,
    };
    Error::source_failure(kind, err.to_string())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// SELECT text plus bind values for one request
#[derive(Debug, Default)]
struct SqlBuilder {
    sql: String,
    binds: Vec<Value>,
}

impl SqlBuilder {
    fn build(request: &FetchRequest) -> std::result::Result<Self, PlanError> {
        let mut builder = SqlBuilder::default();
        let columns = match &request.columns {
            Some(cols) if !cols.is_empty() => cols
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            // Zero requested columns still needs one row per match
            Some(_) => "1".to_string(),
            None => "*".to_string(),
        };
        builder.sql = format!("SELECT {} FROM {}", columns, quote_ident(&request.table));

        if !request.filters.is_empty() {
            builder.sql.push_str(" WHERE ");
            for (i, filter) in request.filters.iter().enumerate() {
                if i > 0 {
                    builder.sql.push_str(" AND ");
                }
                builder.render(filter)?;
            }
        }

        if !request.order_by.is_empty() {
            let keys: Vec<String> = request
                .order_by
                .iter()
                .map(|k| {
                    format!(
                        "{} {} NULLS LAST",
                        quote_ident(&k.column),
                        if k.asc { "ASC" } else { "DESC" }
                    )
                })
                .collect();
            builder.sql.push_str(" ORDER BY ");
            builder.sql.push_str(&keys.join(", "));
        }

        if let Some(limit) = request.limit {
            builder.sql.push_str(&format!(" LIMIT {}", limit));
        }
        Ok(builder)
    }

    fn render(&mut self, expr: &Expr) -> std::result::Result<(), PlanError> {
        match expr {
            Expr::Column(c) => self.sql.push_str(&quote_ident(&c.name)),
            Expr::Literal(v) => {
                self.sql.push('?');
                self.binds.push(v.clone());
            }
            Expr::Binary { left, op, right } => {
                self.sql.push('(');
                self.render(left)?;
                self.sql.push_str(&format!(" {} ", op.sql()));
                self.render(right)?;
                self.sql.push(')');
                if *op == BinaryOp::Concat {
                    return Err(PlanError::UnsatisfiablePushdown(
                        "string concatenation".to_string(),
                    ));
                }
            }
            Expr::Unary { op, expr } => {
                self.sql.push_str(match op {
                    UnaryOp::Not => "(NOT ",
                    UnaryOp::Neg => "(-",
                });
                self.render(expr)?;
                self.sql.push(')');
            }
            Expr::IsNull { expr, negated } => {
                self.sql.push('(');
                self.render(expr)?;
                self.sql
                    .push_str(if *negated { " IS NOT NULL)" } else { " IS NULL)" });
            }
            Expr::InList {
                expr,
                list,
                negated,
            } if list.is_empty() => {
                // SQLite answers `NULL IN ()` with 0; keep it unknown
                self.sql.push_str("(CASE WHEN ");
                self.render(expr)?;
                self.sql.push_str(&format!(
                    " IS NULL THEN NULL ELSE {} END)",
                    if *negated { 1 } else { 0 }
                ));
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                self.sql.push('(');
                self.render(expr)?;
                self.sql.push_str(if *negated { " NOT IN (" } else { " IN (" });
                for (i, item) in list.iter().enumerate() {
                    if i > 0 {
                        self.sql.push_str(", ");
                    }
                    self.render(item)?;
                }
                self.sql.push_str("))");
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                self.sql.push('(');
                self.render(expr)?;
                self.sql
                    .push_str(if *negated { " NOT LIKE " } else { " LIKE " });
                self.render(pattern)?;
                self.sql.push(')');
            }
            Expr::Function { name, args, .. } => {
                let name = name.to_lowercase();
                if !matches!(name.as_str(), "lower" | "upper" | "coalesce" | "ifnull") {
                    return Err(PlanError::UnsatisfiablePushdown(format!(
                        "function {}() on sqlite",
                        name
                    )));
                }
                self.sql.push_str(&name);
                self.sql.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        self.sql.push_str(", ");
                    }
                    self.render(arg)?;
                }
                self.sql.push(')');
            }
            Expr::Wildcard | Expr::Last => {
                return Err(PlanError::UnsatisfiablePushdown(expr.to_string()));
            }
        }
        Ok(())
    }
}

fn decode_row(row: &SqliteRow, width: usize) -> Result<Vec<Value>> {
    (0..width)
        .map(|i| {
            let raw = row.try_get_raw(i).map_err(map_sqlx_error)?;
            if raw.is_null() {
                return Ok(Value::Null);
            }
            let type_name = raw.type_info().name().to_uppercase();
            let value = if type_name.contains("INT") {
                Value::Int(row.try_get_unchecked::<i64, _>(i).map_err(map_sqlx_error)?)
            } else if type_name == "BOOLEAN" {
                Value::Bool(row.try_get_unchecked::<bool, _>(i).map_err(map_sqlx_error)?)
            } else if matches!(type_name.as_str(), "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC") {
                Value::Float(row.try_get_unchecked::<f64, _>(i).map_err(map_sqlx_error)?)
            } else if type_name == "BLOB" {
                let bytes = row
                    .try_get_unchecked::<Vec<u8>, _>(i)
                    .map_err(map_sqlx_error)?;
                Value::Text(String::from_utf8_lossy(&bytes).into_owned())
            } else {
                Value::Text(row.try_get_unchecked::<String, _>(i).map_err(map_sqlx_error)?)
            };
            Ok(value)
        })
        .collect()
}

#[async_trait]
impl SourceAdapter for SqliteSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            ascii_case_folding: true,
            ..Capabilities::all()
        }
    }

    async fn tables(&self) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') \
             AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn schema(&self, table: &str) -> Result<Schema> {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        if rows.is_empty() {
            return Err(Error::source_failure(
                SourceErrorKind::Schema,
                format!("no such table: {}.{}", self.name, table),
            ));
        }
        let names = rows
            .iter()
            .map(|r| r.try_get_unchecked::<String, _>("name").map_err(map_sqlx_error))
            .collect::<Result<Vec<_>>>()?;
        Ok(Schema::from_names(&names))
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Batch> {
        let schema = match &request.columns {
            Some(cols) => Schema::from_names(cols),
            None => self.schema(&request.table).await?,
        };
        let SqlBuilder { sql, binds } = SqlBuilder::build(request)?;
        debug!("{}: {}", self.name, sql);

        let mut query = sqlx::query(&sql);
        for value in binds {
            query = match value {
                Value::Null => query.bind(None::<String>),
                Value::Bool(b) => query.bind(b),
                Value::Int(i) => query.bind(i),
                Value::Float(f) => query.bind(f),
                Value::Text(s) => query.bind(s),
                Value::Json(j) => query.bind(j.to_string()),
            };
        }

        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        let width = schema.len();
        let rows = rows
            .iter()
            .map(|row| decode_row(row, width))
            .collect::<Result<Vec<_>>>()?;
        Ok(Batch::new(schema, rows))
    }
}
