//! Source adapters
//!
//! A source adapter exposes the tables of one external data source and
//! declares what it can evaluate itself. The planner only pushes work an
//! adapter's [`Capabilities`] claim; the adapter must evaluate pushed work
//! exactly.

mod jsonl;
mod memory;
mod sqlite;
pub mod system;

pub use jsonl::JsonlSource;
pub use memory::MemorySource;
pub use sqlite::SqliteSource;

use crate::ast::{BinaryOp, Expr};
use crate::config::{Config, SourceConfig, SourceKind};
use crate::error::{Error, Result, SourceErrorKind};
use crate::exec::expr::ScalarFunc;
use crate::retry::{retry_async, RetrySettings};
use crate::value::{Batch, Schema, Value};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// How much of a WHERE clause an adapter evaluates natively
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSupport {
    /// Nothing; every predicate stays residual
    #[default]
    None,
    /// `col <op> literal`, `col IN (literals)`, `col LIKE literal`, `col IS [NOT] NULL`
    Simple,
    /// Any scalar predicate over the relation's own columns
    Full,
}

/// Capability descriptor of a relation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub filter: FilterSupport,
    pub projection: bool,
    pub order_by: bool,
    pub limit: bool,
    /// LIKE and lower()/upper() fold only ASCII letters, so predicates that
    /// need Unicode case folding are evaluated locally
    pub ascii_case_folding: bool,
}

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            filter: FilterSupport::Full,
            projection: true,
            order_by: true,
            limit: true,
            ascii_case_folding: false,
        }
    }

    /// Whether a single conjunct may be handed to the adapter
    pub fn accepts_filter(&self, expr: &Expr) -> bool {
        let supported = match self.filter {
            FilterSupport::None => false,
            FilterSupport::Simple => is_simple_predicate(expr),
            FilterSupport::Full => is_scalar_predicate(expr),
        };
        supported && !(self.ascii_case_folding && folds_case_beyond_ascii(expr))
    }
}

/// Whether evaluating `expr` may fold the case of non-ASCII text
fn folds_case_beyond_ascii(expr: &Expr) -> bool {
    match expr {
        Expr::Like { expr, pattern, .. } => {
            matches!(pattern.as_ref(), Expr::Literal(Value::Text(p)) if !p.is_ascii())
                || folds_case_beyond_ascii(expr)
        }
        Expr::Function { name, args, .. } => {
            matches!(
                ScalarFunc::from_name(name),
                Some(ScalarFunc::Lower | ScalarFunc::Upper)
            ) || args.iter().any(folds_case_beyond_ascii)
        }
        Expr::Binary { left, right, .. } => {
            folds_case_beyond_ascii(left) || folds_case_beyond_ascii(right)
        }
        Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => folds_case_beyond_ascii(expr),
        Expr::InList { expr, list, .. } => {
            folds_case_beyond_ascii(expr) || list.iter().any(folds_case_beyond_ascii)
        }
        Expr::Column(_) | Expr::Literal(_) | Expr::Wildcard | Expr::Last => false,
    }
}

fn is_column(e: &Expr) -> bool {
    matches!(e, Expr::Column(_))
}

fn is_literal(e: &Expr) -> bool {
    matches!(e, Expr::Literal(_))
}

fn is_simple_predicate(expr: &Expr) -> bool {
    match expr {
        Expr::Binary { left, op, right } if op.is_comparison() => {
            (is_column(left) && is_literal(right)) || (is_literal(left) && is_column(right))
        }
        Expr::InList { expr, list, .. } => is_column(expr) && list.iter().all(is_literal),
        Expr::Like { expr, pattern, .. } => is_column(expr) && is_literal(pattern),
        Expr::IsNull { expr, .. } => is_column(expr),
        _ => false,
    }
}

fn is_scalar_predicate(expr: &Expr) -> bool {
    match expr {
        Expr::Column(_) | Expr::Literal(_) => true,
        Expr::Binary { left, op, right } => {
            // String concatenation differs between dialects
            *op != BinaryOp::Concat && is_scalar_predicate(left) && is_scalar_predicate(right)
        }
        Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => is_scalar_predicate(expr),
        Expr::InList { expr, list, .. } => {
            is_scalar_predicate(expr) && list.iter().all(is_scalar_predicate)
        }
        Expr::Like { expr, pattern, .. } => is_scalar_predicate(expr) && is_literal(pattern),
        Expr::Function { name, args, .. } => {
            matches!(
                ScalarFunc::from_name(name),
                Some(ScalarFunc::Lower | ScalarFunc::Upper | ScalarFunc::Coalesce)
            ) && args.iter().all(is_scalar_predicate)
        }
        Expr::Wildcard | Expr::Last => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortKey {
    pub column: String,
    pub asc: bool,
}

/// Work handed to an adapter. Column references in `filters` are unqualified.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FetchRequest {
    pub table: String,
    /// `None` = every column in table order
    pub columns: Option<Vec<String>>,
    pub filters: Vec<Expr>,
    pub order_by: Vec<SortKey>,
    pub limit: Option<usize>,
}

impl FetchRequest {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }
}

/// One external data source
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    async fn tables(&self) -> Result<Vec<String>>;

    /// Unqualified column list; `Schema` error kind for unknown tables
    async fn schema(&self, table: &str) -> Result<Schema>;

    /// Rows with an unqualified schema, restricted to `columns` when given
    async fn fetch(&self, request: &FetchRequest) -> Result<Batch>;
}

/// Adapter plus its connection budget. Callers beyond the budget queue;
/// transient failures are retried with backoff.
pub struct SourceHandle {
    adapter: Arc<dyn SourceAdapter>,
    permits: Semaphore,
    retry: RetrySettings,
}

impl SourceHandle {
    pub fn new(adapter: Arc<dyn SourceAdapter>, max_connections: usize, retry: RetrySettings) -> Self {
        Self {
            adapter,
            permits: Semaphore::new(max_connections.max(1)),
            retry,
        }
    }

    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.adapter.capabilities()
    }

    pub async fn tables(&self) -> Result<Vec<String>> {
        let _permit = self.acquire().await?;
        self.adapter.tables().await
    }

    pub async fn schema(&self, table: &str) -> Result<Schema> {
        let _permit = self.acquire().await?;
        retry_async(&format!("schema {}.{}", self.name(), table), self.retry, || {
            self.adapter.schema(table)
        })
        .await
    }

    pub async fn fetch(&self, request: &FetchRequest) -> Result<Batch> {
        let _permit = self.acquire().await?;
        debug!("Fetching {}.{}", self.name(), request.table);
        retry_async(&format!("fetch {}.{}", self.name(), request.table), self.retry, || {
            self.adapter.fetch(request)
        })
        .await
    }

    async fn acquire(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.permits.acquire().await.map_err(|_| {
            Error::source_failure(SourceErrorKind::Connection, "source pool closed")
        })
    }
}

/// Open a `[[source]]` entry from configuration
pub async fn open_source(source: &SourceConfig, config: &Config) -> Result<SourceHandle> {
    let adapter: Arc<dyn SourceAdapter> = match source.kind {
        SourceKind::Sqlite => Arc::new(SqliteSource::open(&source.name, &source.path).await?),
        SourceKind::Jsonl => Arc::new(JsonlSource::new(&source.name, &source.path)?),
    };
    Ok(SourceHandle::new(
        adapter,
        source
            .max_connections
            .unwrap_or(config.executor.source_max_connections),
        RetrySettings::new(config.executor.source_retries, config.inference.backoff_base_ms),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_simple_filter_support() {
        let caps = Capabilities {
            filter: FilterSupport::Simple,
            ..Capabilities::none()
        };
        assert!(caps.accepts_filter(&Expr::eq(Expr::col("a"), Expr::lit(1))));
        assert!(caps.accepts_filter(&Expr::binary(Expr::lit(1), BinaryOp::Lt, Expr::col("a"))));
        assert!(!caps.accepts_filter(&Expr::binary(
            Expr::eq(Expr::col("a"), Expr::lit(1)),
            BinaryOp::Or,
            Expr::eq(Expr::col("b"), Expr::lit(2)),
        )));
        assert!(!Capabilities::none().accepts_filter(&Expr::eq(Expr::col("a"), Expr::lit(1))));
    }

    #[test]
    fn test_full_filter_support_excludes_last() {
        let caps = Capabilities::all();
        assert!(caps.accepts_filter(&Expr::binary(
            Expr::func("lower", vec![Expr::col("a")]),
            BinaryOp::Eq,
            Expr::Literal(Value::from("x")),
        )));
        assert!(!caps.accepts_filter(&Expr::binary(Expr::col("a"), BinaryOp::Gt, Expr::Last)));
    }

    #[test]
    fn test_ascii_folding_keeps_unicode_case_local() {
        let caps = Capabilities {
            ascii_case_folding: true,
            ..Capabilities::all()
        };
        let like = |pattern: &str| Expr::Like {
            expr: Box::new(Expr::col("name")),
            pattern: Box::new(Expr::lit(pattern)),
            negated: false,
        };
        assert!(caps.accepts_filter(&like("ada%")));
        assert!(!caps.accepts_filter(&like("émile%")));
        assert!(!caps.accepts_filter(&Expr::eq(
            Expr::func("lower", vec![Expr::col("name")]),
            Expr::lit("ada"),
        )));
        assert!(caps.accepts_filter(&Expr::eq(Expr::col("name"), Expr::lit("Émile"))));
        assert!(Capabilities::all().accepts_filter(&like("émile%")));
    }

    #[tokio::test]
    async fn test_handle_queues_instead_of_failing() {
        let source = Arc::new(MemorySource::new("mem"));
        source.create_table("t", Batch::new(Schema::from_names(&["a"]), vec![vec![Value::Int(1)]]));
        let handle = Arc::new(SourceHandle::new(source, 1, RetrySettings::new(0, 1)));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle.fetch(&FetchRequest::table("t")).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().len(), 1);
        }
        assert_eq!(handle.permits.available_permits(), 1);
    }
}
