//! Plan executor
//!
//! Steps run in dependency order on a bounded worker pool. A step is
//! launched only once every input has produced its full result; eligible
//! steps are launched in plan order and may run concurrently. Dropping the
//! in-flight set aborts every running step and returns its pool slot.

pub mod expr;
pub mod operators;

use crate::config::{Config, ExecutorConfig};
use crate::error::{Error, Result};
use crate::inference::{InferenceGateway, JsonRow};
use crate::kb::WriteSummary;
use crate::plan::{InferInput, Plan, PlanStep, StepId, StepKind};
use crate::value::{Batch, Row, Schema};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Explicit cancellation of a running statement. Clones share the signal.
#[derive(Clone)]
pub struct CancelHandle {
    signal: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            signal: Arc::new(watch::Sender::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.signal.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.signal.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        let mut rx = self.signal.subscribe();
        if rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Materialized statement result
#[derive(Debug)]
pub struct RowStream {
    schema: Schema,
    rows: std::vec::IntoIter<Row>,
    write_summary: Option<WriteSummary>,
}

impl RowStream {
    fn new(batch: Batch, write_summary: Option<WriteSummary>) -> Self {
        Self {
            schema: batch.schema,
            rows: batch.rows.into_iter(),
            write_summary,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Row counts and per-row failures of a `write` step, if the plan had one
    pub fn write_summary(&self) -> Option<&WriteSummary> {
        self.write_summary.as_ref()
    }

    /// Remaining rows as a batch
    pub fn into_batch(self) -> Batch {
        Batch::new(self.schema, self.rows.collect())
    }
}

impl Iterator for RowStream {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.rows.next()
    }
}

struct StepOutput {
    id: StepId,
    batch: Batch,
    write_summary: Option<WriteSummary>,
}

pub struct Executor {
    gateway: Arc<InferenceGateway>,
    max_parallel: usize,
    timeout: Duration,
}

impl Executor {
    pub fn new(config: &Config) -> Self {
        Self::with_gateway(
            Arc::new(InferenceGateway::new(&config.inference)),
            &config.executor,
        )
    }

    pub fn with_gateway(gateway: Arc<InferenceGateway>, config: &ExecutorConfig) -> Self {
        Self {
            gateway,
            max_parallel: config.max_parallel_steps.max(1),
            timeout: Duration::from_secs(config.statement_timeout_secs.max(1)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn gateway(&self) -> &Arc<InferenceGateway> {
        &self.gateway
    }

    pub async fn execute(&self, plan: &Plan, row_limit: Option<usize>) -> Result<RowStream> {
        self.execute_with_cancel(plan, row_limit, &CancelHandle::new()).await
    }

    /// Run `plan` until it finishes, times out, or `cancel` fires
    pub async fn execute_with_cancel(
        &self,
        plan: &Plan,
        row_limit: Option<usize>,
        cancel: &CancelHandle,
    ) -> Result<RowStream> {
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            outcome = tokio::time::timeout(self.timeout, self.run(plan, row_limit)) => {
                outcome.map_err(|_| Error::Timeout(self.timeout))?
            }
        };
        match &result {
            Ok(stream) => info!(
                "Statement finished: {} steps, {} rows in {:?}",
                plan.len(),
                stream.rows.len(),
                started.elapsed()
            ),
            Err(e) => info!("Statement failed after {:?}: {}", started.elapsed(), e),
        }
        result
    }

    async fn run(&self, plan: &Plan, row_limit: Option<usize>) -> Result<RowStream> {
        let pool = Arc::new(Semaphore::new(self.max_parallel));
        let mut results: HashMap<StepId, Arc<Batch>> = HashMap::new();
        let mut launched = vec![false; plan.len()];
        let mut in_flight: JoinSet<Result<StepOutput>> = JoinSet::new();
        let mut summary: Option<WriteSummary> = None;

        loop {
            for (i, step) in plan.steps().iter().enumerate() {
                if launched[i] || !step.inputs.iter().all(|id| results.contains_key(id)) {
                    continue;
                }
                launched[i] = true;
                let inputs: Vec<Arc<Batch>> = step
                    .inputs
                    .iter()
                    .filter_map(|id| results.get(id).cloned())
                    .collect();
                let step = step.clone();
                let gateway = self.gateway.clone();
                let pool = pool.clone();
                in_flight.spawn(async move {
                    let _permit = pool
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::Execution("worker pool closed".to_string()))?;
                    run_step(step, inputs, gateway, row_limit).await
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let output = joined.map_err(|e| Error::Execution(format!("step panicked: {}", e)))??;
            if let Some(step_summary) = output.write_summary {
                summary.get_or_insert_with(WriteSummary::default).merge(step_summary);
            }
            results.insert(output.id, Arc::new(output.batch));
        }

        let output = results
            .remove(&plan.output_id())
            .ok_or_else(|| Error::Execution("plan produced no output".to_string()))?;
        let mut batch = Arc::try_unwrap(output).unwrap_or_else(|shared| (*shared).clone());
        if let Some(n) = row_limit {
            batch.rows.truncate(n);
        }
        Ok(RowStream::new(batch, summary))
    }
}

fn first_input(step: &PlanStep, inputs: &[Arc<Batch>]) -> Result<Arc<Batch>> {
    inputs.first().cloned().ok_or_else(|| {
        Error::Execution(format!("step #{} ({}) has no input", step.id, step.kind.name()))
    })
}

/// `n` tightened by `row_limit` when the step may stop early
fn capped(n: Option<usize>, row_limit: Option<usize>, early_stop: bool) -> Option<usize> {
    match (n, row_limit) {
        (Some(n), Some(r)) if early_stop => Some(n.min(r)),
        (None, Some(r)) if early_stop => Some(r),
        (n, _) => n,
    }
}

async fn run_step(
    step: PlanStep,
    inputs: Vec<Arc<Batch>>,
    gateway: Arc<InferenceGateway>,
    row_limit: Option<usize>,
) -> Result<StepOutput> {
    let started = Instant::now();
    let mut write_summary = None;
    let batch = match &step.kind {
        StepKind::Fetch {
            handle,
            alias,
            request,
            early_stop,
            ..
        } => {
            let mut request = request.clone();
            let cap = capped(request.limit, row_limit, *early_stop);
            if handle.capabilities().limit {
                request.limit = cap;
            }
            let mut batch = handle.fetch(&request).await?;
            if let Some(n) = cap {
                batch.rows.truncate(n);
            }
            Batch::new(batch.schema.qualify(alias), batch.rows)
        }
        StepKind::VectorSearch {
            kb,
            alias,
            query,
            filters,
            k,
            early_stop,
        } => {
            let k = capped(*k, row_limit, *early_stop);
            let batch = match query {
                Some(text) => {
                    let hits = match k {
                        Some(k) => kb.search(text, filters, k).await?,
                        None => kb.search_all(text, filters).await?,
                    };
                    kb.hits_to_batch(&hits)
                }
                None => kb.chunks_to_batch(&kb.scan(filters, k).await?),
            };
            Batch::new(batch.schema.qualify(alias), batch.rows)
        }
        StepKind::Infer { target, input, .. } => match input {
            InferInput::Literal(row) => {
                operators::infer_literal(&gateway, target, JsonRow::clone(row), &step.schema).await?
            }
            InferInput::Rows => {
                let left = first_input(&step, &inputs)?;
                operators::infer_rows(&gateway, target, &left, &step.schema).await?
            }
        },
        StepKind::Join { kind, keys, filter } => {
            let (left, right) = match inputs.as_slice() {
                [left, right] => (left, right),
                _ => {
                    return Err(Error::Execution(format!(
                        "join #{} needs two inputs, got {}",
                        step.id,
                        inputs.len()
                    )))
                }
            };
            operators::hash_join(left, right, *kind, keys, filter.as_ref())?
        }
        StepKind::Filter { predicate } => operators::filter(first_input(&step, &inputs)?.as_ref(), predicate)?,
        StepKind::Project { items } => {
            operators::project(inputs.first().map(|b| b.as_ref()), items)?
        }
        StepKind::Aggregate {
            group_by,
            aggregates,
        } => operators::aggregate(
            first_input(&step, &inputs)?.as_ref(),
            group_by,
            aggregates,
            step.schema.clone(),
        )?,
        StepKind::Sort { keys } => operators::sort(first_input(&step, &inputs)?.as_ref(), keys)?,
        StepKind::Limit { n } => operators::limit(first_input(&step, &inputs)?.as_ref(), *n),
        StepKind::Merge { distinct } => operators::merge(&inputs, *distinct, step.schema.clone()),
        StepKind::Write { kb } => {
            let summary = kb.write(first_input(&step, &inputs)?.as_ref()).await?;
            let batch = operators::write_summary_batch(&summary);
            write_summary = Some(summary);
            batch
        }
    };
    debug!(
        "Step #{} {} produced {} rows in {:?}",
        step.id,
        step.kind.name(),
        batch.len(),
        started.elapsed()
    );
    Ok(StepOutput {
        id: step.id,
        batch,
        write_summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, Expr, OrderByExpr};
    use crate::plan::ProjectItem;
    use crate::source::{FetchRequest, SourceHandle};
    use crate::test_support;
    use crate::value::{Field, Value};

    fn executor() -> Executor {
        Executor::new(&test_support::config())
    }

    fn fetch_step(id: StepId, handle: &Arc<SourceHandle>, table: &str, alias: &str, schema: Schema) -> PlanStep {
        PlanStep {
            id,
            kind: StepKind::Fetch {
                handle: handle.clone(),
                relation: format!("crm.{}", table),
                alias: alias.to_string(),
                request: FetchRequest::table(table),
                early_stop: false,
            },
            inputs: vec![],
            schema,
        }
    }

    #[tokio::test]
    async fn test_join_sort_limit_pipeline() {
        let handle = Arc::new(test_support::crm_handle());
        let customers = test_support::customers_schema().qualify("c");
        let orders = test_support::orders_schema().qualify("o");
        let joined = customers.join(&orders);
        let steps = vec![
            fetch_step(0, &handle, "customers", "c", customers),
            fetch_step(1, &handle, "orders", "o", orders),
            PlanStep {
                id: 2,
                kind: StepKind::Join {
                    kind: crate::ast::JoinKind::Inner,
                    keys: vec![(Expr::col("c.id"), Expr::col("o.customer_id"))],
                    filter: None,
                },
                inputs: vec![0, 1],
                schema: joined.clone(),
            },
            PlanStep {
                id: 3,
                kind: StepKind::Sort {
                    keys: vec![OrderByExpr {
                        expr: Expr::col("o.amount"),
                        asc: false,
                    }],
                },
                inputs: vec![2],
                schema: joined.clone(),
            },
            PlanStep {
                id: 4,
                kind: StepKind::Limit { n: 2 },
                inputs: vec![3],
                schema: joined,
            },
        ];
        let plan = Plan::new(steps, 4).unwrap();
        let batch = executor().execute(&plan, None).await.unwrap().into_batch();
        assert_eq!(batch.len(), 2);
        let amount = batch.schema.index_of(Some("o"), "amount").unwrap();
        assert!(batch.rows[0][amount].sort_cmp(&batch.rows[1][amount]).is_ge());
    }

    #[tokio::test]
    async fn test_row_limit_truncates_output() {
        let handle = Arc::new(test_support::crm_handle());
        let steps = vec![fetch_step(0, &handle, "customers", "c", test_support::customers_schema().qualify("c"))];
        let plan = Plan::new(steps, 0).unwrap();
        assert!(plan.steps()[0].kind.is_early_stop());
        let stream = executor().execute(&plan, Some(2)).await.unwrap();
        assert_eq!(stream.count(), 2);
    }

    #[tokio::test]
    async fn test_failing_step_fails_statement() {
        let handle = Arc::new(test_support::crm_handle());
        let schema = Schema::new(vec![Field::qualified("x", "id")]);
        let steps = vec![
            fetch_step(0, &handle, "missing", "x", schema.clone()),
            PlanStep {
                id: 1,
                kind: StepKind::Filter {
                    predicate: Expr::binary(Expr::col("id"), BinaryOp::Gt, Expr::lit(1)),
                },
                inputs: vec![0],
                schema,
            },
        ];
        let plan = Plan::new(steps, 1).unwrap();
        let err = executor().execute(&plan, None).await.unwrap_err();
        assert!(matches!(err, Error::Source { .. }));
    }

    #[tokio::test]
    async fn test_statement_timeout() {
        let registry = test_support::registry_with_slow_model(Duration::from_secs(5));
        let target = registry.inference_targets().into_iter().next().unwrap();
        let mut row = JsonRow::new();
        row.insert("question".into(), "hi".into());
        let steps = vec![PlanStep {
            id: 0,
            schema: Schema::from_names(&["question", "answer"]),
            kind: StepKind::Infer {
                target,
                alias: "slow".into(),
                input: InferInput::Literal(row),
            },
            inputs: vec![],
        }];
        let plan = Plan::new(steps, 0).unwrap();
        let err = executor()
            .with_timeout(Duration::from_millis(50))
            .execute(&plan, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let items = vec![ProjectItem {
            expr: Expr::lit(Value::Int(1)),
            field: Field::new("one"),
        }];
        let plan = Plan::new(
            vec![PlanStep {
                id: 0,
                kind: StepKind::Project { items },
                inputs: vec![],
                schema: Schema::from_names(&["one"]),
            }],
            0,
        )
        .unwrap();
        let cancel = CancelHandle::new();
        cancel.cancel();
        assert!(cancel.is_cancelled());
        let err = executor()
            .execute_with_cancel(&plan, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
