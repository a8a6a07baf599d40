//! Statement dispatcher
//!
//! Routes DDL to the registry and catalog, plans and executes queries and
//! inserts, and runs job bodies for the scheduler.

use crate::ast::{
    BinaryOp, CreateAgent, CreateJob, CreateKnowledgeBase, CreateModel, Expr, ObjectKind,
    ObjectName, Query, Select, SelectItem, Statement,
};
use crate::catalog::{Catalog, Watermarks};
use crate::config::Config;
use crate::error::{Error, PlanError, Result};
use crate::exec::{CancelHandle, Executor, RowStream};
use crate::inference::{
    AgentDef, AgentEndpoint, HttpModelEndpoint, InferenceTarget, TargetKind, QUESTION_COLUMN,
};
use crate::kb::{KnowledgeBase, KnowledgeBaseDef};
use crate::plan::{Plan, Planner, PlannerOptions};
use crate::registry::{Registry, RelationKind};
use crate::scheduler::{self, Clock, JobOutcome, JobRunner, Scheduler};
use crate::source::open_source;
use crate::value::Value;
use crate::vector::{create_vector_store, VectorStore};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a statement produced
#[derive(Debug)]
pub enum StatementOutcome {
    Rows(RowStream),
    Created { kind: ObjectKind, name: String },
    Dropped { kind: ObjectKind, name: String, existed: bool },
    Deleted { rows: usize },
}

pub struct Engine {
    config: Config,
    registry: Arc<Registry>,
    catalog: Catalog,
    store: Arc<dyn VectorStore>,
    executor: Executor,
    planner: Planner,
}

impl Engine {
    /// Open the catalog and vector store, register configured sources and
    /// rebuild every stored object
    pub async fn open(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let catalog = Catalog::connect(&config).await?;
        let store = create_vector_store(&config).await?;
        let registry = Registry::new();
        for source in &config.sources {
            registry.register_source(open_source(source, &config).await?)?;
        }
        let engine = Self::with_parts(config, registry, catalog, store);
        engine.restore().await?;
        Ok(engine)
    }

    pub fn with_parts(
        config: Config,
        registry: Arc<Registry>,
        catalog: Catalog,
        store: Arc<dyn VectorStore>,
    ) -> Arc<Self> {
        registry.attach_catalog(catalog.clone());
        let executor = Executor::new(&config);
        let planner = Planner::new(registry.clone(), PlannerOptions::from_config(&config));
        Arc::new(Self {
            config,
            registry,
            catalog,
            store,
            executor,
            planner,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A scheduler whose jobs run through this engine
    pub fn scheduler(self: &Arc<Self>, clock: Arc<dyn Clock>) -> Scheduler {
        Scheduler::new(
            self.catalog.clone(),
            self.clone(),
            clock,
            self.config.scheduler.max_run_history,
        )
    }

    /// Re-register stored objects. Knowledge bases go first so agents can
    /// find them; an object that fails to load is skipped.
    async fn restore(&self) -> Result<()> {
        let order = [
            ObjectKind::KnowledgeBase,
            ObjectKind::Model,
            ObjectKind::Agent,
            ObjectKind::View,
        ];
        let mut restored = 0;
        for kind in order {
            for record in self.catalog.list_objects(Some(kind)).await? {
                let loaded = match record.statement() {
                    Ok(statement) => self.register(&statement).await,
                    Err(e) => Err(e),
                };
                match loaded {
                    Ok(_) => restored += 1,
                    Err(e) => warn!("Could not restore {} '{}': {}", kind, record.name, e),
                }
            }
        }
        info!("Restored {} catalog objects", restored);
        Ok(())
    }

    pub async fn explain(&self, statement: &Statement) -> Result<Plan> {
        self.planner.plan(statement).await
    }

    pub async fn execute(&self, statement: &Statement, row_limit: Option<usize>) -> Result<StatementOutcome> {
        self.execute_with_cancel(statement, row_limit, &CancelHandle::new())
            .await
    }

    pub async fn execute_with_cancel(
        &self,
        statement: &Statement,
        row_limit: Option<usize>,
        cancel: &CancelHandle,
    ) -> Result<StatementOutcome> {
        match statement {
            Statement::Query(_) | Statement::Insert { .. } => {
                let plan = self.planner.plan(statement).await?;
                debug!("Plan:\n{}", plan);
                let stream = self
                    .executor
                    .execute_with_cancel(&plan, row_limit, cancel)
                    .await?;
                Ok(StatementOutcome::Rows(stream))
            }
            Statement::Delete { target, selection } => self.delete(target, selection.as_ref()).await,
            Statement::CreateJob(job) => {
                scheduler::create_job(&self.catalog, self, job, Utc::now()).await?;
                Ok(StatementOutcome::Created {
                    kind: ObjectKind::Job,
                    name: job.name.qualified(),
                })
            }
            Statement::Drop {
                kind,
                name,
                if_exists,
            } => self.drop_object(*kind, name, *if_exists).await,
            Statement::CreateKnowledgeBase(CreateKnowledgeBase {
                name,
                if_not_exists: true,
                ..
            }) if self.registry.kind_of(&name.qualified()).is_some() => {
                debug!("Knowledge base {} already exists", name);
                Ok(StatementOutcome::Created {
                    kind: ObjectKind::KnowledgeBase,
                    name: name.qualified(),
                })
            }
            _ => {
                let fresh_collection = match statement {
                    Statement::CreateKnowledgeBase(create) => {
                        let name = create.name.qualified();
                        self.store.stats(&name).await.is_err().then_some(name)
                    }
                    _ => None,
                };
                let created = match self.register(statement).await {
                    Ok((kind, name)) => match self.catalog.insert_object(&name, kind, statement).await {
                        Ok(()) => Ok((kind, name)),
                        Err(e) => {
                            self.registry.unregister(&name);
                            Err(e)
                        }
                    },
                    Err(e) => Err(e),
                };
                match created {
                    Ok((kind, name)) => {
                        info!("Created {} '{}'", kind, name);
                        Ok(StatementOutcome::Created { kind, name })
                    }
                    Err(e) => {
                        // Only a collection this statement made is ours to remove
                        if let Some(collection) = fresh_collection {
                            if let Err(drop) = self.store.drop_collection(&collection).await {
                                warn!("Leaving collection {} behind: {}", collection, drop);
                            }
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    /// Rows of a query, for callers that only read
    pub async fn query(&self, query: &Query, row_limit: Option<usize>) -> Result<RowStream> {
        let plan = self.planner.plan(&Statement::Query(query.clone())).await?;
        self.executor.execute(&plan, row_limit).await
    }

    /// Build the backing component of a CREATE statement and register it
    async fn register(&self, statement: &Statement) -> Result<(ObjectKind, String)> {
        match statement {
            Statement::CreateKnowledgeBase(create) => {
                let name = create.name.qualified();
                let def = KnowledgeBaseDef::from_using(&create.using, &self.config)?;
                let kb = KnowledgeBase::open(&name, def, self.store.clone(), &self.config).await?;
                self.registry.register_knowledge_base(Arc::new(kb))?;
                Ok((ObjectKind::KnowledgeBase, name))
            }
            Statement::CreateModel(create) => {
                let target = self.model_target(create)?;
                let name = target.name.clone();
                self.registry.register_inference(Arc::new(target))?;
                Ok((ObjectKind::Model, name))
            }
            Statement::CreateAgent(create) => {
                let target = self.agent_target(create)?;
                let name = target.name.clone();
                self.registry.register_inference(Arc::new(target))?;
                Ok((ObjectKind::Agent, name))
            }
            Statement::CreateView { name, query } => {
                self.planner.plan(&Statement::Query(query.clone())).await?;
                let name = name.qualified();
                self.registry.register_view(&name, query.clone())?;
                Ok((ObjectKind::View, name))
            }
            _ => Err(PlanError::InvalidStatement("expected a CREATE statement".into()).into()),
        }
    }

    /// `CREATE MODEL name PREDICT cols USING base_url = ..., model_name = ...,
    /// input_columns = [...]`
    fn model_target(&self, create: &CreateModel) -> Result<InferenceTarget> {
        let name = create.name.qualified();
        if create.predict.is_empty() {
            return Err(PlanError::InvalidStatement(format!("model {} predicts no columns", name)).into());
        }
        let text = |key: &str| create.using.get(key).and_then(JsonValue::as_str);
        let base_url = text("base_url")
            .ok_or_else(|| Error::Config(format!("model {} needs USING base_url", name)))?;
        let model_name = text("model_name").unwrap_or(&name);
        let input_columns = match create.using.get("input_columns") {
            None => Vec::new(),
            Some(value) => column_list(value, "input_columns")?,
        };
        let timeout = Duration::from_secs(self.config.inference.timeout_secs);
        Ok(InferenceTarget {
            endpoint: Arc::new(HttpModelEndpoint::new(base_url, model_name, timeout)?),
            name,
            kind: TargetKind::Model,
            input_columns,
            output_columns: create.predict.iter().map(|c| c.to_lowercase()).collect(),
            timeout,
        })
    }

    fn agent_target(&self, create: &CreateAgent) -> Result<InferenceTarget> {
        let name = create.name.qualified();
        let def = AgentDef::from_using(&create.using, &self.config)?;
        let knowledge_bases = def
            .knowledge_bases
            .iter()
            .map(|kb| {
                self.registry
                    .knowledge_base(kb)
                    .ok_or_else(|| Error::UnknownRelation(kb.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let tables = def
            .tables
            .iter()
            .map(|qualified| {
                let (source, table) = qualified
                    .split_once('.')
                    .ok_or_else(|| Error::UnknownRelation(qualified.clone()))?;
                let handle = self
                    .registry
                    .source(source)
                    .ok_or_else(|| Error::UnknownRelation(qualified.clone()))?;
                Ok((handle, table.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        let endpoint = AgentEndpoint::new(&name, def, knowledge_bases, tables, &self.config)?;
        Ok(InferenceTarget {
            name,
            kind: TargetKind::Agent,
            input_columns: vec![QUESTION_COLUMN.to_string()],
            output_columns: AgentDef::output_columns(),
            endpoint: Arc::new(endpoint),
            timeout: Duration::from_secs(self.config.inference.agent_timeout_secs),
        })
    }

    /// `DELETE FROM kb WHERE ...`: metadata-filtered scan, then delete by id
    async fn delete(&self, target: &ObjectName, selection: Option<&Expr>) -> Result<StatementOutcome> {
        let name = target.qualified();
        let kb = self.registry.knowledge_base(&name).ok_or_else(|| {
            match self.registry.kind_of(&name) {
                Some(kind) => PlanError::Unsupported(format!("DELETE from {} {}", kind.as_str(), name)).into(),
                None => Error::UnknownRelation(name.clone()),
            }
        })?;
        let filters = selection
            .cloned()
            .map(Expr::conjuncts)
            .unwrap_or_default()
            .iter()
            .map(|conjunct| {
                kb.metadata_filter(conjunct).ok_or_else(|| {
                    PlanError::UnsatisfiablePushdown(format!("DELETE filter {} on {}", conjunct, name))
                })
            })
            .collect::<std::result::Result<Vec<_>, PlanError>>()?;
        let ids: Vec<String> = kb
            .scan(&filters, None)
            .await?
            .into_iter()
            .map(|chunk| chunk.id)
            .collect();
        let rows = kb.delete(&ids).await?;
        info!("Deleted {} chunks from {}", rows, name);
        Ok(StatementOutcome::Deleted { rows })
    }

    async fn drop_object(&self, kind: ObjectKind, name: &ObjectName, if_exists: bool) -> Result<StatementOutcome> {
        let name = name.qualified();
        let existed = match kind {
            ObjectKind::Job => self.catalog.delete_job(&name).await?,
            _ => {
                let expected = match kind {
                    ObjectKind::KnowledgeBase => RelationKind::KnowledgeBase,
                    ObjectKind::Model => RelationKind::Model,
                    ObjectKind::Agent => RelationKind::Agent,
                    _ => RelationKind::View,
                };
                match self.registry.kind_of(&name) {
                    Some(found) if found != expected => {
                        return Err(PlanError::InvalidStatement(format!(
                            "{} is a {}, not a {}",
                            name,
                            found.as_str(),
                            kind
                        ))
                        .into())
                    }
                    Some(_) => {
                        if kind == ObjectKind::KnowledgeBase {
                            self.store.drop_collection(&name).await?;
                        }
                        self.registry.unregister(&name);
                        self.catalog.delete_object(&name).await?;
                        true
                    }
                    None => false,
                }
            }
        };
        if !existed && !if_exists {
            return Err(match kind {
                ObjectKind::Job => Error::JobNotFound(name),
                _ => Error::UnknownRelation(name),
            });
        }
        if existed {
            info!("Dropped {} '{}'", kind, name);
        }
        Ok(StatementOutcome::Dropped { kind, name, existed })
    }

    /// `MAX(expr)` over a select's rows, other conjuncts kept
    async fn max_of(&self, select: &Select, expr: &Expr, selection: Option<Expr>) -> Result<Value> {
        let probe = Select {
            projection: vec![SelectItem::aliased(
                Expr::func("max", vec![expr.clone()]),
                "max",
            )],
            from: select.from.clone(),
            selection,
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        };
        let mut rows = self.query(&Query::from(probe), None).await?;
        Ok(rows.next().and_then(|row| row.into_iter().next()).unwrap_or(Value::Null))
    }

    /// Bind every `LAST` of a select to `(watermark, upper]` and report the
    /// upper bounds reached
    async fn bind_select(&self, select: &mut Select, watermarks: &Watermarks, observed: &mut Watermarks) -> Result<()> {
        let Some(selection) = select.selection.take() else {
            return Ok(());
        };
        let conjuncts = selection.conjuncts();
        let mut bounds = Vec::with_capacity(conjuncts.len());
        for conjunct in &conjuncts {
            bounds.push(last_bound(conjunct)?);
        }
        let lower_only: Vec<Expr> = conjuncts
            .iter()
            .zip(&bounds)
            .filter_map(|(conjunct, bound)| match bound {
                None => Some(conjunct.clone()),
                Some((expr, op)) => watermark_of(watermarks, expr).map(|w| {
                    Expr::binary(expr.clone(), *op, Expr::Literal(w.clone()))
                }),
            })
            .collect();

        let mut bound_conjuncts = Vec::with_capacity(conjuncts.len());
        for (conjunct, bound) in conjuncts.into_iter().zip(bounds) {
            let Some((expr, op)) = bound else {
                bound_conjuncts.push(conjunct);
                continue;
            };
            let upper = self
                .max_of(select, &expr, Expr::conjoin(lower_only.clone()))
                .await?;
            if upper.is_null() {
                bound_conjuncts.push(Expr::lit(false));
                continue;
            }
            if let Some(w) = watermark_of(watermarks, &expr) {
                bound_conjuncts.push(Expr::binary(expr.clone(), op, Expr::Literal(w.clone())));
            }
            bound_conjuncts.push(Expr::binary(
                expr.clone(),
                BinaryOp::LtEq,
                Expr::Literal(upper.clone()),
            ));
            observed.insert(watermark_key(&expr), upper);
        }
        select.selection = Expr::conjoin(bound_conjuncts);
        Ok(())
    }

    async fn bind_query(&self, query: &mut Query, watermarks: &Watermarks, observed: &mut Watermarks) -> Result<()> {
        match query {
            Query::Select(select) => self.bind_select(select, watermarks, observed).await,
            Query::Union { left, right, .. } => {
                Box::pin(self.bind_query(left, watermarks, observed)).await?;
                Box::pin(self.bind_query(right, watermarks, observed)).await
            }
        }
    }
}

fn column_list(value: &JsonValue, key: &str) -> Result<Vec<String>> {
    match value {
        JsonValue::String(s) => Ok(vec![s.to_lowercase()]),
        JsonValue::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_lowercase)
                    .ok_or_else(|| Error::Config(format!("{} must list column names", key)))
            })
            .collect(),
        _ => Err(Error::Config(format!("{} must be a string or list", key))),
    }
}

/// Watermarks are keyed by the lower-cased expression text
fn watermark_key(expr: &Expr) -> String {
    expr.to_string().to_lowercase()
}

fn watermark_of<'w>(watermarks: &'w Watermarks, expr: &Expr) -> Option<&'w Value> {
    watermarks.get(&watermark_key(expr)).filter(|v| !v.is_null())
}

/// `expr > LAST` (or `LAST < expr`, and the inclusive forms) as `(expr, op)`
/// with `LAST` on the right; `None` for conjuncts without `LAST`
fn last_bound(conjunct: &Expr) -> Result<Option<(Expr, BinaryOp)>> {
    if !conjunct.contains_last() {
        return Ok(None);
    }
    if let Expr::Binary { left, op, right } = conjunct {
        match (left.as_ref(), right.as_ref()) {
            (expr, Expr::Last) if matches!(op, BinaryOp::Gt | BinaryOp::GtEq) && !expr.contains_last() => {
                return Ok(Some((expr.clone(), *op)));
            }
            (Expr::Last, expr) if matches!(op, BinaryOp::Lt | BinaryOp::LtEq) && !expr.contains_last() => {
                return Ok(Some((expr.clone(), op.flipped())));
            }
            _ => {}
        }
    }
    Err(PlanError::InvalidStatement(format!(
        "LAST is only supported as a top-level `column > LAST` condition, got {}",
        conjunct
    ))
    .into())
}

/// The query a statement reads from, for `LAST` binding
fn query_of(statement: &mut Statement) -> Option<&mut Query> {
    match statement {
        Statement::Query(query) | Statement::Insert { query, .. } => Some(query),
        _ => None,
    }
}

#[async_trait]
impl JobRunner for Engine {
    async fn current_watermarks(&self, job: &CreateJob) -> Result<Watermarks> {
        let mut seeded = Watermarks::new();
        for statement in &job.statements {
            let mut statement = statement.clone();
            let Some(query) = query_of(&mut statement) else {
                continue;
            };
            // No watermark yet: every LAST conjunct is unbounded below
            self.bind_query(query, &Watermarks::new(), &mut seeded).await?;
        }
        Ok(seeded)
    }

    async fn condition_holds(&self, query: &Query) -> Result<bool> {
        let mut rows = self.query(query, Some(1)).await?;
        Ok(rows.next().is_some())
    }

    async fn run(&self, job: &CreateJob, watermarks: &Watermarks) -> Result<JobOutcome> {
        let mut outcome = JobOutcome::default();
        for statement in &job.statements {
            let mut statement = statement.clone();
            if let Some(query) = query_of(&mut statement) {
                self.bind_query(query, watermarks, &mut outcome.watermarks).await?;
            } else if statement.contains_last() {
                return Err(PlanError::Unsupported("LAST outside a query".into()).into());
            }
            match self.execute(&statement, None).await? {
                StatementOutcome::Rows(stream) => {
                    outcome.rows_processed += match stream.write_summary() {
                        Some(summary) => summary.inserted + summary.unchanged,
                        None => stream.count(),
                    };
                }
                StatementOutcome::Deleted { rows } => outcome.rows_processed += rows,
                _ => {}
            }
        }
        debug!("Job {} observed watermarks {:?}", job.name, outcome.watermarks);
        Ok(outcome)
    }
}
