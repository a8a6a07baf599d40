//! Execution plans
//!
//! A [`Plan`] is a DAG of [`PlanStep`]s. Leaf steps talk to a backing
//! component (source adapter, knowledge base, inference endpoint); the rest
//! are in-memory relational operators. Steps are stored in the order the
//! executor launches them: a topological order that always picks the lowest
//! eligible id.

mod explain;
mod planner;

pub use planner::{plan, Planner, PlannerOptions};

use crate::ast::{Expr, JoinKind, OrderByExpr};
use crate::error::PlanError;
use crate::inference::{InferenceTarget, JsonRow};
use crate::kb::KnowledgeBase;
use crate::source::{FetchRequest, SourceHandle};
use crate::value::{Field, Schema};
use crate::vector::MetadataFilter;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

pub type StepId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "count" => Some(AggregateFunc::Count),
            "sum" => Some(AggregateFunc::Sum),
            "avg" => Some(AggregateFunc::Avg),
            "min" => Some(AggregateFunc::Min),
            "max" => Some(AggregateFunc::Max),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunc::Count => "count",
            AggregateFunc::Sum => "sum",
            AggregateFunc::Avg => "avg",
            AggregateFunc::Min => "min",
            AggregateFunc::Max => "max",
        }
    }
}

/// One aggregate in an `aggregate` step. `arg` is `None` for `COUNT(*)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateCall {
    pub func: AggregateFunc,
    pub arg: Option<Expr>,
    pub distinct: bool,
}

impl fmt::Display for AggregateCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let distinct = if self.distinct { "DISTINCT " } else { "" };
        match &self.arg {
            Some(arg) => write!(f, "{}({}{})", self.func.name(), distinct, arg),
            None => write!(f, "{}(*)", self.func.name()),
        }
    }
}

/// Output column of a `project` step
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectItem {
    pub expr: Expr,
    pub field: Field,
}

/// Where an `infer` step gets its input rows
#[derive(Debug, Clone, PartialEq)]
pub enum InferInput {
    /// One row assembled from `column = literal` conjuncts
    Literal(JsonRow),
    /// Every row of the step's single input
    Rows,
}

#[derive(Clone)]
pub enum StepKind {
    Fetch {
        handle: Arc<SourceHandle>,
        relation: String,
        alias: String,
        request: FetchRequest,
        /// May stop after `row_limit` rows without changing the result
        early_stop: bool,
    },
    /// Semantic search when `query` is set, otherwise a filtered scan
    VectorSearch {
        kb: Arc<KnowledgeBase>,
        alias: String,
        query: Option<String>,
        filters: Vec<MetadataFilter>,
        k: Option<usize>,
        early_stop: bool,
    },
    Infer {
        target: Arc<InferenceTarget>,
        alias: String,
        input: InferInput,
    },
    Join {
        kind: JoinKind,
        /// Equi-join pairs: left expression, right expression
        keys: Vec<(Expr, Expr)>,
        /// Rest of the ON clause, evaluated on the combined row
        filter: Option<Expr>,
    },
    Filter {
        predicate: Expr,
    },
    /// With no input, projects a single empty row (`SELECT 'x' AS content`)
    Project {
        items: Vec<ProjectItem>,
    },
    /// Output: `__grp{i}` per group expression, then `__agg{i}` per call
    Aggregate {
        group_by: Vec<Expr>,
        aggregates: Vec<AggregateCall>,
    },
    Sort {
        keys: Vec<OrderByExpr>,
    },
    Limit {
        n: usize,
    },
    Merge {
        distinct: bool,
    },
    Write {
        kb: Arc<KnowledgeBase>,
    },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Fetch { .. } => "fetch",
            StepKind::VectorSearch { .. } => "vector_search",
            StepKind::Infer { .. } => "infer",
            StepKind::Join { .. } => "join",
            StepKind::Filter { .. } => "filter",
            StepKind::Project { .. } => "project",
            StepKind::Aggregate { .. } => "aggregate",
            StepKind::Sort { .. } => "sort",
            StepKind::Limit { .. } => "limit",
            StepKind::Merge { .. } => "merge",
            StepKind::Write { .. } => "write",
        }
    }

    /// Steps that neither reorder nor drop rows beyond a prefix
    fn keeps_prefix(&self) -> bool {
        matches!(self, StepKind::Project { .. } | StepKind::Limit { .. })
    }

    pub fn is_early_stop(&self) -> bool {
        match self {
            StepKind::Fetch { early_stop, .. } | StepKind::VectorSearch { early_stop, .. } => {
                *early_stop
            }
            _ => false,
        }
    }
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&explain::describe(self))
    }
}

#[derive(Debug, Clone)]
pub struct PlanStep {
    pub id: StepId,
    pub kind: StepKind,
    pub inputs: Vec<StepId>,
    pub schema: Schema,
}

pub struct Plan {
    steps: Vec<PlanStep>,
    position: HashMap<StepId, usize>,
    output: StepId,
}

impl Plan {
    /// Order `steps` topologically (lowest eligible id first) and mark the
    /// source steps that may stop early
    pub fn new(steps: Vec<PlanStep>, output: StepId) -> std::result::Result<Self, PlanError> {
        let ids: BTreeSet<StepId> = steps.iter().map(|s| s.id).collect();
        if ids.len() != steps.len() {
            return Err(PlanError::InvalidStatement("duplicate step id".into()));
        }
        if !ids.contains(&output) {
            return Err(PlanError::InvalidStatement(format!("no output step {}", output)));
        }
        let mut waiting: HashMap<StepId, usize> = HashMap::new();
        let mut consumers: HashMap<StepId, Vec<StepId>> = HashMap::new();
        for step in &steps {
            for input in &step.inputs {
                if !ids.contains(input) {
                    return Err(PlanError::InvalidStatement(format!(
                        "step {} reads missing step {}",
                        step.id, input
                    )));
                }
                consumers.entry(*input).or_default().push(step.id);
            }
            waiting.insert(step.id, step.inputs.len());
        }

        let mut ready: BTreeSet<StepId> = waiting
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(steps.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for consumer in consumers.get(&id).into_iter().flatten() {
                if let Some(n) = waiting.get_mut(consumer) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(*consumer);
                    }
                }
            }
        }
        if order.len() != steps.len() {
            let stuck = waiting
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(id, _)| *id)
                .min()
                .unwrap_or(output);
            return Err(PlanError::Cyclic(stuck));
        }

        let mut by_id: HashMap<StepId, PlanStep> = steps.into_iter().map(|s| (s.id, s)).collect();
        let steps: Vec<PlanStep> = order.iter().filter_map(|id| by_id.remove(id)).collect();
        let position = steps.iter().enumerate().map(|(i, s)| (s.id, i)).collect();
        let mut plan = Self {
            steps,
            position,
            output,
        };
        plan.mark_early_stop(&consumers);
        Ok(plan)
    }

    /// A source step may stop early when the only path from it to the
    /// output is a chain of prefix-preserving steps
    fn mark_early_stop(&mut self, consumers: &HashMap<StepId, Vec<StepId>>) {
        let safe: Vec<StepId> = self
            .steps
            .iter()
            .filter(|s| matches!(s.kind, StepKind::Fetch { .. } | StepKind::VectorSearch { .. }))
            .map(|s| s.id)
            .filter(|id| {
                let mut current = *id;
                loop {
                    if current == self.output {
                        return true;
                    }
                    match consumers.get(&current).map(Vec::as_slice) {
                        Some([next]) if self.step(*next).is_some_and(|s| s.kind.keeps_prefix()) => {
                            current = *next;
                        }
                        _ => return false,
                    }
                }
            })
            .collect();
        for id in safe {
            if let Some(i) = self.position.get(&id).copied() {
                match &mut self.steps[i].kind {
                    StepKind::Fetch { early_stop, .. } | StepKind::VectorSearch { early_stop, .. } => {
                        *early_stop = true
                    }
                    _ => {}
                }
            }
        }
    }

    /// Steps in launch order
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn step(&self, id: StepId) -> Option<&PlanStep> {
        self.position.get(&id).map(|i| &self.steps[*i])
    }

    pub fn output_id(&self) -> StepId {
        self.output
    }

    pub fn output_schema(&self) -> &Schema {
        self.step(self.output)
            .map(|s| &s.schema)
            .unwrap_or(&EMPTY_SCHEMA)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

static EMPTY_SCHEMA: Schema = Schema { fields: Vec::new() };

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.explain())
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.explain())
    }
}
