//! Statement → plan
//!
//! Planning is two phases. Every relation the statement can reach (views
//! included) is resolved against the registry first; building the DAG after
//! that is synchronous.

use super::{
    AggregateCall, AggregateFunc, InferInput, Plan, PlanStep, ProjectItem, StepId, StepKind,
};
use crate::ast::{
    BinaryOp, ColumnRef, Expr, JoinKind, ObjectName, OrderByExpr, Query, Select, SelectItem,
    Statement, TableExpr,
};
use crate::config::Config;
use crate::error::{Error, PlanError, Result};
use crate::exec::expr::bind;
use crate::inference::{InferenceTarget, JsonRow};
use crate::registry::{Backend, Registry, Resolved};
use crate::source::{FetchRequest, SortKey};
use crate::value::{Field, Schema, Value};
use crate::vector::MetadataFilter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerOptions {
    /// Hand filters, projection, ordering and limits to backends that
    /// claim them. Off = every relational operator runs in memory.
    pub pushdown: bool,
    /// `k` for knowledge base searches without a usable LIMIT
    pub default_k: usize,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            pushdown: true,
            default_k: 10,
        }
    }
}

impl PlannerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pushdown: true,
            default_k: config.knowledge_base.default_k.max(1),
        }
    }
}

pub struct Planner {
    registry: Arc<Registry>,
    options: PlannerOptions,
}

/// Plan with default options
pub async fn plan(statement: &Statement, registry: &Arc<Registry>) -> Result<Plan> {
    Planner::new(registry.clone(), PlannerOptions::default())
        .plan(statement)
        .await
}

impl Planner {
    pub fn new(registry: Arc<Registry>, options: PlannerOptions) -> Self {
        Self { registry, options }
    }

    pub fn options(&self) -> &PlannerOptions {
        &self.options
    }

    pub async fn plan(&self, statement: &Statement) -> Result<Plan> {
        let resolved = self.resolve_all(statement).await?;
        let mut builder = Builder::new(&resolved, &self.options);
        let output = match statement {
            Statement::Query(query) => builder.query(query)?,
            Statement::Insert { target, query } => builder.insert(target, query)?,
            _ => {
                return Err(PlanError::InvalidStatement(
                    "only queries and INSERT ... SELECT are planned".into(),
                )
                .into())
            }
        };
        let plan = Plan::new(builder.steps, output)?;
        debug!("Planned {} steps", plan.len());
        Ok(plan)
    }

    /// Resolve every relation reachable from the statement, following views
    async fn resolve_all(&self, statement: &Statement) -> Result<HashMap<String, Resolved>> {
        let mut pending = Vec::new();
        match statement {
            Statement::Query(query) => relation_names(query, &mut pending),
            Statement::Insert { target, query } => {
                pending.push(target.qualified());
                relation_names(query, &mut pending);
            }
            _ => {}
        }
        let mut resolved = HashMap::new();
        while let Some(name) = pending.pop() {
            if resolved.contains_key(&name) {
                continue;
            }
            let relation = self.registry.resolve(&name).await?;
            if let Backend::View(query) = &relation.backend {
                relation_names(query, &mut pending);
            }
            resolved.insert(name, relation);
        }
        Ok(resolved)
    }
}

fn relation_names(query: &Query, out: &mut Vec<String>) {
    for select in query.selects() {
        if let Some(from) = &select.from {
            out.extend(from.relations().into_iter().map(|(name, _)| name.qualified()));
        }
    }
}

/// `alias` names the relation `qualifier` refers to
fn alias_matches(alias: &str, qualifier: &str) -> bool {
    alias.eq_ignore_ascii_case(qualifier)
        || alias
            .rsplit('.')
            .next()
            .is_some_and(|last| last.eq_ignore_ascii_case(qualifier))
}

fn unqualify(expr: &Expr) -> Expr {
    expr.clone().transform(&mut |e| match e {
        Expr::Column(c) => Expr::Column(ColumnRef::new(c.name)),
        other => other,
    })
}

/// `content = 'text'` in either operand order
fn content_search(expr: &Expr) -> Option<String> {
    let Expr::Binary {
        left,
        op: BinaryOp::Eq,
        right,
    } = expr
    else {
        return None;
    };
    match (left.as_ref(), right.as_ref()) {
        (Expr::Column(c), Expr::Literal(Value::Text(text)))
        | (Expr::Literal(Value::Text(text)), Expr::Column(c))
            if c.name.eq_ignore_ascii_case("content") =>
        {
            Some(text.clone())
        }
        _ => None,
    }
}

/// `input_col = literal` for one of the target's declared inputs
fn input_equality(expr: &Expr, target: &InferenceTarget) -> Option<(String, Value)> {
    let Expr::Binary {
        left,
        op: BinaryOp::Eq,
        right,
    } = expr
    else {
        return None;
    };
    let (column, value) = match (left.as_ref(), right.as_ref()) {
        (Expr::Column(c), Expr::Literal(v)) | (Expr::Literal(v), Expr::Column(c)) => (c, v),
        _ => return None,
    };
    target
        .input_columns
        .iter()
        .find(|i| i.eq_ignore_ascii_case(&column.name))
        .map(|i| (i.clone(), value.clone()))
}

/// Group expressions match by equality, columns also across qualification
fn same_expr(group: &Expr, expr: &Expr) -> bool {
    match (group, expr) {
        (Expr::Column(a), Expr::Column(b)) => {
            a.name.eq_ignore_ascii_case(&b.name)
                && match (&a.relation, &b.relation) {
                    (Some(x), Some(y)) => x.eq_ignore_ascii_case(y),
                    _ => true,
                }
        }
        _ => group == expr,
    }
}

fn group_column(i: usize) -> String {
    format!("__grp{}", i)
}

fn aggregate_column(i: usize) -> String {
    format!("__agg{}", i)
}

/// Replace group expressions and aggregate calls with references to the
/// aggregate step's output, top-down
fn rewrite_aggregates(
    expr: Expr,
    groups: &[Expr],
    calls: &mut Vec<AggregateCall>,
) -> Result<Expr> {
    if let Some(i) = groups.iter().position(|g| same_expr(g, &expr)) {
        return Ok(Expr::col(&group_column(i)));
    }
    if let Expr::Function {
        name,
        args,
        distinct,
    } = &expr
    {
        if let Some(func) = AggregateFunc::from_name(name) {
            let arg = match (func, args.as_slice()) {
                (AggregateFunc::Count, []) | (AggregateFunc::Count, [Expr::Wildcard]) => None,
                (_, [arg]) if !matches!(arg, Expr::Wildcard) => Some(arg.clone()),
                _ => {
                    return Err(PlanError::InvalidStatement(format!(
                        "{}() takes exactly one argument",
                        name
                    ))
                    .into())
                }
            };
            let call = AggregateCall {
                func,
                arg,
                distinct: *distinct,
            };
            let i = match calls.iter().position(|c| *c == call) {
                Some(i) => i,
                None => {
                    calls.push(call);
                    calls.len() - 1
                }
            };
            return Ok(Expr::col(&aggregate_column(i)));
        }
    }
    let mut failure = None;
    let rebuilt = expr.map_children(&mut |child| match rewrite_aggregates(child, groups, calls) {
        Ok(e) => e,
        Err(e) => {
            failure.get_or_insert(e);
            Expr::Wildcard
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(rebuilt),
    }
}

fn select_aggregates(select: &Select) -> bool {
    !select.group_by.is_empty()
        || select.projection.iter().any(|item| match item {
            SelectItem::Expr { expr, .. } => expr.contains_aggregate(),
            _ => false,
        })
        || select.order_by.iter().any(|o| o.expr.contains_aggregate())
}

/// Mark relations on the nullable side of a LEFT JOIN, in declaration order
fn nullable_flags(table: &TableExpr, nullable: bool, out: &mut Vec<bool>) {
    match table {
        TableExpr::Relation { .. } => out.push(nullable),
        TableExpr::Join {
            left, right, kind, ..
        } => {
            nullable_flags(left, nullable, out);
            nullable_flags(right, nullable || *kind == JoinKind::Left, out);
        }
    }
}

/// One relation of a FROM clause while its select is being planned
struct Slot<'r> {
    name: String,
    alias: String,
    resolved: &'r Resolved,
    /// Qualified by `alias`
    schema: Schema,
    nullable: bool,
    /// Joined model/agent: planned as part of the join tree
    joined_infer: bool,
    /// Source filters the adapter evaluates (unqualified)
    pushed: Vec<Expr>,
    /// Knowledge base filters the vector store evaluates
    metadata: Vec<MetadataFilter>,
    /// Single-relation conjuncts evaluated right above the slot's step
    local: Vec<Expr>,
    search: Option<String>,
    infer_inputs: JsonRow,
    step: Option<StepId>,
}

struct Builder<'a> {
    resolved: &'a HashMap<String, Resolved>,
    options: &'a PlannerOptions,
    steps: Vec<PlanStep>,
    /// Views currently being expanded
    expanding: Vec<String>,
}

impl<'a> Builder<'a> {
    fn new(resolved: &'a HashMap<String, Resolved>, options: &'a PlannerOptions) -> Self {
        Self {
            resolved,
            options,
            steps: Vec::new(),
            expanding: Vec::new(),
        }
    }

    fn add(&mut self, kind: StepKind, inputs: Vec<StepId>, schema: Schema) -> StepId {
        let id = self.steps.len();
        self.steps.push(PlanStep {
            id,
            kind,
            inputs,
            schema,
        });
        id
    }

    fn schema_of(&self, id: StepId) -> Schema {
        self.steps[id].schema.clone()
    }

    fn lookup(&self, name: &str) -> Result<&'a Resolved> {
        let resolved: &'a HashMap<String, Resolved> = self.resolved;
        resolved
            .get(name)
            .ok_or_else(|| Error::UnknownRelation(name.to_string()))
    }

    fn query(&mut self, query: &Query) -> Result<StepId> {
        match query {
            Query::Select(select) => self.select(select),
            Query::Union { left, right, all } => {
                let l = self.query(left)?;
                let r = self.query(right)?;
                let (ls, rs) = (self.schema_of(l), self.schema_of(r));
                if ls.len() != rs.len() {
                    return Err(PlanError::InvalidStatement(format!(
                        "UNION branches have {} and {} columns",
                        ls.len(),
                        rs.len()
                    ))
                    .into());
                }
                Ok(self.add(
                    StepKind::Merge { distinct: !all },
                    vec![l, r],
                    Schema::from_names(&ls.names()),
                ))
            }
        }
    }

    fn insert(&mut self, target: &ObjectName, query: &Query) -> Result<StepId> {
        let resolved = self.lookup(&target.qualified())?;
        let Backend::KnowledgeBase(kb) = &resolved.backend else {
            return Err(PlanError::Unsupported(format!(
                "INSERT into {} {}",
                resolved.descriptor.kind.as_str(),
                target
            ))
            .into());
        };
        let input = self.query(query)?;
        Ok(self.add(
            StepKind::Write { kb: kb.clone() },
            vec![input],
            Schema::from_names(&["inserted", "unchanged", "failed"]),
        ))
    }

    fn filter(&mut self, input: StepId, predicate: Expr) -> Result<StepId> {
        let schema = self.schema_of(input);
        bind(&predicate, &schema)?;
        Ok(self.add(StepKind::Filter { predicate }, vec![input], schema))
    }

    /// Output schema of a view, planned on a scratch builder
    fn view_schema(&self, name: &str, query: &Query) -> Result<Schema> {
        let mut scratch = Builder::new(self.resolved, self.options);
        scratch.expanding = self.expanding.clone();
        scratch.expanding.push(name.to_string());
        let id = scratch.query(query)?;
        Ok(Schema::from_names(&scratch.schema_of(id).names()))
    }

    fn slots(&self, from: &TableExpr) -> Result<Vec<Slot<'a>>> {
        let mut nullable = Vec::new();
        nullable_flags(from, false, &mut nullable);
        let relations = from.relations();
        let multi = relations.len() > 1;

        let mut slots: Vec<Slot<'a>> = Vec::with_capacity(relations.len());
        for ((name, alias), nullable) in relations.into_iter().zip(nullable) {
            let key = name.qualified();
            let resolved = self.lookup(&key)?;
            let alias = alias.map(str::to_string).unwrap_or_else(|| key.clone());
            if slots.iter().any(|s| s.alias.eq_ignore_ascii_case(&alias)) {
                return Err(PlanError::InvalidStatement(format!(
                    "relation '{}' appears twice; give it an alias",
                    alias
                ))
                .into());
            }
            let schema = match &resolved.backend {
                Backend::View(query) => {
                    if self.expanding.contains(&key) {
                        return Err(PlanError::InvalidStatement(format!(
                            "view '{}' references itself",
                            key
                        ))
                        .into());
                    }
                    self.view_schema(&key, query)?.qualify(&alias)
                }
                _ => resolved.descriptor.schema.qualify(&alias),
            };
            slots.push(Slot {
                name: key,
                alias,
                resolved,
                schema,
                nullable,
                joined_infer: multi && matches!(resolved.backend, Backend::Inference(_)),
                pushed: Vec::new(),
                metadata: Vec::new(),
                local: Vec::new(),
                search: None,
                infer_inputs: JsonRow::new(),
                step: None,
            });
        }
        Ok(slots)
    }

    /// Which slots a conjunct reads
    fn owners(slots: &[Slot], expr: &Expr) -> Result<Vec<usize>> {
        let mut owners: Vec<usize> = Vec::new();
        for column in expr.columns() {
            let hits: Vec<usize> = slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.schema.contains(column.relation.as_deref(), &column.name))
                .map(|(i, _)| i)
                .collect();
            match hits.as_slice() {
                [] => return Err(PlanError::UnknownColumn(column.to_string()).into()),
                [i] => {
                    if !owners.contains(i) {
                        owners.push(*i);
                    }
                }
                _ => return Err(PlanError::AmbiguousColumn(column.to_string()).into()),
            }
        }
        Ok(owners)
    }

    /// Route one WHERE conjunct to a slot, or leave it residual
    fn assign(&self, slots: &mut [Slot], conjunct: Expr, residual: &mut Vec<Expr>) -> Result<()> {
        let owners = Self::owners(slots, &conjunct)?;
        let [owner] = owners.as_slice() else {
            residual.push(conjunct);
            return Ok(());
        };
        let standalone = slots.len() == 1;
        let pushdown = self.options.pushdown;
        let slot = &mut slots[*owner];
        let resolved = slot.resolved;

        match &resolved.backend {
            Backend::KnowledgeBase(kb) => {
                if let Some(text) = content_search(&conjunct) {
                    if slot.nullable {
                        return Err(PlanError::UnsatisfiablePushdown(format!(
                            "semantic search on {} is on the nullable side of a LEFT JOIN",
                            slot.name
                        ))
                        .into());
                    }
                    if slot.search.is_some() {
                        return Err(PlanError::UnsatisfiablePushdown(format!(
                            "more than one content search on {}",
                            slot.name
                        ))
                        .into());
                    }
                    slot.search = Some(text);
                } else if slot.nullable {
                    residual.push(conjunct);
                } else if !pushdown {
                    slot.local.push(conjunct);
                } else {
                    match kb.metadata_filter(&unqualify(&conjunct)) {
                        Some(filter) => slot.metadata.push(filter),
                        None => slot.local.push(conjunct),
                    }
                }
            }
            Backend::Inference(target) if standalone => {
                match input_equality(&conjunct, target) {
                    Some((column, value)) => {
                        slot.infer_inputs.insert(column, value.to_json());
                    }
                    None => residual.push(conjunct),
                }
            }
            Backend::Inference(_) => residual.push(conjunct),
            Backend::Source { handle, .. } => {
                if !pushdown || slot.nullable {
                    residual.push(conjunct);
                } else {
                    let bare = unqualify(&conjunct);
                    if handle.capabilities().accepts_filter(&bare) {
                        slot.pushed.push(bare);
                    } else {
                        slot.local.push(conjunct);
                    }
                }
            }
            Backend::View(_) => {
                if !pushdown || slot.nullable {
                    residual.push(conjunct);
                } else {
                    slot.local.push(conjunct);
                }
            }
        }
        Ok(())
    }

    /// Columns of `slot` the select reads; `None` = all of them
    fn referenced_columns(select: &Select, slot: &Slot) -> Option<Vec<String>> {
        for item in &select.projection {
            match item {
                SelectItem::Wildcard => return None,
                SelectItem::QualifiedWildcard(q) if alias_matches(&slot.alias, q) => return None,
                _ => {}
            }
        }
        let mut wanted: Vec<String> = Vec::new();
        for expr in select.expressions() {
            for column in expr.columns() {
                if let Ok(i) = slot.schema.index_of(column.relation.as_deref(), &column.name) {
                    let name = &slot.schema.fields[i].name;
                    if !wanted.iter().any(|w| w == name) {
                        wanted.push(name.clone());
                    }
                }
            }
        }
        if wanted.is_empty() {
            return None;
        }
        // Keep table order
        Some(
            slot.schema
                .fields
                .iter()
                .map(|f| f.name.clone())
                .filter(|n| wanted.contains(n))
                .collect(),
        )
    }

    /// ORDER BY as adapter sort keys, when every key is a plain column of `slot`
    fn sort_keys(select: &Select, slot: &Slot) -> Option<Vec<SortKey>> {
        let mut keys = Vec::with_capacity(select.order_by.len());
        for order in &select.order_by {
            let Expr::Column(column) = &order.expr else {
                return None;
            };
            // An output alias of the same name would shadow the column
            let shadowed = column.relation.is_none()
                && select.projection.iter().any(|item| match item {
                    SelectItem::Expr {
                        alias: Some(alias),
                        expr,
                    } => alias.eq_ignore_ascii_case(&column.name) && expr != &order.expr,
                    _ => false,
                });
            if shadowed {
                return None;
            }
            let i = slot
                .schema
                .index_of(column.relation.as_deref(), &column.name)
                .ok()?;
            keys.push(SortKey {
                column: slot.schema.fields[i].name.clone(),
                asc: order.asc,
            });
        }
        Some(keys)
    }

    /// Create the leaf step of a slot, plus its local filter.
    /// `plain` = the slot is the whole select and nothing filters its rows
    /// afterwards, so ordering and limits may go to the backend.
    fn slot_step(
        &mut self,
        slot: &mut Slot,
        select: &Select,
        single: bool,
        plain: bool,
        aggregating: bool,
        sort_pushed: &mut bool,
    ) -> Result<()> {
        let pushdown = self.options.pushdown;
        let resolved = slot.resolved;
        let mut ranked_cap = None;
        let step = match &resolved.backend {
            Backend::Source { handle, table } => {
                let caps = handle.capabilities();
                let mut request = FetchRequest::table(table);
                request.filters = std::mem::take(&mut slot.pushed);
                if pushdown && caps.projection {
                    request.columns = Self::referenced_columns(select, slot);
                }
                if pushdown && plain {
                    if !select.order_by.is_empty() && caps.order_by {
                        if let Some(keys) = Self::sort_keys(select, slot) {
                            request.order_by = keys;
                            *sort_pushed = true;
                        }
                    }
                    if let Some(n) = select.limit {
                        if caps.limit && (select.order_by.is_empty() || *sort_pushed) {
                            request.limit = Some(n);
                        }
                    }
                }
                let schema = match &request.columns {
                    Some(columns) => Schema::from_names(columns).qualify(&slot.alias),
                    None => slot.schema.clone(),
                };
                self.add(
                    StepKind::Fetch {
                        handle: handle.clone(),
                        relation: slot.name.clone(),
                        alias: slot.alias.clone(),
                        request,
                        early_stop: false,
                    },
                    vec![],
                    schema,
                )
            }
            Backend::KnowledgeBase(kb) => {
                let cap = if single && !aggregating {
                    select.limit.unwrap_or(self.options.default_k)
                } else {
                    self.options.default_k
                };
                // Conditions checked after the search would drop chunks from a
                // top-k and hide lower-ranked ones that match, so rank
                // everything and cut after the filter instead
                let k = match &slot.search {
                    Some(_) if !slot.local.is_empty() => {
                        ranked_cap = Some(cap);
                        None
                    }
                    Some(_) => Some(cap),
                    None if pushdown && plain && select.order_by.is_empty() => select.limit,
                    None => None,
                };
                self.add(
                    StepKind::VectorSearch {
                        kb: kb.clone(),
                        alias: slot.alias.clone(),
                        query: slot.search.clone(),
                        filters: std::mem::take(&mut slot.metadata),
                        k,
                        early_stop: false,
                    },
                    vec![],
                    slot.schema.clone(),
                )
            }
            Backend::Inference(_) if slot.joined_infer => return Ok(()),
            Backend::Inference(target) => {
                if slot.infer_inputs.is_empty() {
                    return Err(PlanError::InvalidStatement(format!(
                        "{} needs input values, e.g. WHERE {} = ...",
                        target.name,
                        target
                            .input_columns
                            .first()
                            .map(String::as_str)
                            .unwrap_or("column")
                    ))
                    .into());
                }
                self.add(
                    StepKind::Infer {
                        target: target.clone(),
                        alias: slot.alias.clone(),
                        input: InferInput::Literal(std::mem::take(&mut slot.infer_inputs)),
                    },
                    vec![],
                    slot.schema.clone(),
                )
            }
            Backend::View(query) => {
                self.expanding.push(slot.name.clone());
                let inner = self.query(query);
                self.expanding.pop();
                let inner = inner?;
                let items = self
                    .schema_of(inner)
                    .fields
                    .into_iter()
                    .map(|f| ProjectItem {
                        expr: Expr::Column(ColumnRef {
                            relation: f.relation.clone(),
                            name: f.name.clone(),
                        }),
                        field: Field::qualified(slot.alias.clone(), f.name),
                    })
                    .collect();
                self.add(StepKind::Project { items }, vec![inner], slot.schema.clone())
            }
        };
        let step = match Expr::conjoin(std::mem::take(&mut slot.local)) {
            Some(predicate) => self.filter(step, predicate)?,
            None => step,
        };
        let step = match ranked_cap {
            Some(n) => {
                let schema = self.schema_of(step);
                self.add(StepKind::Limit { n }, vec![step], schema)
            }
            None => step,
        };
        slot.step = Some(step);
        Ok(())
    }

    /// Build joins in FROM order; returns the step producing the combined rows
    fn join_tree(&mut self, table: &TableExpr, slots: &[Slot], next: &mut usize) -> Result<StepId> {
        match table {
            TableExpr::Relation { .. } => {
                let slot = &slots[*next];
                *next += 1;
                slot.step.ok_or_else(|| {
                    PlanError::Unsupported(format!(
                        "{} must be joined to a preceding relation",
                        slot.name
                    ))
                    .into()
                })
            }
            TableExpr::Join {
                left,
                right,
                kind,
                on,
            } => {
                let l = self.join_tree(left, slots, next)?;
                let ls = self.schema_of(l);

                if matches!(right.as_ref(), TableExpr::Relation { .. }) && slots[*next].joined_infer {
                    let slot = &slots[*next];
                    *next += 1;
                    let Backend::Inference(target) = &slot.resolved.backend else {
                        return Err(PlanError::InvalidStatement(format!("{} is not a model", slot.name)).into());
                    };
                    for input in &target.input_columns {
                        if !ls.contains(None, input) {
                            return Err(PlanError::UnknownColumn(format!(
                                "{} (input of {})",
                                input, target.name
                            ))
                            .into());
                        }
                    }
                    let id = self.add(
                        StepKind::Infer {
                            target: target.clone(),
                            alias: slot.alias.clone(),
                            input: InferInput::Rows,
                        },
                        vec![l],
                        ls.join(&slot.schema),
                    );
                    return match on {
                        Some(on) => self.filter(id, on.clone()),
                        None => Ok(id),
                    };
                }

                let r = self.join_tree(right, slots, next)?;
                let rs = self.schema_of(r);
                let schema = ls.join(&rs);
                let mut keys = Vec::new();
                let mut rest = Vec::new();
                for conjunct in on.clone().map(Expr::conjuncts).unwrap_or_default() {
                    match equi_key(&conjunct, &ls, &rs) {
                        Some(pair) => keys.push(pair),
                        None => rest.push(conjunct),
                    }
                }
                let filter = Expr::conjoin(rest);
                if let Some(filter) = &filter {
                    bind(filter, &schema)?;
                }
                Ok(self.add(
                    StepKind::Join {
                        kind: *kind,
                        keys,
                        filter,
                    },
                    vec![l, r],
                    schema,
                ))
            }
        }
    }

    fn select(&mut self, select: &Select) -> Result<StepId> {
        let Some(from) = &select.from else {
            return self.constant_select(select);
        };
        let mut slots = self.slots(from)?;

        let mut residual = Vec::new();
        for conjunct in select.selection.clone().map(Expr::conjuncts).unwrap_or_default() {
            self.assign(&mut slots, conjunct, &mut residual)?;
        }

        let aggregating = select_aggregates(select);
        let single = slots.len() == 1;
        let plain = single && residual.is_empty() && slots[0].local.is_empty() && !aggregating;
        let mut sort_pushed = false;
        for slot in slots.iter_mut() {
            self.slot_step(slot, select, single, plain, aggregating, &mut sort_pushed)?;
        }

        let mut next = 0;
        let mut current = self.join_tree(from, &slots, &mut next)?;
        if let Some(predicate) = Expr::conjoin(residual) {
            current = self.filter(current, predicate)?;
        }
        self.finish_select(select, current, aggregating, sort_pushed)
    }

    /// `SELECT <constants>` without FROM: one row
    fn constant_select(&mut self, select: &Select) -> Result<StepId> {
        if select_aggregates(select) {
            return Err(PlanError::Unsupported("aggregates without FROM".into()).into());
        }
        let items = self.expand(&select.projection, &Schema::default())?;
        let schema = Schema::new(items.iter().map(|i| i.field.clone()).collect());
        let mut current = self.add(StepKind::Project { items }, vec![], schema);
        if let Some(predicate) = &select.selection {
            current = self.filter(current, predicate.clone())?;
        }
        if let Some(n) = select.limit {
            let schema = self.schema_of(current);
            current = self.add(StepKind::Limit { n }, vec![current], schema);
        }
        Ok(current)
    }

    /// Expand wildcards and name every output column
    fn expand(&self, projection: &[SelectItem], input: &Schema) -> Result<Vec<ProjectItem>> {
        let column_item = |f: &Field| ProjectItem {
            expr: Expr::Column(ColumnRef {
                relation: f.relation.clone(),
                name: f.name.clone(),
            }),
            field: f.clone(),
        };
        let mut items = Vec::new();
        for item in projection {
            match item {
                SelectItem::Wildcard => {
                    if input.is_empty() {
                        return Err(PlanError::InvalidStatement("'*' needs a FROM clause".into()).into());
                    }
                    items.extend(input.fields.iter().map(column_item));
                }
                SelectItem::QualifiedWildcard(q) => {
                    let matched: Vec<ProjectItem> = input
                        .fields
                        .iter()
                        .filter(|f| f.relation.as_deref().is_some_and(|r| alias_matches(r, q)))
                        .map(column_item)
                        .collect();
                    if matched.is_empty() {
                        return Err(PlanError::UnknownColumn(format!("{}.*", q)).into());
                    }
                    items.extend(matched);
                }
                SelectItem::Expr { expr, alias } => {
                    bind(expr, input)?;
                    let field = match (alias, expr) {
                        (Some(alias), _) => Field::new(alias.clone()),
                        (None, Expr::Column(c)) => {
                            input.fields[input.index_of(c.relation.as_deref(), &c.name)?].clone()
                        }
                        (None, other) => Field::new(other.output_name()),
                    };
                    items.push(ProjectItem {
                        expr: expr.clone(),
                        field,
                    });
                }
            }
        }
        Ok(items)
    }

    /// Aggregate, project, sort and limit on top of the joined, filtered rows
    fn finish_select(
        &mut self,
        select: &Select,
        input: StepId,
        aggregating: bool,
        sort_pushed: bool,
    ) -> Result<StepId> {
        let mut current = input;
        let mut projection = select.projection.clone();
        let mut order = select.order_by.clone();

        if aggregating {
            let in_schema = self.schema_of(current);
            let groups = select.group_by.clone();
            for group in &groups {
                bind(group, &in_schema)?;
            }
            let mut calls = Vec::new();
            projection = projection
                .into_iter()
                .map(|item| match item {
                    SelectItem::Expr { expr, alias } => {
                        let alias = alias.or_else(|| Some(expr.output_name()));
                        Ok(SelectItem::Expr {
                            expr: rewrite_aggregates(expr, &groups, &mut calls)?,
                            alias,
                        })
                    }
                    _ => Err(Error::from(PlanError::InvalidStatement(
                        "'*' cannot be combined with GROUP BY or aggregates".into(),
                    ))),
                })
                .collect::<Result<Vec<_>>>()?;
            order = order
                .into_iter()
                .map(|o| {
                    Ok(OrderByExpr {
                        expr: rewrite_aggregates(o.expr, &groups, &mut calls)?,
                        asc: o.asc,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            for call in &calls {
                if let Some(arg) = &call.arg {
                    bind(arg, &in_schema)?;
                }
            }
            let names: Vec<String> = (0..groups.len())
                .map(group_column)
                .chain((0..calls.len()).map(aggregate_column))
                .collect();
            current = self.add(
                StepKind::Aggregate {
                    group_by: groups,
                    aggregates: calls,
                },
                vec![current],
                Schema::from_names(&names),
            );
        }

        let in_schema = self.schema_of(current);
        let mut items = self.expand(&projection, &in_schema).map_err(|e| match e {
            Error::Plan(PlanError::UnknownColumn(c)) if aggregating => PlanError::InvalidStatement(format!(
                "column {} must appear in GROUP BY or inside an aggregate",
                c
            ))
            .into(),
            other => other,
        })?;
        let visible = items.len();

        let mut sort = Vec::new();
        if !sort_pushed {
            let output = Schema::new(items.iter().map(|i| i.field.clone()).collect());
            for (i, o) in order.iter().enumerate() {
                let by_output = matches!(&o.expr, Expr::Column(c)
                    if output.index_of(c.relation.as_deref(), &c.name).is_ok());
                let key = if by_output {
                    o.expr.clone()
                } else {
                    bind(&o.expr, &in_schema)?;
                    let hidden = format!("__sort{}", i);
                    items.push(ProjectItem {
                        expr: o.expr.clone(),
                        field: Field::new(hidden.clone()),
                    });
                    Expr::col(&hidden)
                };
                sort.push(OrderByExpr { expr: key, asc: o.asc });
            }
        }

        let schema = Schema::new(items.iter().map(|i| i.field.clone()).collect());
        let hidden = items.len() > visible;
        let visible_items: Vec<ProjectItem> = items[..visible]
            .iter()
            .map(|i| ProjectItem {
                expr: Expr::Column(ColumnRef {
                    relation: i.field.relation.clone(),
                    name: i.field.name.clone(),
                }),
                field: i.field.clone(),
            })
            .collect();
        current = self.add(StepKind::Project { items }, vec![current], schema.clone());
        if !sort.is_empty() {
            current = self.add(StepKind::Sort { keys: sort }, vec![current], schema.clone());
        }
        if let Some(n) = select.limit {
            current = self.add(StepKind::Limit { n }, vec![current], schema);
        }
        if hidden {
            let schema = Schema::new(visible_items.iter().map(|i| i.field.clone()).collect());
            current = self.add(StepKind::Project { items: visible_items }, vec![current], schema);
        }
        Ok(current)
    }
}

/// `l = r` with each side reading only one input
fn equi_key(conjunct: &Expr, left: &Schema, right: &Schema) -> Option<(Expr, Expr)> {
    let Expr::Binary {
        left: a,
        op: BinaryOp::Eq,
        right: b,
    } = conjunct
    else {
        return None;
    };
    let only = |e: &Expr, own: &Schema, other: &Schema| {
        !e.columns().is_empty() && bind(e, own).is_ok() && bind(e, other).is_err()
    };
    if only(a, left, right) && only(b, right, left) {
        Some((a.as_ref().clone(), b.as_ref().clone()))
    } else if only(b, left, right) && only(a, right, left) {
        Some((b.as_ref().clone(), a.as_ref().clone()))
    } else {
        None
    }
}
