//! EXPLAIN rendering

use super::{InferInput, Plan, StepId, StepKind};
use crate::ast::JoinKind;
use crate::vector::{FilterOp, MetadataFilter};
use std::fmt::Write;

fn filter_op(op: FilterOp) -> &'static str {
    match op {
        FilterOp::Eq => "=",
        FilterOp::NotEq => "<>",
        FilterOp::Lt => "<",
        FilterOp::LtEq => "<=",
        FilterOp::Gt => ">",
        FilterOp::GtEq => ">=",
    }
}

fn metadata_filter(filter: &MetadataFilter) -> String {
    let not = |negated: bool| if negated { "NOT " } else { "" };
    match filter {
        MetadataFilter::Compare { field, op, value } => {
            format!("{} {} {}", field, filter_op(*op), value)
        }
        MetadataFilter::In {
            field,
            values,
            negated,
        } => {
            let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
            format!("{} {}IN ({})", field, not(*negated), values.join(", "))
        }
        MetadataFilter::Like {
            field,
            pattern,
            negated,
        } => format!("{} {}LIKE '{}'", field, not(*negated), pattern),
        MetadataFilter::IsNull { field, negated } => {
            format!("{} IS {}NULL", field, not(*negated))
        }
    }
}

fn join_list<T>(items: &[T], render: impl Fn(&T) -> String) -> String {
    items.iter().map(render).collect::<Vec<_>>().join(", ")
}

/// One-line description of a step, without its id
pub(super) fn describe(kind: &StepKind) -> String {
    let mut parts: Vec<String> = Vec::new();
    let head = match kind {
        StepKind::Fetch {
            relation,
            alias,
            request,
            early_stop,
            ..
        } => {
            if !request.filters.is_empty() {
                parts.push(format!("filters: {}", join_list(&request.filters, |e| e.to_string())));
            }
            if let Some(columns) = &request.columns {
                parts.push(format!("columns: {}", columns.join(", ")));
            }
            if !request.order_by.is_empty() {
                parts.push(format!(
                    "order: {}",
                    join_list(&request.order_by, |k| format!(
                        "{} {}",
                        k.column,
                        if k.asc { "ASC" } else { "DESC" }
                    ))
                ));
            }
            if let Some(limit) = request.limit {
                parts.push(format!("limit: {}", limit));
            }
            if *early_stop {
                parts.push("early_stop".into());
            }
            if alias.eq_ignore_ascii_case(relation) {
                format!("Fetch {}", relation)
            } else {
                format!("Fetch {} AS {}", relation, alias)
            }
        }
        StepKind::VectorSearch {
            kb,
            query,
            filters,
            k,
            early_stop,
            ..
        } => {
            if let Some(query) = query {
                parts.push(format!("query: '{}'", query));
            }
            if let Some(k) = k {
                parts.push(format!("{}: {}", if query.is_some() { "k" } else { "limit" }, k));
            }
            if !filters.is_empty() {
                parts.push(format!("filters: {}", join_list(filters, metadata_filter)));
            }
            if *early_stop {
                parts.push("early_stop".into());
            }
            if query.is_some() {
                format!("VectorSearch {}", kb.name())
            } else {
                format!("VectorScan {}", kb.name())
            }
        }
        StepKind::Infer { target, input, .. } => {
            match input {
                InferInput::Literal(row) => parts.push(format!(
                    "input: {}",
                    serde_json::Value::Object(row.clone())
                )),
                InferInput::Rows => parts.push("input: joined rows".into()),
            }
            format!("Infer {}", target.name)
        }
        StepKind::Join { kind, keys, filter } => {
            if !keys.is_empty() {
                parts.push(format!(
                    "keys: {}",
                    join_list(keys, |(l, r)| format!("{} = {}", l, r))
                ));
            }
            if let Some(filter) = filter {
                parts.push(format!("filter: {}", filter));
            }
            match kind {
                JoinKind::Inner => "Join INNER".to_string(),
                JoinKind::Left => "Join LEFT".to_string(),
            }
        }
        StepKind::Filter { predicate } => format!("Filter {}", predicate),
        StepKind::Project { items } => format!(
            "Project {}",
            join_list(items, |item| {
                let rendered = item.expr.to_string();
                if rendered == item.field.to_string() || rendered == item.field.name {
                    rendered
                } else {
                    format!("{} AS {}", rendered, item.field.name)
                }
            })
        ),
        StepKind::Aggregate {
            group_by,
            aggregates,
        } => {
            if !group_by.is_empty() {
                parts.push(format!("group: {}", join_list(group_by, |e| e.to_string())));
            }
            format!("Aggregate {}", join_list(aggregates, |a| a.to_string()))
        }
        StepKind::Sort { keys } => format!(
            "Sort {}",
            join_list(keys, |k| format!("{} {}", k.expr, if k.asc { "ASC" } else { "DESC" }))
        ),
        StepKind::Limit { n } => format!("Limit {}", n),
        StepKind::Merge { distinct } => {
            if *distinct {
                "Merge UNION".to_string()
            } else {
                "Merge UNION ALL".to_string()
            }
        }
        StepKind::Write { kb } => format!("Write {}", kb.name()),
    };
    if parts.is_empty() {
        head
    } else {
        format!("{} [{}]", head.trim_end(), parts.join("; "))
    }
}

impl Plan {
    /// Indented tree, output step first
    pub fn explain(&self) -> String {
        let mut out = String::new();
        self.render(self.output, 0, &mut out);
        out
    }

    fn render(&self, id: StepId, depth: usize, out: &mut String) {
        let Some(step) = self.step(id) else {
            return;
        };
        let _ = writeln!(out, "{}#{} {}", "  ".repeat(depth), step.id, describe(&step.kind));
        for input in &step.inputs {
            self.render(*input, depth + 1, out);
        }
    }
}
