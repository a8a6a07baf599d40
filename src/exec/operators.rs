//! In-memory relational operators
//!
//! All of these take materialized input batches and follow SQL NULL rules:
//! predicates keep a row only when TRUE, NULL join keys never match, and
//! aggregates skip NULL inputs.

use super::expr::{bind, BoundExpr};
use crate::ast::{Expr, JoinKind, OrderByExpr};
use crate::error::{Error, Result};
use crate::inference::{InferenceGateway, InferenceTarget, JsonRow};
use crate::kb::WriteSummary;
use crate::plan::{AggregateCall, AggregateFunc, ProjectItem};
use crate::value::{Batch, KeyPart, Row, Schema, Value};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

fn bind_all<'e>(exprs: impl IntoIterator<Item = &'e Expr>, schema: &Schema) -> Result<Vec<BoundExpr>> {
    exprs
        .into_iter()
        .map(|e| bind(e, schema).map_err(Error::from))
        .collect()
}

pub fn filter(input: &Batch, predicate: &Expr) -> Result<Batch> {
    let predicate = bind(predicate, &input.schema)?;
    let mut rows = Vec::new();
    for row in &input.rows {
        if predicate.matches(row)? {
            rows.push(row.clone());
        }
    }
    Ok(Batch::new(input.schema.clone(), rows))
}

/// Without an input, evaluates `items` once against an empty row
pub fn project(input: Option<&Batch>, items: &[ProjectItem]) -> Result<Batch> {
    let unit = Batch::new(Schema::default(), vec![Vec::new()]);
    let input = input.unwrap_or(&unit);
    let bound = bind_all(items.iter().map(|i| &i.expr), &input.schema)?;
    let rows = input
        .rows
        .iter()
        .map(|row| bound.iter().map(|e| e.eval(row)).collect::<Result<Row>>())
        .collect::<Result<Vec<_>>>()?;
    Ok(Batch::new(
        Schema::new(items.iter().map(|i| i.field.clone()).collect()),
        rows,
    ))
}

/// Key of a row, or `None` when any part is NULL
fn join_key(exprs: &[BoundExpr], row: &Row) -> Result<Option<Vec<KeyPart>>> {
    let mut key = Vec::with_capacity(exprs.len());
    for expr in exprs {
        let value = expr.eval(row)?;
        if value.is_null() {
            return Ok(None);
        }
        key.push(value.key());
    }
    Ok(Some(key))
}

fn concat(left: &Row, right: &Row) -> Row {
    let mut row = Vec::with_capacity(left.len() + right.len());
    row.extend(left.iter().cloned());
    row.extend(right.iter().cloned());
    row
}

/// Hash join on the equi-keys, nested loop when there are none. Output
/// follows left row order, matches in right row order.
pub fn hash_join(
    left: &Batch,
    right: &Batch,
    kind: JoinKind,
    keys: &[(Expr, Expr)],
    filter: Option<&Expr>,
) -> Result<Batch> {
    let schema = left.schema.join(&right.schema);
    let left_keys = bind_all(keys.iter().map(|(l, _)| l), &left.schema)?;
    let right_keys = bind_all(keys.iter().map(|(_, r)| r), &right.schema)?;
    let filter = filter.map(|f| bind(f, &schema)).transpose()?;
    let nulls: Row = vec![Value::Null; right.schema.len()];

    let mut table: HashMap<Vec<KeyPart>, Vec<usize>> = HashMap::new();
    if !keys.is_empty() {
        for (i, row) in right.rows.iter().enumerate() {
            if let Some(key) = join_key(&right_keys, row)? {
                table.entry(key).or_default().push(i);
            }
        }
    }
    let every_row: Vec<usize> = (0..right.rows.len()).collect();

    let mut rows = Vec::new();
    for l in &left.rows {
        let candidates: &[usize] = if keys.is_empty() {
            &every_row
        } else {
            match join_key(&left_keys, l)? {
                Some(key) => table.get(&key).map(Vec::as_slice).unwrap_or(&[]),
                None => &[],
            }
        };
        let mut matched = false;
        for i in candidates {
            let row = concat(l, &right.rows[*i]);
            let keep = match &filter {
                Some(f) => f.matches(&row)?,
                None => true,
            };
            if keep {
                rows.push(row);
                matched = true;
            }
        }
        if !matched && kind == JoinKind::Left {
            rows.push(concat(l, &nulls));
        }
    }
    Ok(Batch::new(schema, rows))
}

/// Stable sort; NULLs last in either direction
pub fn sort(input: &Batch, keys: &[OrderByExpr]) -> Result<Batch> {
    let bound = bind_all(keys.iter().map(|k| &k.expr), &input.schema)?;
    let mut keyed = input
        .rows
        .iter()
        .map(|row| {
            let values = bound.iter().map(|e| e.eval(row)).collect::<Result<Vec<_>>>()?;
            Ok((values, row))
        })
        .collect::<Result<Vec<_>>>()?;
    keyed.sort_by(|(a, _), (b, _)| {
        a.iter()
            .zip(b.iter())
            .zip(keys.iter())
            .map(|((x, y), key)| x.order_cmp(y, key.asc))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    });
    Ok(Batch::new(
        input.schema.clone(),
        keyed.into_iter().map(|(_, row)| row.clone()).collect(),
    ))
}

pub fn limit(input: &Batch, n: usize) -> Batch {
    Batch::new(input.schema.clone(), input.rows.iter().take(n).cloned().collect())
}

/// UNION ALL concatenation, or UNION with duplicates removed (first wins)
pub fn merge(inputs: &[std::sync::Arc<Batch>], distinct: bool, schema: Schema) -> Batch {
    let mut seen: HashSet<Vec<KeyPart>> = HashSet::new();
    let mut rows = Vec::new();
    for batch in inputs {
        for row in &batch.rows {
            if distinct && !seen.insert(row.iter().map(Value::key).collect()) {
                continue;
            }
            rows.push(row.clone());
        }
    }
    Batch::new(schema, rows)
}

/// Running state of one aggregate call
struct Accumulator {
    func: AggregateFunc,
    distinct: bool,
    seen: HashSet<KeyPart>,
    count: i64,
    numeric: i64,
    int_sum: Option<i64>,
    float_sum: f64,
    best: Option<Value>,
}

impl Accumulator {
    fn new(call: &AggregateCall) -> Self {
        Self {
            func: call.func,
            distinct: call.distinct,
            seen: HashSet::new(),
            count: 0,
            numeric: 0,
            int_sum: Some(0),
            float_sum: 0.0,
            best: None,
        }
    }

    /// `None` = a row for `COUNT(*)`
    fn update(&mut self, value: Option<Value>) {
        let Some(value) = value else {
            self.count += 1;
            return;
        };
        if value.is_null() {
            return;
        }
        if self.distinct && !self.seen.insert(value.key()) {
            return;
        }
        self.count += 1;
        match self.func {
            AggregateFunc::Count => {}
            AggregateFunc::Sum | AggregateFunc::Avg => {
                let Some(f) = value.as_f64() else {
                    return;
                };
                self.numeric += 1;
                self.float_sum += f;
                self.int_sum = match value {
                    Value::Int(i) => self.int_sum.and_then(|s| s.checked_add(i)),
                    _ => None,
                };
            }
            AggregateFunc::Min | AggregateFunc::Max => {
                let replace = match &self.best {
                    None => true,
                    Some(best) => {
                        let ord = value.sort_cmp(best);
                        if self.func == AggregateFunc::Min {
                            ord == Ordering::Less
                        } else {
                            ord == Ordering::Greater
                        }
                    }
                };
                if replace {
                    self.best = Some(value);
                }
            }
        }
    }

    fn finish(&self) -> Value {
        match self.func {
            AggregateFunc::Count => Value::Int(self.count),
            AggregateFunc::Sum if self.numeric == 0 => Value::Null,
            AggregateFunc::Sum => match self.int_sum {
                Some(sum) => Value::Int(sum),
                None => Value::Float(self.float_sum),
            },
            AggregateFunc::Avg if self.numeric == 0 => Value::Null,
            AggregateFunc::Avg => Value::Float(self.float_sum / self.numeric as f64),
            AggregateFunc::Min | AggregateFunc::Max => self.best.clone().unwrap_or(Value::Null),
        }
    }
}

/// GROUP BY; without group expressions there is always exactly one row.
/// Groups come out in the order their first row arrived, NULL group included.
pub fn aggregate(
    input: &Batch,
    group_by: &[Expr],
    calls: &[AggregateCall],
    schema: Schema,
) -> Result<Batch> {
    let groups = bind_all(group_by, &input.schema)?;
    let args = calls
        .iter()
        .map(|c| c.arg.as_ref().map(|a| bind(a, &input.schema)).transpose())
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut order: Vec<Vec<KeyPart>> = Vec::new();
    let mut states: HashMap<Vec<KeyPart>, (Row, Vec<Accumulator>)> = HashMap::new();
    for row in &input.rows {
        let values = groups.iter().map(|g| g.eval(row)).collect::<Result<Row>>()?;
        let key: Vec<KeyPart> = values.iter().map(Value::key).collect();
        let (_, accumulators) = states.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            (values, calls.iter().map(Accumulator::new).collect())
        });
        for (acc, arg) in accumulators.iter_mut().zip(&args) {
            let value = arg.as_ref().map(|a| a.eval(row)).transpose()?;
            acc.update(value);
        }
    }

    if group_by.is_empty() && states.is_empty() {
        let row = calls.iter().map(|c| Accumulator::new(c).finish()).collect();
        return Ok(Batch::new(schema, vec![row]));
    }

    let rows = order
        .iter()
        .filter_map(|key| states.get(key))
        .map(|(values, accumulators)| {
            let mut row = values.clone();
            row.extend(accumulators.iter().map(Accumulator::finish));
            row
        })
        .collect();
    Ok(Batch::new(schema, rows))
}

fn lookup(row: &JsonRow, name: &str) -> Value {
    row.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| Value::from_json(v.clone()))
        .unwrap_or(Value::Null)
}

/// Output columns come from the prediction, everything else from the request
fn target_value(target: &InferenceTarget, name: &str, request: &JsonRow, prediction: &JsonRow) -> Value {
    if target.output_columns.iter().any(|c| c.eq_ignore_ascii_case(name)) {
        lookup(prediction, name)
    } else {
        lookup(request, name)
    }
}

/// Standalone model/agent query: one request row
pub async fn infer_literal(
    gateway: &InferenceGateway,
    target: &InferenceTarget,
    request: JsonRow,
    schema: &Schema,
) -> Result<Batch> {
    let prediction = gateway
        .invoke(target, vec![request.clone()])
        .await?
        .into_iter()
        .next()
        .unwrap_or_default();
    let row = schema
        .fields
        .iter()
        .map(|f| target_value(target, &f.name, &request, &prediction))
        .collect();
    Ok(Batch::new(schema.clone(), vec![row]))
}

/// Joined model/agent: every left row is a request; predictions are
/// appended by row position
pub async fn infer_rows(
    gateway: &InferenceGateway,
    target: &InferenceTarget,
    left: &Batch,
    schema: &Schema,
) -> Result<Batch> {
    if left.is_empty() {
        return Ok(Batch::empty(schema.clone()));
    }
    let columns: Vec<(String, usize)> = if target.input_columns.is_empty() {
        left.schema
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect()
    } else {
        target
            .input_columns
            .iter()
            .map(|n| Ok((n.clone(), left.schema.index_of(None, n)?)))
            .collect::<Result<Vec<_>>>()?
    };
    let requests: Vec<JsonRow> = left
        .rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|(n, i)| (n.clone(), row[*i].to_json()))
                .collect()
        })
        .collect();
    let predictions = gateway.invoke(target, requests.clone()).await?;

    let own = schema.fields.get(left.schema.len()..).unwrap_or(&[]);
    let rows = left
        .rows
        .iter()
        .zip(requests.iter().zip(&predictions))
        .map(|(row, (request, prediction))| {
            let mut out = row.clone();
            out.extend(own.iter().map(|f| target_value(target, &f.name, request, prediction)));
            out
        })
        .collect();
    Ok(Batch::new(schema.clone(), rows))
}

/// `inserted, unchanged, failed`
pub fn write_summary_batch(summary: &WriteSummary) -> Batch {
    Batch::new(
        Schema::from_names(&["inserted", "unchanged", "failed"]),
        vec![vec![
            Value::from(summary.inserted),
            Value::from(summary.unchanged),
            Value::from(summary.failures.len()),
        ]],
    )
}

/// JSON view of a batch for CLI output
pub fn batch_to_json(batch: &Batch) -> JsonValue {
    JsonValue::Array(
        batch
            .to_json_rows()
            .into_iter()
            .map(JsonValue::Object)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Field;

    fn batch(relation: &str, names: &[&str], rows: Vec<Row>) -> Batch {
        Batch::new(
            Schema::new(names.iter().map(|n| Field::qualified(relation, *n)).collect()),
            rows,
        )
    }

    #[test]
    fn test_null_keys_never_join() {
        let left = batch(
            "l",
            &["k", "v"],
            vec![
                vec![Value::Int(1), Value::from("a")],
                vec![Value::Null, Value::from("b")],
            ],
        );
        let right = batch(
            "r",
            &["k", "w"],
            vec![
                vec![Value::Int(1), Value::from("x")],
                vec![Value::Null, Value::from("y")],
                vec![Value::Float(1.0), Value::from("z")],
            ],
        );
        let keys = vec![(Expr::col("l.k"), Expr::col("r.k"))];

        let inner = hash_join(&left, &right, JoinKind::Inner, &keys, None).unwrap();
        assert_eq!(inner.len(), 2);
        assert_eq!(inner.rows[0][3], Value::from("x"));
        assert_eq!(inner.rows[1][3], Value::from("z"));

        let outer = hash_join(&left, &right, JoinKind::Left, &keys, None).unwrap();
        assert_eq!(outer.len(), 3);
        assert_eq!(outer.rows[2], vec![Value::Null, Value::from("b"), Value::Null, Value::Null]);
    }

    #[test]
    fn test_join_matches_what_the_where_clause_matches() {
        let left = batch("c", &["id"], (1..=3).map(|i| vec![Value::Int(i)]).collect());
        let right = batch(
            "k",
            &["id"],
            vec![vec![Value::from("1")], vec![Value::from("3")], vec![Value::from("9")]],
        );
        let keys = vec![(Expr::col("c.id"), Expr::col("k.id"))];
        let joined = hash_join(&left, &right, JoinKind::Inner, &keys, None).unwrap();

        let cross = hash_join(&left, &right, JoinKind::Inner, &[], None).unwrap();
        let condition = Expr::binary(Expr::col("c.id"), crate::ast::BinaryOp::Eq, Expr::col("k.id"));
        let filtered = filter(&cross, &condition).unwrap();

        assert_eq!(joined.len(), 2);
        assert_eq!(joined.rows, filtered.rows);
    }

    #[test]
    fn test_left_join_filter_decides_matches() {
        let left = batch("l", &["k"], vec![vec![Value::Int(1)]]);
        let right = batch("r", &["k", "n"], vec![vec![Value::Int(1), Value::Int(5)]]);
        let keys = vec![(Expr::col("l.k"), Expr::col("r.k"))];
        let filter = Expr::binary(Expr::col("r.n"), crate::ast::BinaryOp::Gt, Expr::lit(10));
        let out = hash_join(&left, &right, JoinKind::Left, &keys, Some(&filter)).unwrap();
        assert_eq!(out.rows, vec![vec![Value::Int(1), Value::Null, Value::Null]]);
    }

    #[test]
    fn test_aggregate_null_rules() {
        let input = batch(
            "t",
            &["g", "x"],
            vec![
                vec![Value::from("a"), Value::Int(2)],
                vec![Value::from("a"), Value::Null],
                vec![Value::from("b"), Value::Null],
                vec![Value::from("a"), Value::Int(4)],
            ],
        );
        let calls = vec![
            AggregateCall {
                func: AggregateFunc::Count,
                arg: None,
                distinct: false,
            },
            AggregateCall {
                func: AggregateFunc::Count,
                arg: Some(Expr::col("x")),
                distinct: false,
            },
            AggregateCall {
                func: AggregateFunc::Sum,
                arg: Some(Expr::col("x")),
                distinct: false,
            },
            AggregateCall {
                func: AggregateFunc::Avg,
                arg: Some(Expr::col("x")),
                distinct: false,
            },
        ];
        let out = aggregate(
            &input,
            &[Expr::col("g")],
            &calls,
            Schema::from_names(&["__grp0", "__agg0", "__agg1", "__agg2", "__agg3"]),
        )
        .unwrap();
        assert_eq!(
            out.rows,
            vec![
                vec![Value::from("a"), Value::Int(3), Value::Int(2), Value::Int(6), Value::Float(3.0)],
                vec![Value::from("b"), Value::Int(1), Value::Int(0), Value::Null, Value::Null],
            ]
        );
    }

    #[test]
    fn test_groups_keep_first_appearance_order() {
        let input = batch(
            "t",
            &["g"],
            vec![
                vec![Value::from("b")],
                vec![Value::Null],
                vec![Value::from("a")],
                vec![Value::Null],
                vec![Value::from("b")],
            ],
        );
        let calls = vec![AggregateCall {
            func: AggregateFunc::Count,
            arg: None,
            distinct: false,
        }];
        let out = aggregate(&input, &[Expr::col("g")], &calls, Schema::from_names(&["__grp0", "__agg0"]))
            .unwrap();
        assert_eq!(
            out.rows,
            vec![
                vec![Value::from("b"), Value::Int(2)],
                vec![Value::Null, Value::Int(2)],
                vec![Value::from("a"), Value::Int(1)],
            ]
        );
    }

    #[test]
    fn test_global_aggregate_on_empty_input() {
        let input = batch("t", &["x"], vec![]);
        let calls = vec![
            AggregateCall {
                func: AggregateFunc::Count,
                arg: None,
                distinct: false,
            },
            AggregateCall {
                func: AggregateFunc::Max,
                arg: Some(Expr::col("x")),
                distinct: false,
            },
        ];
        let out = aggregate(&input, &[], &calls, Schema::from_names(&["__agg0", "__agg1"])).unwrap();
        assert_eq!(out.rows, vec![vec![Value::Int(0), Value::Null]]);
    }

    #[test]
    fn test_sort_is_stable_with_nulls_last() {
        let input = batch(
            "t",
            &["k", "tag"],
            vec![
                vec![Value::Null, Value::from("n")],
                vec![Value::Int(2), Value::from("first")],
                vec![Value::Int(1), Value::from("one")],
                vec![Value::Int(2), Value::from("second")],
            ],
        );
        let keys = vec![OrderByExpr {
            expr: Expr::col("k"),
            asc: false,
        }];
        let out = sort(&input, &keys).unwrap();
        let tags: Vec<Value> = out.rows.iter().map(|r| r[1].clone()).collect();
        assert_eq!(
            tags,
            vec![
                Value::from("first"),
                Value::from("second"),
                Value::from("one"),
                Value::from("n")
            ]
        );
    }

    #[test]
    fn test_union_distinct_keeps_first() {
        let a = std::sync::Arc::new(batch("a", &["x"], vec![vec![Value::Int(1)], vec![Value::Int(2)]]));
        let b = std::sync::Arc::new(batch("b", &["x"], vec![vec![Value::Float(2.0)], vec![Value::Int(3)]]));
        let schema = Schema::from_names(&["x"]);
        assert_eq!(merge(&[a.clone(), b.clone()], false, schema.clone()).len(), 4);
        let distinct = merge(&[a, b], true, schema);
        assert_eq!(
            distinct.rows,
            vec![vec![Value::Int(1)], vec![Value::Int(2)], vec![Value::Int(3)]]
        );
    }

    #[test]
    fn test_project_without_input() {
        let items = vec![ProjectItem {
            expr: Expr::lit("hello"),
            field: Field::new("content"),
        }];
        let out = project(None, &items).unwrap();
        assert_eq!(out.rows, vec![vec![Value::from("hello")]]);
        assert_eq!(out.schema.names(), vec!["content"]);
    }
}
