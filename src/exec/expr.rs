//! Scalar expression evaluation with SQL NULL semantics

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::{PlanError, Result};
use crate::value::{LikePattern, Row, Schema, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarFunc {
    Lower,
    Upper,
    Length,
    Trim,
    Abs,
    Coalesce,
}

impl ScalarFunc {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "lower" => Some(ScalarFunc::Lower),
            "upper" => Some(ScalarFunc::Upper),
            "length" | "char_length" => Some(ScalarFunc::Length),
            "trim" => Some(ScalarFunc::Trim),
            "abs" => Some(ScalarFunc::Abs),
            "coalesce" | "ifnull" => Some(ScalarFunc::Coalesce),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LikeMatcher {
    Const(LikePattern),
    Dynamic(Box<BoundExpr>),
}

/// Expression with column references resolved to row offsets
#[derive(Debug, Clone)]
pub enum BoundExpr {
    Column(usize),
    Literal(Value),
    Binary {
        left: Box<BoundExpr>,
        op: BinaryOp,
        right: Box<BoundExpr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<BoundExpr>,
    },
    IsNull {
        expr: Box<BoundExpr>,
        negated: bool,
    },
    InList {
        expr: Box<BoundExpr>,
        list: Vec<BoundExpr>,
        negated: bool,
    },
    Like {
        expr: Box<BoundExpr>,
        pattern: LikeMatcher,
        negated: bool,
    },
    Scalar {
        func: ScalarFunc,
        args: Vec<BoundExpr>,
    },
}

/// Resolve column references of `expr` against `schema`
pub fn bind(expr: &Expr, schema: &Schema) -> std::result::Result<BoundExpr, PlanError> {
    Ok(match expr {
        Expr::Column(c) => BoundExpr::Column(schema.index_of(c.relation.as_deref(), &c.name)?),
        Expr::Literal(v) => BoundExpr::Literal(v.clone()),
        Expr::Binary { left, op, right } => BoundExpr::Binary {
            left: Box::new(bind(left, schema)?),
            op: *op,
            right: Box::new(bind(right, schema)?),
        },
        Expr::Unary { op, expr } => BoundExpr::Unary {
            op: *op,
            expr: Box::new(bind(expr, schema)?),
        },
        Expr::IsNull { expr, negated } => BoundExpr::IsNull {
            expr: Box::new(bind(expr, schema)?),
            negated: *negated,
        },
        Expr::InList {
            expr,
            list,
            negated,
        } => BoundExpr::InList {
            expr: Box::new(bind(expr, schema)?),
            list: list
                .iter()
                .map(|e| bind(e, schema))
                .collect::<std::result::Result<_, _>>()?,
            negated: *negated,
        },
        Expr::Like {
            expr,
            pattern,
            negated,
        } => {
            let pattern = match pattern.as_ref() {
                Expr::Literal(Value::Text(p)) => LikeMatcher::Const(LikePattern::new(p)?),
                other => LikeMatcher::Dynamic(Box::new(bind(other, schema)?)),
            };
            BoundExpr::Like {
                expr: Box::new(bind(expr, schema)?),
                pattern,
                negated: *negated,
            }
        }
        Expr::Function { name, args, .. } => {
            let func = ScalarFunc::from_name(name).ok_or_else(|| {
                if crate::ast::is_aggregate(name) {
                    PlanError::InvalidStatement(format!(
                        "aggregate {}() is not allowed here",
                        name
                    ))
                } else {
                    PlanError::Unsupported(format!("function {}()", name))
                }
            })?;
            BoundExpr::Scalar {
                func,
                args: args
                    .iter()
                    .map(|e| bind(e, schema))
                    .collect::<std::result::Result<_, _>>()?,
            }
        }
        Expr::Wildcard => {
            return Err(PlanError::InvalidStatement(
                "'*' is only valid inside COUNT(*)".to_string(),
            ))
        }
        Expr::Last => {
            return Err(PlanError::InvalidStatement(
                "LAST is only valid inside a job".to_string(),
            ))
        }
    })
}

impl BoundExpr {
    pub fn eval(&self, row: &Row) -> Result<Value> {
        Ok(match self {
            BoundExpr::Column(i) => row.get(*i).cloned().unwrap_or(Value::Null),
            BoundExpr::Literal(v) => v.clone(),
            BoundExpr::Binary { left, op, right } => {
                let l = left.eval(row)?;
                match op {
                    // Short-circuit where three-valued logic allows
                    BinaryOp::And if l.as_bool() == Some(false) => Value::Bool(false),
                    BinaryOp::Or if l.as_bool() == Some(true) => Value::Bool(true),
                    _ => binary(&l, *op, &right.eval(row)?),
                }
            }
            BoundExpr::Unary { op, expr } => {
                let v = expr.eval(row)?;
                match op {
                    UnaryOp::Not => v.as_bool().map(|b| Value::Bool(!b)).unwrap_or(Value::Null),
                    UnaryOp::Neg => match v {
                        Value::Int(i) => Value::Int(i.wrapping_neg()),
                        other => other.as_f64().map(|f| Value::Float(-f)).unwrap_or(Value::Null),
                    },
                }
            }
            BoundExpr::IsNull { expr, negated } => Value::Bool(expr.eval(row)?.is_null() != *negated),
            BoundExpr::InList {
                expr,
                list,
                negated,
            } => {
                let v = expr.eval(row)?;
                if v.is_null() {
                    return Ok(Value::Null);
                }
                let mut saw_null = false;
                for item in list {
                    match v.sql_eq(&item.eval(row)?) {
                        Some(true) => return Ok(Value::Bool(!negated)),
                        Some(false) => {}
                        None => saw_null = true,
                    }
                }
                if saw_null {
                    Value::Null
                } else {
                    Value::Bool(*negated)
                }
            }
            BoundExpr::Like {
                expr,
                pattern,
                negated,
            } => {
                let Some(text) = expr.eval(row)?.to_text() else {
                    return Ok(Value::Null);
                };
                let matched = match pattern {
                    LikeMatcher::Const(p) => p.matches(&text),
                    LikeMatcher::Dynamic(e) => match e.eval(row)?.to_text() {
                        Some(p) => LikePattern::new(&p)?.matches(&text),
                        None => return Ok(Value::Null),
                    },
                };
                Value::Bool(matched != *negated)
            }
            BoundExpr::Scalar { func, args } => {
                let values = args
                    .iter()
                    .map(|a| a.eval(row))
                    .collect::<Result<Vec<_>>>()?;
                scalar(*func, values)
            }
        })
    }

    /// True only when the predicate evaluates to TRUE (NULL and FALSE reject)
    pub fn matches(&self, row: &Row) -> Result<bool> {
        Ok(self.eval(row)?.as_bool() == Some(true))
    }
}

fn binary(l: &Value, op: BinaryOp, r: &Value) -> Value {
    match op {
        BinaryOp::And => match (l.as_bool(), r.as_bool()) {
            (Some(false), _) | (_, Some(false)) => Value::Bool(false),
            (Some(true), Some(true)) => Value::Bool(true),
            _ => Value::Null,
        },
        BinaryOp::Or => match (l.as_bool(), r.as_bool()) {
            (Some(true), _) | (_, Some(true)) => Value::Bool(true),
            (Some(false), Some(false)) => Value::Bool(false),
            _ => Value::Null,
        },
        BinaryOp::Eq
        | BinaryOp::NotEq
        | BinaryOp::Lt
        | BinaryOp::LtEq
        | BinaryOp::Gt
        | BinaryOp::GtEq => match l.compare(r) {
            None => Value::Null,
            Some(ord) => Value::Bool(match op {
                BinaryOp::Eq => ord == Ordering::Equal,
                BinaryOp::NotEq => ord != Ordering::Equal,
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::LtEq => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }),
        },
        BinaryOp::Concat => match (l.to_text(), r.to_text()) {
            (Some(a), Some(b)) => Value::Text(a + &b),
            _ => Value::Null,
        },
        BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Multiply | BinaryOp::Divide => {
            arithmetic(l, op, r)
        }
    }
}

fn arithmetic(l: &Value, op: BinaryOp, r: &Value) -> Value {
    if l.is_null() || r.is_null() {
        return Value::Null;
    }
    if let (Value::Int(a), Value::Int(b)) = (l, r) {
        let out = match op {
            BinaryOp::Plus => a.checked_add(*b),
            BinaryOp::Minus => a.checked_sub(*b),
            BinaryOp::Multiply => a.checked_mul(*b),
            // Division by zero yields NULL, as in SQLite
            _ => a.checked_div(*b),
        };
        return out.map(Value::Int).unwrap_or(Value::Null);
    }
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => match op {
            BinaryOp::Plus => Value::Float(a + b),
            BinaryOp::Minus => Value::Float(a - b),
            BinaryOp::Multiply => Value::Float(a * b),
            _ if b == 0.0 => Value::Null,
            _ => Value::Float(a / b),
        },
        _ => Value::Null,
    }
}

fn scalar(func: ScalarFunc, mut args: Vec<Value>) -> Value {
    if func == ScalarFunc::Coalesce {
        return args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null);
    }
    let Some(first) = args.drain(..).next() else {
        return Value::Null;
    };
    if first.is_null() {
        return Value::Null;
    }
    match func {
        ScalarFunc::Lower => first.to_text().map(|s| Value::Text(s.to_lowercase())).unwrap_or(Value::Null),
        ScalarFunc::Upper => first.to_text().map(|s| Value::Text(s.to_uppercase())).unwrap_or(Value::Null),
        ScalarFunc::Trim => first.to_text().map(|s| Value::Text(s.trim().to_string())).unwrap_or(Value::Null),
        ScalarFunc::Length => first
            .to_text()
            .map(|s| Value::Int(s.chars().count() as i64))
            .unwrap_or(Value::Null),
        ScalarFunc::Abs => match first {
            Value::Int(i) => Value::Int(i.wrapping_abs()),
            other => other.as_f64().map(|f| Value::Float(f.abs())).unwrap_or(Value::Null),
        },
        ScalarFunc::Coalesce => Value::Null,
    }
}

/// Evaluate a constant expression (no column references)
pub fn eval_const(expr: &Expr) -> Result<Value> {
    bind(expr, &Schema::default())?.eval(&Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Field;

    fn schema() -> Schema {
        Schema::new(vec![Field::qualified("t", "a"), Field::qualified("t", "b")])
    }

    fn eval(expr: Expr, row: Row) -> Value {
        bind(&expr, &schema()).unwrap().eval(&row).unwrap()
    }

    #[test]
    fn test_three_valued_logic() {
        let row = vec![Value::Null, Value::Int(1)];
        let a_eq_1 = Expr::eq(Expr::col("a"), Expr::lit(1));
        assert_eq!(eval(a_eq_1.clone(), row.clone()), Value::Null);
        assert_eq!(
            eval(
                Expr::and(a_eq_1.clone(), Expr::eq(Expr::col("b"), Expr::lit(2))),
                row.clone()
            ),
            Value::Bool(false)
        );
        assert_eq!(
            eval(
                Expr::binary(a_eq_1, BinaryOp::Or, Expr::eq(Expr::col("b"), Expr::lit(1))),
                row.clone()
            ),
            Value::Bool(true)
        );
        let not_null = Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(Expr::eq(Expr::col("a"), Expr::lit(1))),
        };
        assert_eq!(eval(not_null, row), Value::Null);
    }

    #[test]
    fn test_in_list_with_null() {
        let expr = Expr::InList {
            expr: Box::new(Expr::col("b")),
            list: vec![Expr::lit(5), Expr::Literal(Value::Null)],
            negated: false,
        };
        assert_eq!(eval(expr, vec![Value::Null, Value::Int(1)]), Value::Null);
    }

    #[test]
    fn test_arithmetic() {
        let row = vec![Value::Int(7), Value::Int(2)];
        assert_eq!(
            eval(Expr::binary(Expr::col("a"), BinaryOp::Divide, Expr::col("b")), row.clone()),
            Value::Int(3)
        );
        assert_eq!(
            eval(Expr::binary(Expr::col("a"), BinaryOp::Divide, Expr::lit(0)), row.clone()),
            Value::Null
        );
        assert_eq!(
            eval(Expr::binary(Expr::col("a"), BinaryOp::Plus, Expr::lit(0.5)), row),
            Value::Float(7.5)
        );
    }

    #[test]
    fn test_functions_and_like() {
        let row = vec![Value::from("Hello"), Value::Null];
        assert_eq!(eval(Expr::func("upper", vec![Expr::col("a")]), row.clone()), Value::from("HELLO"));
        assert_eq!(
            eval(Expr::func("coalesce", vec![Expr::col("b"), Expr::lit("x")]), row.clone()),
            Value::from("x")
        );
        let like = Expr::Like {
            expr: Box::new(Expr::col("a")),
            pattern: Box::new(Expr::lit("he%")),
            negated: false,
        };
        assert_eq!(eval(like, row), Value::Bool(true));
    }

    #[test]
    fn test_bind_errors() {
        assert!(matches!(
            bind(&Expr::col("missing"), &schema()),
            Err(PlanError::UnknownColumn(_))
        ));
        assert!(bind(&Expr::func("count", vec![Expr::Wildcard]), &schema()).is_err());
        assert!(bind(&Expr::Last, &schema()).is_err());
        assert_eq!(eval_const(&Expr::lit("x")).unwrap(), Value::from("x"));
    }
}
