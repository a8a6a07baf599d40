//! Statement AST accepted by the planner.
//!
//! SQL text is parsed by an external front end; these node shapes are the
//! contract between that parser and the core. Everything derives serde so
//! statements can be stored (jobs, views) and fed to the CLI as JSON.

use crate::error::PlanError;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// Dotted object name, e.g. `crm.customers`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ObjectName(pub Vec<String>);

impl ObjectName {
    pub fn new(name: &str) -> Self {
        Self(name.split('.').map(|s| s.trim().to_string()).collect())
    }

    /// Lower-cased registry key
    pub fn qualified(&self) -> String {
        self.0
            .iter()
            .map(|p| p.to_lowercase())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Last path segment, used as the default alias
    pub fn base(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or("")
    }
}

impl From<String> for ObjectName {
    fn from(s: String) -> Self {
        ObjectName::new(&s)
    }
}

impl From<ObjectName> for String {
    fn from(n: ObjectName) -> Self {
        n.0.join(".")
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Column reference with optional relation qualifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    pub name: String,
}

impl ColumnRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            relation: None,
            name: name.into(),
        }
    }

    pub fn qualified(relation: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            relation: Some(relation.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relation {
            Some(r) => write!(f, "{}.{}", r, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Plus,
    Minus,
    Multiply,
    Divide,
    Concat,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }

    /// Operator with operands swapped (`a < b` == `b > a`)
    pub fn flipped(self) -> Self {
        match self {
            BinaryOp::Lt => BinaryOp::Gt,
            BinaryOp::LtEq => BinaryOp::GtEq,
            BinaryOp::Gt => BinaryOp::Lt,
            BinaryOp::GtEq => BinaryOp::LtEq,
            other => other,
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Concat => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Predicate / scalar expression tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Column(ColumnRef),
    Literal(Value),
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    Function {
        name: String,
        args: Vec<Expr>,
        #[serde(default)]
        distinct: bool,
    },
    /// `*` inside `COUNT(*)`
    Wildcard,
    /// The `LAST` / `LATEST` marker in `col > LAST`, replaced by a job's watermark
    Last,
}

impl Expr {
    pub fn col(name: &str) -> Self {
        match name.split_once('.') {
            Some((rel, col)) => Expr::Column(ColumnRef::qualified(rel, col)),
            None => Expr::Column(ColumnRef::new(name)),
        }
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Self {
        Expr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Expr::binary(left, BinaryOp::Eq, right)
    }

    pub fn and(left: Expr, right: Expr) -> Self {
        Expr::binary(left, BinaryOp::And, right)
    }

    pub fn func(name: &str, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.to_lowercase(),
            args,
            distinct: false,
        }
    }

    /// Split a predicate into its top-level AND conjuncts
    pub fn conjuncts(self) -> Vec<Expr> {
        match self {
            Expr::Binary {
                left,
                op: BinaryOp::And,
                right,
            } => {
                let mut out = left.conjuncts();
                out.extend(right.conjuncts());
                out
            }
            other => vec![other],
        }
    }

    /// Rebuild a conjunction; `None` for an empty list
    pub fn conjoin(exprs: Vec<Expr>) -> Option<Expr> {
        exprs.into_iter().reduce(Expr::and)
    }

    /// Every column referenced anywhere in the tree
    pub fn columns(&self) -> Vec<&ColumnRef> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let Expr::Column(c) = e {
                out.push(c);
            }
        });
        out
    }

    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if let Expr::Function { name, .. } = e {
                if is_aggregate(name) {
                    found = true;
                }
            }
        });
        found
    }

    pub fn contains_last(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if matches!(e, Expr::Last) {
                found = true;
            }
        });
        found
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Binary { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => expr.visit(f),
            Expr::InList { expr, list, .. } => {
                expr.visit(f);
                for item in list {
                    item.visit(f);
                }
            }
            Expr::Like { expr, pattern, .. } => {
                expr.visit(f);
                pattern.visit(f);
            }
            Expr::Function { args, .. } => {
                for arg in args {
                    arg.visit(f);
                }
            }
            Expr::Column(_) | Expr::Literal(_) | Expr::Wildcard | Expr::Last => {}
        }
    }

    /// Apply `f` to each direct child, leaving this node's own shape alone
    pub fn map_children(self, f: &mut impl FnMut(Expr) -> Expr) -> Expr {
        match self {
            Expr::Binary { left, op, right } => Expr::Binary {
                left: Box::new(f(*left)),
                op,
                right: Box::new(f(*right)),
            },
            Expr::Unary { op, expr } => Expr::Unary {
                op,
                expr: Box::new(f(*expr)),
            },
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: Box::new(f(*expr)),
                negated,
            },
            Expr::InList {
                expr,
                list,
                negated,
            } => Expr::InList {
                expr: Box::new(f(*expr)),
                list: list.into_iter().map(&mut *f).collect(),
                negated,
            },
            Expr::Like {
                expr,
                pattern,
                negated,
            } => Expr::Like {
                expr: Box::new(f(*expr)),
                pattern: Box::new(f(*pattern)),
                negated,
            },
            Expr::Function {
                name,
                args,
                distinct,
            } => Expr::Function {
                name,
                args: args.into_iter().map(&mut *f).collect(),
                distinct,
            },
            leaf => leaf,
        }
    }

    /// Rewrite in place, bottom-up
    pub fn transform(self, f: &mut impl FnMut(Expr) -> Expr) -> Expr {
        let rebuilt = self.map_children(&mut |child| child.transform(&mut *f));
        f(rebuilt)
    }

    /// Name used for an unaliased projection of this expression
    pub fn output_name(&self) -> String {
        match self {
            Expr::Column(c) => c.name.clone(),
            other => other.to_string(),
        }
    }
}

pub fn is_aggregate(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "count" | "sum" | "avg" | "min" | "max"
    )
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(c) => write!(f, "{}", c),
            Expr::Literal(Value::Text(s)) => write!(f, "'{}'", s.replace('\'', "''")),
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Binary { left, op, right } => write!(f, "({} {} {})", left, op.sql(), right),
            Expr::Unary {
                op: UnaryOp::Not,
                expr,
            } => write!(f, "NOT {}", expr),
            Expr::Unary {
                op: UnaryOp::Neg,
                expr,
            } => write!(f, "-{}", expr),
            Expr::IsNull { expr, negated } => {
                write!(f, "{} IS {}NULL", expr, if *negated { "NOT " } else { "" })
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let items: Vec<String> = list.iter().map(|e| e.to_string()).collect();
                write!(
                    f,
                    "{} {}IN ({})",
                    expr,
                    if *negated { "NOT " } else { "" },
                    items.join(", ")
                )
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => write!(
                f,
                "{} {}LIKE {}",
                expr,
                if *negated { "NOT " } else { "" },
                pattern
            ),
            Expr::Function {
                name,
                args,
                distinct,
            } => {
                let items: Vec<String> = args.iter().map(|e| e.to_string()).collect();
                write!(
                    f,
                    "{}({}{})",
                    name,
                    if *distinct { "DISTINCT " } else { "" },
                    items.join(", ")
                )
            }
            Expr::Wildcard => write!(f, "*"),
            Expr::Last => write!(f, "LAST"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectItem {
    Wildcard,
    QualifiedWildcard(String),
    Expr {
        expr: Expr,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
}

impl SelectItem {
    pub fn expr(expr: Expr) -> Self {
        SelectItem::Expr { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: &str) -> Self {
        SelectItem::Expr {
            expr,
            alias: Some(alias.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    Inner,
    Left,
}

/// FROM clause: relation reference or join tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableExpr {
    Relation {
        name: ObjectName,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
    Join {
        left: Box<TableExpr>,
        right: Box<TableExpr>,
        kind: JoinKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on: Option<Expr>,
    },
}

impl TableExpr {
    pub fn relation(name: &str) -> Self {
        TableExpr::Relation {
            name: ObjectName::new(name),
            alias: None,
        }
    }

    pub fn aliased(name: &str, alias: &str) -> Self {
        TableExpr::Relation {
            name: ObjectName::new(name),
            alias: Some(alias.to_string()),
        }
    }

    pub fn join(left: TableExpr, right: TableExpr, kind: JoinKind, on: Option<Expr>) -> Self {
        TableExpr::Join {
            left: Box::new(left),
            right: Box::new(right),
            kind,
            on,
        }
    }

    /// Relation references in declaration order
    pub fn relations(&self) -> Vec<(&ObjectName, Option<&str>)> {
        match self {
            TableExpr::Relation { name, alias } => vec![(name, alias.as_deref())],
            TableExpr::Join { left, right, .. } => {
                let mut out = left.relations();
                out.extend(right.relations());
                out
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderByExpr {
    pub expr: Expr,
    #[serde(default = "default_true")]
    pub asc: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Select {
    pub projection: Vec<SelectItem>,
    /// `None` for constant selects like `SELECT 'hello' AS content`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<TableExpr>,
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub selection: Option<Expr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<Expr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderByExpr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Select {
    /// `SELECT * FROM <name>`
    pub fn star(from: TableExpr) -> Self {
        Self {
            projection: vec![SelectItem::Wildcard],
            from: Some(from),
            selection: None,
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn with_where(mut self, predicate: Expr) -> Self {
        self.selection = Some(predicate);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    Select(Box<Select>),
    Union {
        left: Box<Query>,
        right: Box<Query>,
        #[serde(default)]
        all: bool,
    },
}

impl From<Select> for Query {
    fn from(select: Select) -> Self {
        Query::Select(Box::new(select))
    }
}

/// `USING key = value, ...`; values may be nested maps (`model = {...}`)
pub type Using = Map<String, JsonValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateKnowledgeBase {
    pub name: ObjectName,
    #[serde(default)]
    pub using: Using,
    #[serde(default)]
    pub if_not_exists: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateModel {
    pub name: ObjectName,
    /// Columns the model produces
    pub predict: Vec<String>,
    #[serde(default)]
    pub using: Using,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateAgent {
    pub name: ObjectName,
    #[serde(default)]
    pub using: Using,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateJob {
    pub name: ObjectName,
    pub statements: Vec<Statement>,
    /// e.g. `"1 day"`, `"30 minutes"`
    pub every: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Body only runs when this query yields at least one row
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_query: Option<Query>,
    /// Process rows that existed before the job was created
    #[serde(default)]
    pub backfill: bool,
    /// Stop scheduling after this many runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    KnowledgeBase,
    Model,
    Agent,
    Job,
    View,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::KnowledgeBase => "knowledge_base",
            ObjectKind::Model => "model",
            ObjectKind::Agent => "agent",
            ObjectKind::Job => "job",
            ObjectKind::View => "view",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ObjectKind {
    type Err = PlanError;

    fn from_str(s: &str) -> std::result::Result<Self, PlanError> {
        match s.to_lowercase().as_str() {
            "knowledge_base" => Ok(ObjectKind::KnowledgeBase),
            "model" => Ok(ObjectKind::Model),
            "agent" => Ok(ObjectKind::Agent),
            "job" => Ok(ObjectKind::Job),
            "view" => Ok(ObjectKind::View),
            other => Err(PlanError::InvalidStatement(format!("unknown object kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statement {
    Query(Query),
    Insert {
        target: ObjectName,
        query: Query,
    },
    /// Remove knowledge base chunks matching `selection` (all when absent)
    Delete {
        target: ObjectName,
        #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
        selection: Option<Expr>,
    },
    CreateKnowledgeBase(CreateKnowledgeBase),
    CreateModel(CreateModel),
    CreateAgent(CreateAgent),
    CreateJob(CreateJob),
    CreateView {
        name: ObjectName,
        query: Query,
    },
    Drop {
        kind: ObjectKind,
        name: ObjectName,
        #[serde(default)]
        if_exists: bool,
    },
}

impl Select {
    /// Every expression in the select, join conditions included
    pub fn expressions(&self) -> Vec<&Expr> {
        fn on_clauses<'a>(table: &'a TableExpr, out: &mut Vec<&'a Expr>) {
            if let TableExpr::Join { left, right, on, .. } = table {
                on_clauses(left, out);
                on_clauses(right, out);
                out.extend(on.iter());
            }
        }
        let mut out = Vec::new();
        for item in &self.projection {
            if let SelectItem::Expr { expr, .. } = item {
                out.push(expr);
            }
        }
        if let Some(from) = &self.from {
            on_clauses(from, &mut out);
        }
        out.extend(self.selection.iter());
        out.extend(self.group_by.iter());
        out.extend(self.order_by.iter().map(|o| &o.expr));
        out
    }
}

impl Query {
    pub fn selects(&self) -> Vec<&Select> {
        match self {
            Query::Select(select) => vec![select.as_ref()],
            Query::Union { left, right, .. } => {
                let mut out = left.selects();
                out.extend(right.selects());
                out
            }
        }
    }

    pub fn contains_last(&self) -> bool {
        self.selects()
            .iter()
            .any(|s| s.expressions().iter().any(|e| e.contains_last()))
    }
}

impl Statement {
    /// Whether a `LAST` marker appears anywhere in a query this statement runs
    pub fn contains_last(&self) -> bool {
        match self {
            Statement::Query(query) | Statement::Insert { query, .. } => query.contains_last(),
            Statement::Delete {
                selection: Some(selection),
                ..
            } => selection.contains_last(),
            _ => false,
        }
    }
}

impl From<Select> for Statement {
    fn from(select: Select) -> Self {
        Statement::Query(select.into())
    }
}
