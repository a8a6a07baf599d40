//! Row-oriented value model shared by adapters, the vector store and the executor.

use crate::error::PlanError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};
use std::cmp::Ordering;
use std::fmt;

/// A single SQL value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(JsonValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean view used by predicates: NULL stays unknown
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Float(f) => Some(*f != 0.0),
            Value::Text(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Some(true),
                "false" | "f" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Render as text for content concatenation and string functions
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Text(s) => Some(s.clone()),
            Value::Json(j) => Some(j.to_string()),
            other => Some(other.to_string()),
        }
    }

    /// SQL comparison. Returns `None` when either side is NULL or the
    /// types are not comparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Json(a), Value::Json(b)) => {
                if a == b {
                    Some(Ordering::Equal)
                } else {
                    Some(a.to_string().cmp(&b.to_string()))
                }
            }
            (Value::Text(_), _) | (_, Value::Text(_)) => {
                // numeric text compares numerically, anything else lexically
                match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => self.to_text().zip(other.to_text()).map(|(a, b)| a.cmp(&b)),
                }
            }
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    /// Three-valued equality
    pub fn sql_eq(&self, other: &Value) -> Option<bool> {
        self.compare(other).map(|o| o == Ordering::Equal)
    }

    /// Total order for sorting: NULLs last, then by `compare`, falling back to
    /// a type rank so mixed columns still sort deterministically.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            _ => {}
        }
        self.compare(other)
            .unwrap_or_else(|| self.type_rank().cmp(&other.type_rank()))
    }

    /// ORDER BY comparison: NULLs sort last in both directions
    pub fn order_cmp(&self, other: &Value, asc: bool) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ if asc => self.sort_cmp(other),
            _ => self.sort_cmp(other).reverse(),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 5,
            Value::Bool(_) => 0,
            Value::Int(_) | Value::Float(_) => 1,
            Value::Text(_) => 2,
            Value::Json(_) => 3,
        }
    }

    /// Hashable key used by joins, grouping and DISTINCT. Integral floats
    /// collapse onto ints so `1 = 1.0` joins, and canonical numeric text
    /// keys as its number so `'7' = 7` joins the way `compare` says it should.
    /// Padded or zero-led text like `'07'` keeps a text key.
    pub fn key(&self) -> KeyPart {
        match self {
            Value::Null => KeyPart::Null,
            Value::Bool(b) => KeyPart::Bool(*b),
            Value::Int(i) => KeyPart::Int(*i),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    KeyPart::Int(*f as i64)
                } else {
                    KeyPart::Float(f.to_bits())
                }
            }
            Value::Text(s) => numeric_key(s).unwrap_or_else(|| KeyPart::Text(s.clone())),
            Value::Json(j) => KeyPart::Text(j.to_string()),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Json(j) => j.clone(),
        }
    }

    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            JsonValue::String(s) => Value::Text(s),
            other => Value::Json(other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
            Value::Json(j) => write!(f, "{}", j),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        JsonValue::deserialize(deserializer).map(Value::from_json)
    }
}

/// Hashable projection of a [`Value`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Text(String),
}

fn numeric_key(text: &str) -> Option<KeyPart> {
    if let Ok(i) = text.parse::<i64>() {
        return (i.to_string() == text).then_some(KeyPart::Int(i));
    }
    let f = text.parse::<f64>().ok().filter(|f| f.is_finite())?;
    (f.to_string() == text).then(|| Value::Float(f).key())
}

/// One output column, optionally qualified by the relation (or alias) it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub relation: Option<String>,
    pub name: String,
}

impl Field {
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

    fn matches(&self, relation: Option<&str>, name: &str) -> bool {
        if !self.name.eq_ignore_ascii_case(name) {
            return false;
        }
        match (relation, &self.relation) {
            (None, _) => true,
            (Some(r), Some(own)) => own.eq_ignore_ascii_case(r) || own.rsplit('.').next().is_some_and(|t| t.eq_ignore_ascii_case(r)),
            (Some(_), None) => false,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relation {
            Some(r) => write!(f, "{}.{}", r, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Ordered list of fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Unqualified schema from plain column names
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            fields: names.iter().map(|n| Field::new(n.as_ref())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Resolve a (possibly qualified) column reference
    pub fn index_of(&self, relation: Option<&str>, name: &str) -> std::result::Result<usize, PlanError> {
        let mut found = None;
        for (i, field) in self.fields.iter().enumerate() {
            if field.matches(relation, name) {
                if found.is_some() {
                    return Err(PlanError::AmbiguousColumn(display_ref(relation, name)));
                }
                found = Some(i);
            }
        }
        found.ok_or_else(|| PlanError::UnknownColumn(display_ref(relation, name)))
    }

    pub fn contains(&self, relation: Option<&str>, name: &str) -> bool {
        self.fields.iter().any(|f| f.matches(relation, name))
    }

    /// Re-qualify every field with the given relation name
    pub fn qualify(&self, relation: &str) -> Schema {
        Schema {
            fields: self
                .fields
                .iter()
                .map(|f| Field::qualified(relation, f.name.clone()))
                .collect(),
        }
    }

    pub fn join(&self, other: &Schema) -> Schema {
        let mut fields = self.fields.clone();
        fields.extend(other.fields.iter().cloned());
        Schema { fields }
    }
}

fn display_ref(relation: Option<&str>, name: &str) -> String {
    match relation {
        Some(r) => format!("{}.{}", r, name),
        None => name.to_string(),
    }
}

pub type Row = Vec<Value>;

/// A fully materialized result of one plan step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub schema: Schema,
    pub rows: Vec<Row>,
}

impl Batch {
    pub fn new(schema: Schema, rows: Vec<Row>) -> Self {
        Self { schema, rows }
    }

    pub fn empty(schema: Schema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of an unqualified column name
    pub fn column(&self, name: &str) -> Option<usize> {
        self.schema.index_of(None, name).ok()
    }

    /// Values of one column, top to bottom
    pub fn column_values(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column(name)?;
        Some(self.rows.iter().map(|r| &r[idx]).collect())
    }

    /// Build from JSON objects; columns are the union of keys in first-seen order
    pub fn from_json_rows(rows: Vec<Map<String, JsonValue>>) -> Self {
        let mut names: Vec<String> = Vec::new();
        for row in &rows {
            for key in row.keys() {
                if !names.iter().any(|n| n == key) {
                    names.push(key.clone());
                }
            }
        }
        let rows = rows
            .into_iter()
            .map(|mut obj| {
                names
                    .iter()
                    .map(|n| obj.remove(n).map(Value::from_json).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Self {
            schema: Schema::from_names(&names),
            rows,
        }
    }

    pub fn to_json_rows(&self) -> Vec<Map<String, JsonValue>> {
        self.rows
            .iter()
            .map(|row| {
                self.schema
                    .fields
                    .iter()
                    .zip(row.iter())
                    .map(|(f, v)| (f.name.clone(), v.to_json()))
                    .collect()
            })
            .collect()
    }
}

/// Compiled SQL `LIKE` pattern. `%` matches any run, `_` one character;
/// ASCII case is ignored as in SQLite.
#[derive(Debug, Clone)]
pub struct LikePattern {
    regex: regex::Regex,
}

impl LikePattern {
    pub fn new(pattern: &str) -> std::result::Result<Self, PlanError> {
        let mut re = String::with_capacity(pattern.len() + 8);
        re.push_str("(?is)^");
        let mut buf = [0u8; 4];
        for ch in pattern.chars() {
            match ch {
                '%' => re.push_str(".*"),
                '_' => re.push('.'),
                other => re.push_str(&regex::escape(other.encode_utf8(&mut buf))),
            }
        }
        re.push('$');
        let regex = regex::Regex::new(&re)
            .map_err(|e| PlanError::InvalidStatement(format!("bad LIKE pattern: {}", e)))?;
        Ok(Self { regex })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_comparisons_are_unknown() {
        assert_eq!(Value::Null.sql_eq(&Value::Null), None);
        assert_eq!(Value::Int(1).sql_eq(&Value::Null), None);
        assert_eq!(Value::Int(1).sql_eq(&Value::Float(1.0)), Some(true));
    }

    #[test]
    fn test_sort_puts_nulls_last() {
        let mut values = vec![Value::Null, Value::Int(3), Value::Int(1)];
        values.sort_by(|a, b| a.sort_cmp(b));
        assert_eq!(values, vec![Value::Int(1), Value::Int(3), Value::Null]);
    }

    #[test]
    fn test_key_collapses_integral_floats() {
        assert_eq!(Value::Float(2.0).key(), Value::Int(2).key());
        assert_ne!(Value::Float(2.5).key(), Value::Int(2).key());
    }

    #[test]
    fn test_key_agrees_with_numeric_text_comparison() {
        for (text, number) in [("7", Value::Int(7)), ("-3", Value::Int(-3)), ("2.5", Value::Float(2.5))] {
            let text = Value::from(text);
            assert_eq!(text.sql_eq(&number), Some(true));
            assert_eq!(text.key(), number.key());
        }
        assert_eq!(Value::from("07").key(), KeyPart::Text("07".into()));
        assert_eq!(Value::from("rust").key(), KeyPart::Text("rust".into()));
    }

    #[test]
    fn test_schema_resolution() {
        let schema = Schema::new(vec![
            Field::qualified("t", "id"),
            Field::qualified("kb", "id"),
            Field::qualified("kb", "content"),
        ]);
        assert_eq!(schema.index_of(Some("kb"), "ID").unwrap(), 1);
        assert_eq!(schema.index_of(None, "content").unwrap(), 2);
        assert!(matches!(
            schema.index_of(None, "id"),
            Err(PlanError::AmbiguousColumn(_))
        ));
        assert!(matches!(
            schema.index_of(None, "missing"),
            Err(PlanError::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_qualified_name_matches_table_suffix() {
        let schema = Schema::new(vec![Field::qualified("crm.customers", "id")]);
        assert_eq!(schema.index_of(Some("customers"), "id").unwrap(), 0);
    }

    #[test]
    fn test_like_pattern() {
        let p = LikePattern::new("%rust_lang%").unwrap();
        assert!(p.matches("I love RUST-LANG a lot"));
        assert!(!p.matches("rustlang"));
        assert!(LikePattern::new("a.b").unwrap().matches("a.b"));
        assert!(!LikePattern::new("a.b").unwrap().matches("axb"));
    }

    #[test]
    fn test_batch_from_json_rows_unions_keys() {
        let rows = vec![
            json!({"a": 1, "b": "x"}).as_object().unwrap().clone(),
            json!({"b": "y", "c": true}).as_object().unwrap().clone(),
        ];
        let batch = Batch::from_json_rows(rows);
        assert_eq!(batch.schema.names(), vec!["a", "b", "c"]);
        assert_eq!(batch.rows[1], vec![Value::Null, Value::from("y"), Value::Bool(true)]);
    }
}
