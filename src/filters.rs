//! Row predicates.
//!
//! A filter file maps `"{schema}.{table}"` to a predicate tree of nested
//! objects: interior keys `$and` / `$or` hold lists of sub-predicates, leaf
//! keys `data.<column>` hold comparison operators
//! (`$in`, `$nin`, `$lt`, `$lte`, `$gt`, `$gte`, `$eq`, `$ne`). Several keys
//! in one object conjoin. The tree is parsed once at startup; evaluation is a
//! pure function per row, and an absent predicate costs nothing.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::import::rows::{Row, Value};

#[derive(Debug, Clone)]
pub enum ColumnOp {
    In(Vec<serde_json::Value>),
    NotIn(Vec<serde_json::Value>),
    Lt(serde_json::Value),
    Lte(serde_json::Value),
    Gt(serde_json::Value),
    Gte(serde_json::Value),
    Eq(serde_json::Value),
    Ne(serde_json::Value),
}

#[derive(Debug, Clone)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Column { column: String, ops: Vec<ColumnOp> },
}

fn operand_list(op: &str, operand: &serde_json::Value) -> Result<Vec<serde_json::Value>> {
    operand
        .as_array()
        .map(|items| items.to_vec())
        .with_context(|| format!("{op} operand must be a list, got {operand}"))
}

fn parse_column_ops(column: &str, spec: &serde_json::Value) -> Result<Vec<ColumnOp>> {
    let object = spec
        .as_object()
        .with_context(|| format!("operators for data.{column} must be an object"))?;

    let mut ops = Vec::with_capacity(object.len());
    for (op, operand) in object {
        let parsed = match op.as_str() {
            "$in" => ColumnOp::In(operand_list(op, operand)?),
            "$nin" => ColumnOp::NotIn(operand_list(op, operand)?),
            "$lt" => ColumnOp::Lt(operand.clone()),
            "$lte" => ColumnOp::Lte(operand.clone()),
            "$gt" => ColumnOp::Gt(operand.clone()),
            "$gte" => ColumnOp::Gte(operand.clone()),
            "$eq" => ColumnOp::Eq(operand.clone()),
            "$ne" => ColumnOp::Ne(operand.clone()),
            other => bail!("unknown operator {other:?} for data.{column}"),
        };
        ops.push(parsed);
    }
    Ok(ops)
}

fn parse_list(key: &str, operand: &serde_json::Value) -> Result<Vec<Predicate>> {
    operand
        .as_array()
        .with_context(|| format!("{key} must hold a list of predicates"))?
        .iter()
        .map(Predicate::from_json)
        .collect()
}

impl Predicate {
    pub fn from_json(spec: &serde_json::Value) -> Result<Predicate> {
        let object = spec
            .as_object()
            .with_context(|| format!("predicate must be an object, got {spec}"))?;

        let mut parts = Vec::with_capacity(object.len());
        for (key, operand) in object {
            let part = match key.as_str() {
                "$and" => Predicate::And(parse_list(key, operand)?),
                "$or" => Predicate::Or(parse_list(key, operand)?),
                _ => {
                    let column = key
                        .strip_prefix("data.")
                        .with_context(|| format!("unknown filter key: {key:?}"))?;
                    Predicate::Column {
                        column: column.to_string(),
                        ops: parse_column_ops(column, operand)?,
                    }
                }
            };
            parts.push(part);
        }

        // Several keys in one object conjoin.
        if parts.len() == 1 {
            Ok(parts.into_iter().next().unwrap())
        } else {
            Ok(Predicate::And(parts))
        }
    }

    /// True when the row should be kept.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Predicate::And(parts) => parts.iter().all(|p| p.matches(row)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(row)),
            Predicate::Column { column, ops } => {
                let value = row.get(column).unwrap_or(&Value::Null);
                ops.iter().all(|op| op.matches(value))
            }
        }
    }
}

impl ColumnOp {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ColumnOp::In(items) => items.iter().any(|item| equals(value, item)),
            ColumnOp::NotIn(items) => !items.iter().any(|item| equals(value, item)),
            ColumnOp::Eq(operand) => equals(value, operand),
            ColumnOp::Ne(operand) => !equals(value, operand),
            ColumnOp::Lt(operand) => {
                matches!(compare(value, operand), Some(Ordering::Less))
            }
            ColumnOp::Lte(operand) => {
                matches!(compare(value, operand), Some(Ordering::Less | Ordering::Equal))
            }
            ColumnOp::Gt(operand) => {
                matches!(compare(value, operand), Some(Ordering::Greater))
            }
            ColumnOp::Gte(operand) => matches!(
                compare(value, operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Timestamp(ts) => Some(ts.timestamp() as f64),
        _ => None,
    }
}

/// Ordering between a row value and a JSON operand, when the types admit one.
fn compare(value: &Value, operand: &serde_json::Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (numeric(value), operand.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Value::Text(a), Some(b)) = (value, operand.as_str()) {
        return Some(a.as_str().cmp(b));
    }
    None
}

fn equals(value: &Value, operand: &serde_json::Value) -> bool {
    match (value, operand) {
        (Value::Null, serde_json::Value::Null) => true,
        (Value::Bool(a), serde_json::Value::Bool(b)) => a == b,
        _ => matches!(compare(value, operand), Some(Ordering::Equal)),
    }
}

/// All predicates from a filter file, keyed by `"{schema}.{table}"`.
pub struct FilterSet {
    by_table: HashMap<String, Arc<Predicate>>,
}

impl FilterSet {
    pub fn empty() -> Self {
        Self {
            by_table: HashMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading filter file {}", path.display()))?;
        let parsed: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("parsing filter file {}", path.display()))?;
        let object = parsed
            .as_object()
            .context("filter file must be an object keyed by \"schema.table\"")?;

        let mut by_table = HashMap::with_capacity(object.len());
        for (key, spec) in object {
            let predicate = Predicate::from_json(spec)
                .with_context(|| format!("parsing filter for {key}"))?;
            by_table.insert(key.clone(), Arc::new(predicate));
        }
        Ok(Self { by_table })
    }

    pub fn for_table(&self, schema: &str, table: &str) -> Option<Arc<Predicate>> {
        self.by_table.get(&format!("{schema}.{table}")).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(fid: i64, text: &str) -> Row {
        Row::from([
            ("fid".to_string(), Value::Int(fid)),
            ("text".to_string(), Value::Text(text.to_string())),
        ])
    }

    fn predicate(spec: serde_json::Value) -> Predicate {
        Predicate::from_json(&spec).unwrap()
    }

    #[test]
    fn test_in_and_nin() {
        let keep = predicate(json!({"data.fid": {"$in": [1, 2, 3]}}));
        assert!(keep.matches(&row(2, "x")));
        assert!(!keep.matches(&row(9, "x")));

        let drop = predicate(json!({"data.fid": {"$nin": [1, 2, 3]}}));
        assert!(!drop.matches(&row(2, "x")));
        assert!(drop.matches(&row(9, "x")));
    }

    #[test]
    fn test_range_operators() {
        let p = predicate(json!({"data.fid": {"$gte": 10, "$lt": 20}}));
        assert!(!p.matches(&row(9, "x")));
        assert!(p.matches(&row(10, "x")));
        assert!(p.matches(&row(19, "x")));
        assert!(!p.matches(&row(20, "x")));
    }

    #[test]
    fn test_eq_ne_on_strings() {
        let p = predicate(json!({"data.text": {"$eq": "hello"}}));
        assert!(p.matches(&row(1, "hello")));
        assert!(!p.matches(&row(1, "other")));

        let p = predicate(json!({"data.text": {"$ne": "hello"}}));
        assert!(!p.matches(&row(1, "hello")));
        assert!(p.matches(&row(1, "other")));
    }

    #[test]
    fn test_and_or_nesting() {
        let p = predicate(json!({
            "$or": [
                {"data.fid": {"$eq": 1}},
                {"$and": [
                    {"data.fid": {"$gt": 100}},
                    {"data.text": {"$eq": "keep"}},
                ]},
            ]
        }));
        assert!(p.matches(&row(1, "anything")));
        assert!(p.matches(&row(101, "keep")));
        assert!(!p.matches(&row(101, "drop")));
        assert!(!p.matches(&row(50, "keep")));
    }

    #[test]
    fn test_multiple_keys_conjoin() {
        let p = predicate(json!({
            "data.fid": {"$gt": 0},
            "data.text": {"$eq": "keep"},
        }));
        assert!(p.matches(&row(1, "keep")));
        assert!(!p.matches(&row(1, "drop")));
        assert!(!p.matches(&row(-1, "keep")));
    }

    #[test]
    fn test_missing_column_is_null() {
        let p = predicate(json!({"data.absent": {"$eq": null}}));
        assert!(p.matches(&row(1, "x")));

        let p = predicate(json!({"data.absent": {"$gt": 5}}));
        assert!(!p.matches(&row(1, "x")));
    }

    #[test]
    fn test_timestamp_compares_as_epoch_seconds() {
        let mut r = row(1, "x");
        r.insert(
            "updated_at".to_string(),
            Value::Timestamp(chrono::DateTime::from_timestamp(1_000, 0).unwrap()),
        );
        let p = predicate(json!({"data.updated_at": {"$gte": 500, "$lt": 2_000}}));
        assert!(p.matches(&r));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Predicate::from_json(&json!({"$xor": []})).is_err());
        assert!(Predicate::from_json(&json!({"data.x": {"$regex": "a"}})).is_err());
    }

    #[test]
    fn test_filter_set_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filters.json");
        std::fs::write(
            &path,
            r#"{"farcaster.casts": {"data.fid": {"$in": [1]}}}"#,
        )
        .unwrap();

        let set = FilterSet::load(&path).unwrap();
        assert!(set.for_table("farcaster", "casts").is_some());
        assert!(set.for_table("farcaster", "reactions").is_none());
        assert!(FilterSet::empty().for_table("farcaster", "casts").is_none());
    }
}
