//! MongoDB-style row filters. A filter document is a top-level AND of field
//! predicates; per-field operators are `$eq`, `$ne`, `$gt`, `$gte`, `$lt`,
//! `$lte`, `$in`, `$nin`, `$exists`, `$regex`, with `$and` / `$or` / `$not`
//! for combination. Fields absent from a row compare false.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::Value;

use crate::error::{DlResult, Error};
use crate::schema::Row;

#[derive(Debug, Clone)]
pub(crate) enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
    Field { path: Vec<String>, ops: Vec<Op> },
}

#[derive(Debug, Clone)]
pub(crate) enum Op {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Regex),
    Not(Vec<Op>),
}

/// A validated, compiled filter. Construction fails on unknown operators or
/// malformed documents; matching never fails.
#[derive(Debug, Clone)]
pub struct Filter {
    root: Option<Node>,
}

impl Filter {
    /// Compile a filter document. `{}` (or `Value::Null`) matches all rows.
    pub fn new(document: Value) -> DlResult<Self> {
        match document {
            Value::Null => Ok(Self { root: None }),
            Value::Object(map) if map.is_empty() => Ok(Self { root: None }),
            Value::Object(map) => Ok(Self {
                root: Some(compile_object(map)?),
            }),
            other => Err(Error::validation(format!(
                "filter must be an object, got {other}"
            ))),
        }
    }

    /// The match-everything filter.
    pub fn all() -> Self {
        Self { root: None }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match &self.root {
            None => true,
            Some(node) => eval(node, row),
        }
    }

    pub(crate) fn root(&self) -> Option<&Node> {
        self.root.as_ref()
    }
}

impl TryFrom<Value> for Filter {
    type Error = Error;

    fn try_from(value: Value) -> DlResult<Self> {
        Self::new(value)
    }
}

fn compile_object(map: serde_json::Map<String, Value>) -> DlResult<Node> {
    let mut children = Vec::with_capacity(map.len());
    for (key, value) in map {
        children.push(compile_entry(&key, value)?);
    }
    Ok(match children.len() {
        1 => children.into_iter().next().unwrap_or(Node::And(vec![])),
        _ => Node::And(children),
    })
}

fn compile_entry(key: &str, value: Value) -> DlResult<Node> {
    match key {
        "$and" | "$or" => {
            let Value::Array(items) = value else {
                return Err(Error::validation(format!("{key} expects an array")));
            };
            let nodes = items
                .into_iter()
                .map(|item| match item {
                    Value::Object(map) => compile_object(map),
                    other => Err(Error::validation(format!(
                        "{key} expects objects, got {other}"
                    ))),
                })
                .collect::<DlResult<Vec<_>>>()?;
            Ok(if key == "$and" {
                Node::And(nodes)
            } else {
                Node::Or(nodes)
            })
        }
        "$not" => {
            let Value::Object(map) = value else {
                return Err(Error::validation("$not expects an object"));
            };
            Ok(Node::Not(Box::new(compile_object(map)?)))
        }
        _ if key.starts_with('$') => Err(Error::validation(format!("unknown operator {key}"))),
        field => {
            let path: Vec<String> = field.split('.').map(str::to_string).collect();
            let ops = compile_predicate(value)?;
            Ok(Node::Field { path, ops })
        }
    }
}

/// An object whose keys all start with `$` is an operator set; anything
/// else is shorthand for `$eq`.
fn compile_predicate(value: Value) -> DlResult<Vec<Op>> {
    match value {
        Value::Object(map)
            if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) =>
        {
            map.into_iter().map(|(op, arg)| compile_op(&op, arg)).collect()
        }
        other => Ok(vec![Op::Eq(other)]),
    }
}

fn compile_op(op: &str, arg: Value) -> DlResult<Op> {
    Ok(match op {
        "$eq" => Op::Eq(arg),
        "$ne" => Op::Ne(arg),
        "$gt" => Op::Gt(arg),
        "$gte" => Op::Gte(arg),
        "$lt" => Op::Lt(arg),
        "$lte" => Op::Lte(arg),
        "$in" => match arg {
            Value::Array(items) => Op::In(items),
            _ => return Err(Error::validation("$in expects an array")),
        },
        "$nin" => match arg {
            Value::Array(items) => Op::Nin(items),
            _ => return Err(Error::validation("$nin expects an array")),
        },
        "$exists" => match arg {
            Value::Bool(b) => Op::Exists(b),
            _ => return Err(Error::validation("$exists expects a boolean")),
        },
        "$regex" => match arg {
            Value::String(pattern) => Op::Regex(
                Regex::new(&pattern)
                    .map_err(|e| Error::validation(format!("bad $regex: {e}")))?,
            ),
            _ => return Err(Error::validation("$regex expects a string")),
        },
        "$not" => match arg {
            Value::Object(map) => Op::Not(compile_predicate(Value::Object(map))?),
            _ => return Err(Error::validation("field-level $not expects an object")),
        },
        other => return Err(Error::validation(format!("unknown operator {other}"))),
    })
}

fn eval(node: &Node, row: &Row) -> bool {
    match node {
        Node::And(children) => children.iter().all(|c| eval(c, row)),
        Node::Or(children) => children.iter().any(|c| eval(c, row)),
        Node::Not(child) => !eval(child, row),
        Node::Field { path, ops } => {
            let value = lookup(row, path);
            ops.iter().all(|op| eval_op(op, value))
        }
    }
}

/// Resolve a dot path against a row; numeric segments index into arrays.
fn lookup<'a>(row: &'a Row, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = row.get(first)?;
    for segment in rest {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn eval_op(op: &Op, value: Option<&Value>) -> bool {
    match op {
        Op::Exists(expected) => value.is_some() == *expected,
        Op::Eq(target) => value.map_or(false, |v| values_equal(v, target)),
        Op::Ne(target) => value.map_or(false, |v| !values_equal(v, target)),
        Op::Gt(target) => cmp_is(value, target, |o| o == Ordering::Greater),
        Op::Gte(target) => cmp_is(value, target, |o| o != Ordering::Less),
        Op::Lt(target) => cmp_is(value, target, |o| o == Ordering::Less),
        Op::Lte(target) => cmp_is(value, target, |o| o != Ordering::Greater),
        Op::In(items) => value.map_or(false, |v| items.iter().any(|i| values_equal(v, i))),
        Op::Nin(items) => value.map_or(false, |v| !items.iter().any(|i| values_equal(v, i))),
        Op::Regex(regex) => match value {
            Some(Value::String(s)) => regex.is_match(s),
            _ => false,
        },
        Op::Not(ops) => value.is_some() && !ops.iter().all(|inner| eval_op(inner, value)),
    }
}

fn cmp_is(value: Option<&Value>, target: &Value, check: impl Fn(Ordering) -> bool) -> bool {
    match value.and_then(|v| compare_values(v, target)) {
        Some(ordering) => check(ordering),
        None => false,
    }
}

/// Equality with numeric cross-kind tolerance (`1 == 1.0`); everything else
/// is deep JSON equality.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Scalar ordering; `None` for cross-type or non-scalar pairs, which makes
/// every range operator compare false.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
