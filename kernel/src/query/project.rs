//! Projections: the array form `["a", "b"]` includes listed fields; the
//! object form includes (`{a: 1}`) or excludes (`{c: 0}`). Dot paths reach
//! nested fields. Include and exclude cannot mix.

use serde_json::Value;

use crate::error::{DlResult, Error};
use crate::schema::Row;

#[derive(Debug, Clone)]
pub enum Projection {
    All,
    Include(Vec<Vec<String>>),
    Exclude(Vec<Vec<String>>),
}

fn split_path(path: &str) -> DlResult<Vec<String>> {
    if path.is_empty() {
        return Err(Error::validation("projection field name is empty"));
    }
    Ok(path.split('.').map(str::to_string).collect())
}

impl Projection {
    pub fn from_value(value: &Value) -> DlResult<Self> {
        match value {
            Value::Null => Ok(Self::All),
            Value::Array(items) => {
                let paths = items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => split_path(s),
                        other => Err(Error::validation(format!(
                            "projection array expects strings, got {other}"
                        ))),
                    })
                    .collect::<DlResult<Vec<_>>>()?;
                Ok(Self::Include(paths))
            }
            Value::Object(map) => {
                if map.is_empty() {
                    return Ok(Self::All);
                }
                let mut includes = Vec::new();
                let mut excludes = Vec::new();
                for (key, flag) in map {
                    let included = match flag {
                        Value::Bool(b) => *b,
                        Value::Number(n) => n.as_f64() != Some(0.0),
                        other => {
                            return Err(Error::validation(format!(
                                "projection flag for `{key}` must be 0/1 or boolean, got {other}"
                            )))
                        }
                    };
                    if included {
                        includes.push(split_path(key)?);
                    } else {
                        excludes.push(split_path(key)?);
                    }
                }
                match (includes.is_empty(), excludes.is_empty()) {
                    (false, true) => Ok(Self::Include(includes)),
                    (true, false) => Ok(Self::Exclude(excludes)),
                    _ => Err(Error::validation(
                        "projection cannot mix include and exclude fields",
                    )),
                }
            }
            other => Err(Error::validation(format!(
                "projection must be an array or object, got {other}"
            ))),
        }
    }

    pub fn apply(&self, row: &Row) -> Row {
        match self {
            Self::All => row.clone(),
            Self::Include(paths) => {
                let mut out = Row::new();
                for path in paths {
                    if let Some(value) = get_path(row, path) {
                        insert_path(&mut out, path, value.clone());
                    }
                }
                out
            }
            Self::Exclude(paths) => {
                let mut out = row.clone();
                for path in paths {
                    remove_path(&mut out, path);
                }
                out
            }
        }
    }
}

fn get_path<'a>(row: &'a Row, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = row.get(first)?;
    for segment in rest {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn insert_path(row: &mut Row, path: &[String], value: Value) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    if rest.is_empty() {
        row.insert(first.clone(), value);
        return;
    }
    let entry = row
        .entry(first.clone())
        .or_insert_with(|| Value::Object(Default::default()));
    if let Value::Object(map) = entry {
        insert_path(map, rest, value);
    }
}

fn remove_path(row: &mut Row, path: &[String]) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    if rest.is_empty() {
        row.remove(first);
        return;
    }
    if let Some(Value::Object(map)) = row.get_mut(first) {
        remove_path(map, rest);
    }
}
