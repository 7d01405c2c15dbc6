//! Table schemas for JSON document rows: a flat list of typed, nullable
//! top-level columns. Nested objects and arrays live in a `json` column;
//! everything else maps to a primitive Parquet type.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DlResult, Error};

/// A row is one JSON document. `serde_json` is built with `preserve_order`,
/// so column order follows first-seen key order.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Long,
    Double,
    String,
    Binary,
    Json,
}

impl DataType {
    /// The narrowest type that can hold both. Mixed primitives fall back to
    /// `String` (longs render as decimal strings); anything stranger
    /// becomes `Json`.
    pub(crate) fn unify(self, other: DataType) -> DataType {
        use DataType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Long, Double) | (Double, Long) => Double,
            (String, Long) | (Long, String) => String,
            (String, Double) | (Double, String) => String,
            (Json, _) | (_, Json) => Json,
            _ => Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

fn struct_kind() -> String {
    "struct".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type", default = "struct_kind")]
    kind: String,
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            kind: struct_kind(),
            fields,
        }
    }

    pub fn empty() -> Self {
        Self::new(vec![])
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Infer a schema from a batch of rows. Column order is first-seen key
    /// order; a column absent from any row (or ever null) is nullable.
    pub fn infer<R: std::borrow::Borrow<Row>>(rows: &[R]) -> DlResult<Schema> {
        if rows.is_empty() {
            return Err(Error::validation("cannot infer a schema from zero rows"));
        }
        let mut columns: IndexMap<String, (Option<DataType>, bool)> = IndexMap::new();
        for row in rows {
            for (key, value) in row.borrow() {
                let entry = columns.entry(key.clone()).or_insert((None, false));
                match value_type(value) {
                    Some(dt) => {
                        entry.0 = Some(match entry.0 {
                            Some(existing) => existing.unify(dt),
                            None => dt,
                        });
                    }
                    None => entry.1 = true,
                }
            }
        }
        for row in rows {
            for (name, entry) in columns.iter_mut() {
                if !row.borrow().contains_key(name) {
                    entry.1 = true;
                }
            }
        }
        let fields = columns
            .into_iter()
            .map(|(name, (dt, nullable))| Field::new(name, dt.unwrap_or(DataType::Json), nullable))
            .collect();
        Ok(Schema::new(fields))
    }

    /// Check an incoming batch schema against this one and produce the
    /// schema to write with. Nullable widening is always allowed; new
    /// columns append (as nullable) only when `allow_new_columns` is set;
    /// type changes are rejected, though a batch narrower than the column
    /// (longs into a double/string column) coerces up.
    pub fn merge(&self, incoming: &Schema, allow_new_columns: bool) -> DlResult<Schema> {
        let mut fields = self.fields.clone();
        for field in &mut fields {
            match incoming.field(&field.name) {
                Some(new_field) => {
                    let unified = field.data_type.unify(new_field.data_type);
                    if unified != field.data_type {
                        return Err(Error::validation(format!(
                            "column `{}` changed type from {:?} to {:?}",
                            field.name, field.data_type, new_field.data_type
                        )));
                    }
                    field.nullable = field.nullable || new_field.nullable;
                }
                // Missing from the batch: its values will be null.
                None => field.nullable = true,
            }
        }
        for new_field in &incoming.fields {
            if self.field(&new_field.name).is_none() {
                if !allow_new_columns {
                    return Err(Error::validation(format!(
                        "column `{}` is not in the table schema (schema evolution is disabled)",
                        new_field.name
                    )));
                }
                let mut appended = new_field.clone();
                appended.nullable = true;
                fields.push(appended);
            }
        }
        Ok(Schema::new(fields))
    }
}

/// Classify one JSON value; `None` for null.
pub(crate) fn value_type(value: &Value) -> Option<DataType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(DataType::Boolean),
        Value::Number(n) => {
            if n.as_i64().is_some() {
                Some(DataType::Long)
            } else if n.as_u64().is_some() {
                // Too big for i64: rides as a decimal string.
                Some(DataType::String)
            } else {
                Some(DataType::Double)
            }
        }
        Value::String(_) => Some(DataType::String),
        Value::Array(_) | Value::Object(_) => Some(DataType::Json),
    }
}
