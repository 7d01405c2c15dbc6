//! A number of utilities useful for testing that we want to use in multiple crates

use doclake::schema::Row;
use doclake::{EngineConfig, Table};
use serde_json::{json, Value};

/// A fresh table on an anonymous in-memory store.
pub fn memory_table() -> Table {
    Table::from_storage(doclake::storage::in_memory(), EngineConfig::new())
}

/// A table location on a process-shared named memory store, so several
/// handles can race against the same log. The name is randomized per call.
pub fn shared_memory_location() -> String {
    format!("memory://test-{}", uuid::Uuid::new_v4())
}

pub fn open_shared(location: &str) -> Table {
    Table::open(location).expect("open shared memory table")
}

/// Convert `json!` objects into rows, panicking on non-objects.
pub fn rows(values: Vec<Value>) -> Vec<Row> {
    values
        .into_iter()
        .map(|v| v.as_object().expect("row must be an object").clone())
        .collect()
}

/// `count` rows of the shape `{id, value, pad}`; `pad` inflates the row to
/// roughly `pad_len` bytes so size-driven maintenance has something to bite
/// on.
pub fn sized_batch(start_id: usize, count: usize, pad_len: usize) -> Vec<Row> {
    rows(
        (start_id..start_id + count)
            .map(|i| {
                json!({
                    "id": i.to_string(),
                    "value": (i * 10) as i64,
                    "pad": "x".repeat(pad_len),
                })
            })
            .collect(),
    )
}

/// Pull a named column out of a result set for compact assertions.
pub fn column(rows: &[Row], name: &str) -> Vec<Value> {
    rows.iter()
        .map(|r| r.get(name).cloned().unwrap_or(Value::Null))
        .collect()
}
