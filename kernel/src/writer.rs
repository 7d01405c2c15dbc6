//! Stages data files for a commit: groups rows by partition, transposes
//! them through the Parquet bridge, collects zone-map statistics, and
//! returns the `Add` actions the commit pipeline will reference.
//!
//! Staged files only become live once a commit references them; until then
//! they are invisible garbage the pipeline deletes on failure.

use std::collections::HashMap;

use chrono::Utc;
use indexmap::IndexMap;
use rand::Rng;
use serde_json::Value;
use tracing::debug;

use crate::actions::{Add, Stats};
use crate::error::{DlResult, Error};
use crate::parquet;
use crate::path::data_file_path;
use crate::schema::{value_type, DataType, Row, Schema};
use crate::storage::StorageBackend;
use crate::Version;

#[derive(Debug, Clone)]
pub(crate) struct WriteOptions {
    pub target_file_size: u64,
    pub statistics: bool,
    pub partition_columns: Vec<String>,
    pub data_change: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            target_file_size: 128 * 1024 * 1024,
            statistics: true,
            partition_columns: vec![],
            data_change: true,
        }
    }
}

/// Write `rows` as one or more staged parts named for `commit_version`.
/// Returns the Adds in write order.
pub(crate) async fn write_data_files(
    storage: &dyn StorageBackend,
    commit_version: Version,
    schema: &Schema,
    rows: &[Row],
    opts: &WriteOptions,
) -> DlResult<Vec<Add>> {
    if rows.is_empty() {
        return Err(Error::validation("refusing to write an empty batch"));
    }
    // Concurrent writers staging for the same target version must not clash
    // on names; the sequence starts at a random base.
    let mut seq: usize = rand::thread_rng().gen_range(0..1_000_000) * 1000;
    let mut adds = Vec::new();
    for (partition_values, group) in partition_rows(rows, &opts.partition_columns) {
        let chunks = chunk_rows(schema, &group, opts.target_file_size)?;
        for chunk in chunks {
            let bytes = parquet::encode_rows(schema, chunk)?;
            let path = data_file_path(commit_version, seq);
            seq += 1;
            storage.write(&path, bytes.clone()).await?;
            let stats = opts
                .statistics
                .then(|| collect_stats(schema, chunk))
                .map(|s| serde_json::to_string(&s))
                .transpose()?;
            debug!(path = %path, rows = chunk.len(), size = bytes.len(), "staged data file");
            adds.push(Add {
                path: path.as_ref().to_string(),
                partition_values: partition_values.clone(),
                size: bytes.len() as i64,
                modification_time: Utc::now().timestamp_millis(),
                data_change: opts.data_change,
                stats,
            });
        }
    }
    Ok(adds)
}

/// Group rows by their partition-column values, preserving first-seen
/// group order and row order within groups. No partition columns means a
/// single anonymous group.
fn partition_rows<'a>(
    rows: &'a [Row],
    partition_columns: &[String],
) -> Vec<(HashMap<String, Option<String>>, Vec<&'a Row>)> {
    if partition_columns.is_empty() {
        return vec![(HashMap::new(), rows.iter().collect())];
    }
    let mut groups: IndexMap<Vec<Option<String>>, Vec<&Row>> = IndexMap::new();
    for row in rows {
        let key: Vec<Option<String>> = partition_columns
            .iter()
            .map(|col| row.get(col).and_then(partition_value))
            .collect();
        groups.entry(key).or_default().push(row);
    }
    groups
        .into_iter()
        .map(|(key, group)| {
            let values = partition_columns
                .iter()
                .cloned()
                .zip(key)
                .collect::<HashMap<_, _>>();
            (values, group)
        })
        .collect()
}

fn partition_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Split rows into chunks targeting `target_file_size` bytes each, using a
/// bytes-per-row estimate from an encoded sample.
fn chunk_rows<'a>(
    schema: &Schema,
    rows: &'a [&'a Row],
    target_file_size: u64,
) -> DlResult<Vec<&'a [&'a Row]>> {
    const SAMPLE: usize = 256;
    if rows.len() <= 1 {
        return Ok(vec![rows]);
    }
    let sample = &rows[..rows.len().min(SAMPLE)];
    let sample_bytes = parquet::encode_rows(schema, sample)?.len();
    let bytes_per_row = (sample_bytes / sample.len()).max(1);
    let rows_per_file = ((target_file_size as usize) / bytes_per_row).max(1);
    Ok(rows.chunks(rows_per_file).collect())
}

/// Per-column min/max/null-count over the top-level primitive columns.
pub(crate) fn collect_stats(schema: &Schema, rows: &[&Row]) -> Stats {
    let mut stats = Stats {
        num_records: rows.len() as u64,
        ..Default::default()
    };
    for field in &schema.fields {
        let mut nulls = 0u64;
        let mut min: Option<Value> = None;
        let mut max: Option<Value> = None;
        let comparable = matches!(
            field.data_type,
            DataType::Long | DataType::Double | DataType::String | DataType::Boolean
        );
        for row in rows {
            let value = row.get(&field.name);
            match value {
                None | Some(Value::Null) => nulls += 1,
                Some(v) => {
                    if comparable && value_type(v).is_some() {
                        if min.as_ref().map_or(true, |m| value_lt(v, m)) {
                            min = Some(v.clone());
                        }
                        if max.as_ref().map_or(true, |m| value_lt(m, v)) {
                            max = Some(v.clone());
                        }
                    }
                }
            }
        }
        stats.null_count.insert(field.name.clone(), nulls);
        if let Some(min) = min {
            stats.min_values.insert(field.name.clone(), min);
        }
        if let Some(max) = max {
            stats.max_values.insert(field.name.clone(), max);
        }
    }
    stats
}

/// Total order over comparable scalar JSON values: numbers by magnitude,
/// strings lexicographically, booleans false-before-true. Cross-type pairs
/// compare false both ways and leave the running bound alone.
pub(crate) fn value_lt(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x < y,
            _ => false,
        },
        (Value::String(x), Value::String(y)) => x < y,
        (Value::Bool(x), Value::Bool(y)) => !*x && *y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::in_memory;
    use serde_json::json;

    fn to_rows(values: Vec<Value>) -> Vec<Row> {
        values
            .into_iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    #[tokio::test]
    async fn stages_one_file_with_stats() {
        let storage = in_memory();
        let rows = to_rows(vec![
            json!({"id": "1", "value": 100}),
            json!({"id": "2", "value": 300}),
            json!({"id": "3", "value": null}),
        ]);
        let schema = Schema::infer(&rows).unwrap();
        let adds = write_data_files(
            storage.as_ref(),
            1,
            &schema,
            &rows,
            &WriteOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(adds.len(), 1);
        let add = &adds[0];
        assert!(add.path.starts_with("part-00000000000000000001-"));
        assert!(add.data_change);
        let stats = add.parsed_stats().unwrap();
        assert_eq!(stats.num_records, 3);
        assert_eq!(stats.min_values["value"], json!(100));
        assert_eq!(stats.max_values["value"], json!(300));
        assert_eq!(stats.null_count["value"], 1);
        assert_eq!(stats.null_count["id"], 0);

        let listed = storage.list(None).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn partitions_split_files() {
        let storage = in_memory();
        let rows = to_rows(vec![
            json!({"region": "eu", "v": 1}),
            json!({"region": "us", "v": 2}),
            json!({"region": "eu", "v": 3}),
        ]);
        let schema = Schema::infer(&rows).unwrap();
        let opts = WriteOptions {
            partition_columns: vec!["region".to_string()],
            ..Default::default()
        };
        let adds = write_data_files(storage.as_ref(), 2, &schema, &rows, &opts)
            .await
            .unwrap();
        assert_eq!(adds.len(), 2);
        let eu = adds
            .iter()
            .find(|a| a.partition_values.get("region") == Some(&Some("eu".to_string())))
            .unwrap();
        let stats = eu.parsed_stats().unwrap();
        assert_eq!(stats.num_records, 2);
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let storage = in_memory();
        let schema = Schema::empty();
        let err = write_data_files(
            storage.as_ref(),
            1,
            &schema,
            &[],
            &WriteOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn small_target_chunks_rows() {
        let rows = to_rows((0..100).map(|i| json!({"i": i, "pad": "x".repeat(50)})).collect());
        let schema = Schema::infer(&rows).unwrap();
        let refs: Vec<&Row> = rows.iter().collect();
        let chunks = chunk_rows(&schema, &refs, 64).unwrap();
        assert!(chunks.len() > 1);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 100);
    }
}
