//! Z-order clustering: map each clustering column to a normalized integer,
//! interleave the bits into a Morton code per row, stable-sort by code, and
//! rewrite the table in that order so correlated rows land in the same
//! files.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde_json::Value;
use tracing::info;

use crate::actions::{Action, Remove};
use crate::error::{DlResult, Error};
use crate::schema::Row;
use crate::table::Table;
use crate::transaction::{CommitResult, PreparedCommit};
use crate::writer::{write_data_files, WriteOptions};

/// Bits of resolution per dimension.
const DIM_BITS: u32 = 21;
const DIM_MAX: u64 = (1 << DIM_BITS) - 1;

#[derive(Debug, Clone, Default)]
pub struct ZOrderOptions {
    pub columns: Vec<String>,
    /// Defaults to the engine's `compaction.target_file_size`.
    pub target_file_size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZOrderMetrics {
    pub files_before: usize,
    pub files_created: usize,
    pub rows: usize,
    /// Zone widths of the Morton-code range across 10 equal post-sort
    /// slices, normalized to `[0, 1]`.
    pub avg_zone_width: f64,
    pub min_zone_width: f64,
    pub max_zone_width: f64,
    /// Rough predicate-skip estimate, clamped to `[0.31, 0.9]`.
    pub estimated_skip_rate: f64,
    pub elapsed_ms: u64,
    pub commit: Option<CommitResult>,
}

fn djb2(s: &str) -> u32 {
    let mut hash: u32 = 5381;
    for byte in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
    }
    hash
}

/// Observed bounds for one clustering column.
#[derive(Debug, Clone, Copy, Default)]
struct ColumnBounds {
    min: f64,
    max: f64,
}

/// A column value as a point on the normalization axis: numbers as
/// themselves, date strings as epoch millis, other strings via DJB2.
fn axis_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(dt) => Some(dt.timestamp_millis() as f64),
            Err(_) => Some(djb2(s) as f64),
        },
        _ => None,
    }
}

fn scale(value: f64, bounds: ColumnBounds) -> u64 {
    if bounds.max <= bounds.min {
        return 0;
    }
    let normalized = ((value - bounds.min) / (bounds.max - bounds.min)).clamp(0.0, 1.0);
    (normalized * DIM_MAX as f64) as u64
}

/// Interleave one `DIM_BITS`-bit coordinate per dimension into a Morton
/// code: bit `i` of dimension `d` lands at position `i * dims + d`.
fn morton_code(coords: &[u64]) -> u128 {
    let dims = coords.len() as u32;
    let mut code: u128 = 0;
    for bit in 0..DIM_BITS {
        for (dim, coord) in coords.iter().enumerate() {
            if coord >> bit & 1 == 1 {
                code |= 1u128 << (bit * dims + dim as u32);
            }
        }
    }
    code
}

fn code_for_row(row: &Row, columns: &[String], bounds: &HashMap<String, ColumnBounds>) -> u128 {
    let coords: Vec<u64> = columns
        .iter()
        .map(|col| {
            let value = row.get(col).and_then(axis_value).unwrap_or(0.0);
            scale(value, bounds.get(col).copied().unwrap_or_default())
        })
        .collect();
    morton_code(&coords)
}

fn zone_stats(codes: &[u128], dims: u32) -> (f64, f64, f64, f64) {
    const SLICES: usize = 10;
    let span = (1u128 << (DIM_BITS * dims).min(126)) as f64;
    if codes.is_empty() {
        return (0.0, 0.0, 0.0, 0.31);
    }
    let slice_len = codes.len().div_ceil(SLICES);
    let mut widths = Vec::new();
    for slice in codes.chunks(slice_len) {
        let min = slice.iter().min().copied().unwrap_or(0);
        let max = slice.iter().max().copied().unwrap_or(0);
        widths.push((max - min) as f64 / span);
    }
    let avg = widths.iter().sum::<f64>() / widths.len() as f64;
    let min = widths.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = widths.iter().cloned().fold(0.0f64, f64::max);
    let skip = (1.0 - avg).clamp(0.31, 0.9);
    (avg, min, max, skip)
}

impl Table {
    /// Rewrite the table clustered on `options.columns`.
    pub async fn zorder(&self, options: ZOrderOptions) -> DlResult<ZOrderMetrics> {
        if options.columns.is_empty() {
            return Err(Error::validation("z-order needs at least one column"));
        }
        if options.columns.len() as u32 * DIM_BITS > 126 {
            return Err(Error::validation("too many z-order columns (max 6)"));
        }
        let started = Instant::now();
        let target = options
            .target_file_size
            .unwrap_or(self.config().compaction.target_file_size);
        let columns = Arc::new(options.columns);
        let shared = Arc::new(Mutex::new(ZOrderMetrics::default()));

        let build_columns = columns.clone();
        let build_metrics = shared.clone();
        let result = self
            .commit_with_retry(Box::new(move |snapshot| {
                let columns = build_columns.clone();
                let shared = build_metrics.clone();
                Box::pin(async move {
                    let snapshot = snapshot.ok_or_else(|| {
                        Error::not_found("cannot cluster a table that does not exist")
                    })?;
                    let schema = snapshot.schema()?;
                    let partition_columns = snapshot.metadata().partition_columns.clone();
                    let next_version = snapshot.version() + 1;
                    let now = Utc::now().timestamp_millis();

                    let mut rows: Vec<Row> = Vec::new();
                    let sources: Vec<_> = snapshot.files().cloned().collect();
                    for add in &sources {
                        rows.extend(self.read_file_rows(&add.path).await?);
                    }

                    // Observed bounds per clustering column.
                    let mut bounds: HashMap<String, ColumnBounds> = HashMap::new();
                    for col in columns.iter() {
                        let observed = rows
                            .iter()
                            .filter_map(|row| row.get(col).and_then(axis_value))
                            .minmax_by(|a, b| a.total_cmp(b));
                        if let Some((min, max)) = observed.into_option() {
                            bounds.insert(col.clone(), ColumnBounds { min, max });
                        }
                    }

                    let mut keyed: Vec<(u128, Row)> = rows
                        .into_iter()
                        .map(|row| (code_for_row(&row, &columns, &bounds), row))
                        .collect();
                    keyed.sort_by_key(|(code, _)| *code);
                    let codes: Vec<u128> = keyed.iter().map(|(code, _)| *code).collect();
                    let sorted_rows: Vec<Row> =
                        keyed.into_iter().map(|(_, row)| row).collect();

                    let (avg, min, max, skip) =
                        zone_stats(&codes, columns.len() as u32);
                    let mut metrics = ZOrderMetrics {
                        files_before: sources.len(),
                        rows: sorted_rows.len(),
                        avg_zone_width: avg,
                        min_zone_width: min,
                        max_zone_width: max,
                        estimated_skip_rate: skip,
                        ..Default::default()
                    };

                    if sorted_rows.is_empty() {
                        if let Ok(mut slot) = shared.lock() {
                            *slot = metrics;
                        }
                        return Ok(PreparedCommit {
                            operation: "ZORDER".to_string(),
                            parameters: HashMap::new(),
                            actions: vec![],
                            staged: vec![],
                            changes: vec![],
                            read_version: Some(snapshot.version()),
                            txn: None,
                        });
                    }

                    let write_options = WriteOptions {
                        target_file_size: target,
                        statistics: self.config().statistics,
                        partition_columns,
                        data_change: false,
                    };
                    let adds = write_data_files(
                        self.storage(),
                        next_version,
                        &schema,
                        &sorted_rows,
                        &write_options,
                    )
                    .await?;
                    metrics.files_created = adds.len();
                    if let Ok(mut slot) = shared.lock() {
                        *slot = metrics;
                    }

                    let staged = adds
                        .iter()
                        .map(|a| object_store::path::Path::from(a.path.as_str()))
                        .collect();
                    let mut actions: Vec<Action> = sources
                        .iter()
                        .map(|f| Action::Remove(Remove::for_add(f, now, false)))
                        .collect();
                    actions.extend(adds.into_iter().map(Action::Add));

                    Ok(PreparedCommit {
                        operation: "ZORDER".to_string(),
                        parameters: HashMap::from([(
                            "columns".to_string(),
                            Value::from(columns.as_ref().clone()),
                        )]),
                        actions,
                        staged,
                        changes: vec![],
                        read_version: Some(snapshot.version()),
                        txn: None,
                    })
                })
            }))
            .await?;

        let mut metrics = shared.lock().map(|m| m.clone()).unwrap_or_default();
        metrics.elapsed_ms = started.elapsed().as_millis() as u64;
        metrics.commit = (!result.skipped).then_some(result);
        info!(
            rows = metrics.rows,
            files_created = metrics.files_created,
            skip_rate = metrics.estimated_skip_rate,
            "z-order clustering finished"
        );
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn morton_interleaves_bits() {
        // dim0 = 0b11, dim1 = 0b00 -> bits at positions 0 and 2
        assert_eq!(morton_code(&[0b11, 0b00]), 0b0101);
        // dim0 = 0b00, dim1 = 0b11 -> bits at positions 1 and 3
        assert_eq!(morton_code(&[0b00, 0b11]), 0b1010);
        assert_eq!(morton_code(&[0b1, 0b1]), 0b11);
    }

    #[test]
    fn identical_values_share_codes() {
        let bounds = HashMap::from([
            ("a".to_string(), ColumnBounds { min: 0.0, max: 100.0 }),
            ("b".to_string(), ColumnBounds { min: 0.0, max: 1.0 }),
        ]);
        let columns = vec!["a".to_string(), "b".to_string()];
        let row1 = json!({"a": 42, "b": 0.5, "other": "x"});
        let row2 = json!({"a": 42, "b": 0.5, "other": "y"});
        let code1 = code_for_row(row1.as_object().unwrap(), &columns, &bounds);
        let code2 = code_for_row(row2.as_object().unwrap(), &columns, &bounds);
        assert_eq!(code1, code2);
    }

    #[test]
    fn high_bit_dominates_ordering() {
        let bounds = HashMap::from([(
            "a".to_string(),
            ColumnBounds {
                min: 0.0,
                max: DIM_MAX as f64,
            },
        )]);
        let columns = vec!["a".to_string()];
        let low = json!({"a": 10});
        let high = json!({"a": (DIM_MAX / 2 + 10)});
        let low_code = code_for_row(low.as_object().unwrap(), &columns, &bounds);
        let high_code = code_for_row(high.as_object().unwrap(), &columns, &bounds);
        assert!(low_code < high_code);
    }

    #[test]
    fn djb2_is_stable() {
        assert_eq!(djb2("hello"), djb2("hello"));
        assert_ne!(djb2("hello"), djb2("world"));
    }

    #[test]
    fn skip_rate_is_clamped() {
        let codes: Vec<u128> = (0..100u128).collect();
        let (_, _, _, skip) = zone_stats(&codes, 2);
        assert!((0.31..=0.9).contains(&skip));
    }
}
