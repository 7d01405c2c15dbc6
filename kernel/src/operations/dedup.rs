//! Deduplication: collapse exact-duplicate rows, or keep one row per
//! primary-key group, and replace the whole live set with the survivors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::info;

use crate::actions::{Action, Remove};
use crate::cdc::{read_cdc_config, ChangeType, StagedChange};
use crate::error::{DlResult, Error};
use crate::schema::Row;
use crate::table::Table;
use crate::transaction::{CommitResult, PreparedCommit};
use crate::writer::{value_lt, write_data_files, WriteOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeepStrategy {
    /// Keep the first row encountered in log order.
    #[default]
    First,
    /// Keep the last row encountered.
    Last,
    /// Keep the per-group maximum of `order_by` (required).
    Latest,
}

#[derive(Debug, Clone, Default)]
pub struct DedupOptions {
    /// Key columns for primary-key mode; empty means exact-duplicate mode.
    pub key_columns: Vec<String>,
    pub keep: KeepStrategy,
    /// Ordering column for [`KeepStrategy::Latest`].
    pub order_by: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupMetrics {
    pub rows_before: usize,
    pub rows_after: usize,
    pub duplicates_removed: usize,
    /// Fraction of rows removed, in `[0, 1]`.
    pub deduplication_ratio: f64,
    /// Duplicate count per duplicated key (primary-key mode only).
    pub distribution: Option<HashMap<String, usize>>,
    pub max_duplicates_per_key: Option<usize>,
    pub commit: Option<CommitResult>,
}

fn group_key(row: &Row, key_columns: &[String]) -> String {
    if key_columns.is_empty() {
        // Exact mode: the full canonical serialization is the identity.
        serde_json::to_string(&Value::Object(canonical(row))).unwrap_or_default()
    } else {
        let key: Vec<&Value> = key_columns
            .iter()
            .map(|col| row.get(col).unwrap_or(&Value::Null))
            .collect();
        serde_json::to_string(&key).unwrap_or_default()
    }
}

/// Key-sorted copy so `{a,b}` and `{b,a}` serialize identically.
fn canonical(row: &Row) -> Row {
    let mut entries: Vec<(&String, &Value)> = row.iter().collect();
    entries.sort_by_key(|(k, _)| k.clone());
    entries
        .into_iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl Table {
    /// Rewrite the table without duplicate rows. See [`DedupOptions`].
    pub async fn dedup(&self, options: DedupOptions) -> DlResult<DedupMetrics> {
        if options.keep == KeepStrategy::Latest && options.order_by.is_none() {
            return Err(Error::validation(
                "keep strategy `latest` requires an order_by column",
            ));
        }
        if options.keep == KeepStrategy::Latest && options.key_columns.is_empty() {
            return Err(Error::validation(
                "keep strategy `latest` requires key columns",
            ));
        }
        let options = Arc::new(options);
        let shared = Arc::new(Mutex::new(DedupMetrics::default()));

        let build_options = options.clone();
        let build_metrics = shared.clone();
        let result = self
            .commit_with_retry(Box::new(move |snapshot| {
                let options = build_options.clone();
                let shared = build_metrics.clone();
                Box::pin(async move {
                    let snapshot = snapshot.ok_or_else(|| {
                        Error::not_found("cannot deduplicate a table that does not exist")
                    })?;
                    let cdc_on = read_cdc_config(self.storage()).await;
                    let schema = snapshot.schema()?;
                    let partition_columns = snapshot.metadata().partition_columns.clone();
                    let next_version = snapshot.version() + 1;
                    let now = Utc::now().timestamp_millis();

                    let sources: Vec<_> = snapshot.files().cloned().collect();
                    let mut rows: Vec<Row> = Vec::new();
                    for add in &sources {
                        rows.extend(self.read_file_rows(&add.path).await?);
                    }
                    let rows_before = rows.len();

                    // Pick the surviving row index per group.
                    let mut groups: IndexMap<String, Vec<usize>> = IndexMap::new();
                    for (idx, row) in rows.iter().enumerate() {
                        groups
                            .entry(group_key(row, &options.key_columns))
                            .or_default()
                            .push(idx);
                    }
                    let mut keep = vec![false; rows.len()];
                    let mut distribution: HashMap<String, usize> = HashMap::new();
                    let mut max_dups = 0usize;
                    for (key, members) in &groups {
                        if members.len() > 1 {
                            distribution.insert(key.clone(), members.len());
                            max_dups = max_dups.max(members.len());
                        }
                        let winner = match options.keep {
                            KeepStrategy::First => members[0],
                            KeepStrategy::Last => members[members.len() - 1],
                            KeepStrategy::Latest => {
                                let order_by = options.order_by.as_deref().unwrap_or_default();
                                members
                                    .iter()
                                    .copied()
                                    .max_by(|a, b| {
                                        let va =
                                            rows[*a].get(order_by).unwrap_or(&Value::Null);
                                        let vb =
                                            rows[*b].get(order_by).unwrap_or(&Value::Null);
                                        if value_lt(va, vb) {
                                            std::cmp::Ordering::Less
                                        } else if value_lt(vb, va) {
                                            std::cmp::Ordering::Greater
                                        } else {
                                            // Stable tie-break on position:
                                            // later row wins.
                                            a.cmp(b)
                                        }
                                    })
                                    .unwrap_or(members[0])
                            }
                        };
                        keep[winner] = true;
                    }

                    let duplicates_removed = rows_before - groups.len();
                    let mut metrics = DedupMetrics {
                        rows_before,
                        rows_after: groups.len(),
                        duplicates_removed,
                        deduplication_ratio: if rows_before > 0 {
                            duplicates_removed as f64 / rows_before as f64
                        } else {
                            0.0
                        },
                        distribution: (!options.key_columns.is_empty())
                            .then_some(distribution),
                        max_duplicates_per_key: (!options.key_columns.is_empty())
                            .then_some(max_dups),
                        commit: None,
                    };

                    if duplicates_removed == 0 {
                        if let Ok(mut slot) = shared.lock() {
                            *slot = metrics;
                        }
                        return Ok(PreparedCommit {
                            operation: "DEDUPLICATE".to_string(),
                            parameters: HashMap::new(),
                            actions: vec![],
                            staged: vec![],
                            changes: vec![],
                            read_version: Some(snapshot.version()),
                            txn: None,
                        });
                    }

                    let mut survivors = Vec::with_capacity(groups.len());
                    let mut changes = Vec::new();
                    for (idx, row) in rows.into_iter().enumerate() {
                        if keep[idx] {
                            survivors.push(row);
                        } else if cdc_on {
                            changes.push(StagedChange::new(ChangeType::Delete, row));
                        }
                    }
                    metrics.rows_after = survivors.len();
                    if let Ok(mut slot) = shared.lock() {
                        *slot = metrics;
                    }

                    let write_options = WriteOptions {
                        target_file_size: self.config().compaction.target_file_size,
                        statistics: self.config().statistics,
                        partition_columns,
                        data_change: true,
                    };
                    let adds = write_data_files(
                        self.storage(),
                        next_version,
                        &schema,
                        &survivors,
                        &write_options,
                    )
                    .await?;
                    let staged = adds
                        .iter()
                        .map(|a| object_store::path::Path::from(a.path.as_str()))
                        .collect();
                    let mut actions: Vec<Action> = sources
                        .iter()
                        .map(|f| Action::Remove(Remove::for_add(f, now, true)))
                        .collect();
                    actions.extend(adds.into_iter().map(Action::Add));

                    Ok(PreparedCommit {
                        operation: "DEDUPLICATE".to_string(),
                        parameters: HashMap::from([(
                            "keyColumns".to_string(),
                            Value::from(options.key_columns.clone()),
                        )]),
                        actions,
                        staged,
                        changes,
                        read_version: Some(snapshot.version()),
                        txn: None,
                    })
                })
            }))
            .await?;

        let mut metrics = shared.lock().map(|m| m.clone()).unwrap_or_default();
        metrics.commit = (!result.skipped).then_some(result);
        info!(
            rows_before = metrics.rows_before,
            rows_after = metrics.rows_after,
            "deduplication finished"
        );
        Ok(metrics)
    }
}
