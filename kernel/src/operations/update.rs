//! UPDATE: rewrite every live file containing a matching row, replacing
//! matched rows with their patched form. Untouched files stay untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::actions::{Action, Add, Remove};
use crate::cdc::{read_cdc_config, ChangeType, StagedChange};
use crate::error::{DlResult, Error};
use crate::metrics::EngineMetrics;
use crate::query::{file_may_match, Filter};
use crate::schema::{Row, Schema};
use crate::table::Table;
use crate::transaction::{CommitResult, PreparedCommit};
use crate::writer::{write_data_files, WriteOptions};

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateMetrics {
    pub rows_updated: usize,
    pub files_rewritten: usize,
    /// `None` when no row matched and nothing was committed.
    pub commit: Option<CommitResult>,
}

fn apply_patch(row: &Row, patch: &Row) -> Row {
    let mut out = row.clone();
    for (key, value) in patch {
        out.insert(key.clone(), value.clone());
    }
    out
}

impl Table {
    /// Update all rows matching `filter` by merging in the fields of
    /// `changes` (a flat object of column → new value).
    pub async fn update(&self, filter: Value, changes: Value) -> DlResult<UpdateMetrics> {
        let Value::Object(patch) = changes else {
            return Err(Error::validation("update changes must be an object"));
        };
        if patch.is_empty() {
            return Err(Error::validation("update changes must not be empty"));
        }
        // Compile once to surface bad filters before any IO.
        Filter::new(filter.clone())?;

        let patch = Arc::new(patch);
        let filter_doc = Arc::new(filter);
        let rows_updated = Arc::new(AtomicUsize::new(0));
        let files_rewritten = Arc::new(AtomicUsize::new(0));

        let rows_counter = rows_updated.clone();
        let files_counter = files_rewritten.clone();
        let result = self
            .commit_with_retry(Box::new(move |snapshot| {
                let patch = patch.clone();
                let filter_doc = filter_doc.clone();
                let rows_counter = rows_counter.clone();
                let files_counter = files_counter.clone();
                Box::pin(async move {
                    let snapshot = snapshot.ok_or_else(|| {
                        Error::not_found("cannot update a table that does not exist")
                    })?;
                    let filter = Filter::new((*filter_doc).clone())?;
                    let cdc_on = read_cdc_config(self.storage()).await;
                    let table_schema = snapshot.schema()?;
                    let partition_columns = snapshot.metadata().partition_columns.clone();
                    let next_version = snapshot.version() + 1;
                    let now = Utc::now().timestamp_millis();

                    // Pass one: find and patch the affected files in memory.
                    let mut affected: Vec<(Add, Vec<Row>, Vec<(Row, Row)>)> = Vec::new();
                    for add in snapshot.files() {
                        if !file_may_match(&filter, add) {
                            EngineMetrics::incr(&self.metrics().files_pruned);
                            continue;
                        }
                        let rows = self.read_file_rows(&add.path).await?;
                        let mut mutations = Vec::new();
                        let new_rows: Vec<Row> = rows
                            .into_iter()
                            .map(|row| {
                                if filter.matches(&row) {
                                    let patched = apply_patch(&row, &patch);
                                    mutations.push((row, patched.clone()));
                                    patched
                                } else {
                                    row
                                }
                            })
                            .collect();
                        if !mutations.is_empty() {
                            affected.push((add.clone(), new_rows, mutations));
                        }
                    }

                    rows_counter.store(
                        affected.iter().map(|(_, _, m)| m.len()).sum(),
                        Ordering::SeqCst,
                    );
                    files_counter.store(affected.len(), Ordering::SeqCst);
                    if affected.is_empty() {
                        return Ok(PreparedCommit {
                            operation: "UPDATE".to_string(),
                            parameters: HashMap::new(),
                            actions: vec![],
                            staged: vec![],
                            changes: vec![],
                            read_version: Some(snapshot.version()),
                            txn: None,
                        });
                    }

                    // The patch may introduce new columns; widen the write
                    // schema from the rewritten rows.
                    let all_rows: Vec<&Row> =
                        affected.iter().flat_map(|(_, rows, _)| rows).collect();
                    let write_schema =
                        table_schema.merge(&Schema::infer(&all_rows)?, self.config().schema_evolution)?;
                    let mut actions = Vec::new();
                    if write_schema != table_schema
                        || snapshot.metadata().cdc_enabled() != cdc_on
                    {
                        let mut updated =
                            snapshot.metadata().clone().with_schema(&write_schema)?;
                        updated.set_cdc_enabled(cdc_on);
                        actions.push(Action::Metadata(updated));
                    }

                    let write_options = WriteOptions {
                        target_file_size: self.config().compaction.target_file_size,
                        statistics: self.config().statistics,
                        partition_columns,
                        data_change: true,
                    };
                    let mut staged = Vec::new();
                    let mut changes = Vec::new();
                    for (old, new_rows, mutations) in &affected {
                        let adds = write_data_files(
                            self.storage(),
                            next_version,
                            &write_schema,
                            new_rows,
                            &write_options,
                        )
                        .await?;
                        staged.extend(
                            adds.iter()
                                .map(|a| object_store::path::Path::from(a.path.as_str())),
                        );
                        actions.push(Action::Remove(Remove::for_add(old, now, true)));
                        actions.extend(adds.into_iter().map(Action::Add));
                        if cdc_on {
                            for (pre, post) in mutations {
                                changes.push(StagedChange::new(
                                    ChangeType::UpdatePreimage,
                                    pre.clone(),
                                ));
                                changes.push(StagedChange::new(
                                    ChangeType::UpdatePostimage,
                                    post.clone(),
                                ));
                            }
                        }
                    }

                    Ok(PreparedCommit {
                        operation: "UPDATE".to_string(),
                        parameters: HashMap::from([(
                            "predicate".to_string(),
                            (*filter_doc).clone(),
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

        Ok(UpdateMetrics {
            rows_updated: rows_updated.load(Ordering::SeqCst),
            files_rewritten: files_rewritten.load(Ordering::SeqCst),
            commit: (!result.skipped).then_some(result),
        })
    }
}
