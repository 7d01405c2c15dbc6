//! DELETE: drop matching rows. Files that lose every row are tombstoned
//! outright; files that keep survivors are rewritten.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::actions::{Action, Remove};
use crate::cdc::{read_cdc_config, ChangeType, StagedChange};
use crate::error::{DlResult, Error};
use crate::metrics::EngineMetrics;
use crate::query::{file_may_match, Filter};
use crate::schema::Row;
use crate::table::Table;
use crate::transaction::{CommitResult, PreparedCommit};
use crate::writer::{write_data_files, WriteOptions};

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteMetrics {
    pub rows_deleted: usize,
    /// Files rewritten because they kept surviving rows.
    pub files_rewritten: usize,
    /// Files removed whole.
    pub files_removed: usize,
    /// `None` when no row matched and nothing was committed.
    pub commit: Option<CommitResult>,
}

impl Table {
    /// Delete every row matching `filter`.
    pub async fn delete(&self, filter: Value) -> DlResult<DeleteMetrics> {
        Filter::new(filter.clone())?;
        let filter_doc = Arc::new(filter);
        let rows_deleted = Arc::new(AtomicUsize::new(0));
        let files_rewritten = Arc::new(AtomicUsize::new(0));
        let files_removed = Arc::new(AtomicUsize::new(0));

        let rows_counter = rows_deleted.clone();
        let rewrites_counter = files_rewritten.clone();
        let removed_counter = files_removed.clone();
        let result = self
            .commit_with_retry(Box::new(move |snapshot| {
                let filter_doc = filter_doc.clone();
                let rows_counter = rows_counter.clone();
                let rewrites_counter = rewrites_counter.clone();
                let removed_counter = removed_counter.clone();
                Box::pin(async move {
                    let snapshot = snapshot.ok_or_else(|| {
                        Error::not_found("cannot delete from a table that does not exist")
                    })?;
                    let filter = Filter::new((*filter_doc).clone())?;
                    let cdc_on = read_cdc_config(self.storage()).await;
                    let schema = snapshot.schema()?;
                    let partition_columns = snapshot.metadata().partition_columns.clone();
                    let next_version = snapshot.version() + 1;
                    let now = Utc::now().timestamp_millis();

                    let mut actions = Vec::new();
                    let mut staged = Vec::new();
                    let mut changes = Vec::new();
                    let mut deleted = 0usize;
                    let mut rewritten = 0usize;
                    let mut removed_whole = 0usize;

                    if snapshot.metadata().cdc_enabled() != cdc_on {
                        let mut updated = snapshot.metadata().clone();
                        updated.set_cdc_enabled(cdc_on);
                        actions.push(Action::Metadata(updated));
                    }

                    let write_options = WriteOptions {
                        target_file_size: self.config().compaction.target_file_size,
                        statistics: self.config().statistics,
                        partition_columns,
                        data_change: true,
                    };
                    for add in snapshot.files() {
                        if !file_may_match(&filter, add) {
                            EngineMetrics::incr(&self.metrics().files_pruned);
                            continue;
                        }
                        let rows = self.read_file_rows(&add.path).await?;
                        let (doomed, survivors): (Vec<Row>, Vec<Row>) =
                            rows.into_iter().partition(|row| filter.matches(row));
                        if doomed.is_empty() {
                            continue;
                        }
                        deleted += doomed.len();
                        actions.push(Action::Remove(Remove::for_add(add, now, true)));
                        if survivors.is_empty() {
                            removed_whole += 1;
                        } else {
                            rewritten += 1;
                            let adds = write_data_files(
                                self.storage(),
                                next_version,
                                &schema,
                                &survivors,
                                &write_options,
                            )
                            .await?;
                            staged.extend(
                                adds.iter()
                                    .map(|a| object_store::path::Path::from(a.path.as_str())),
                            );
                            actions.extend(adds.into_iter().map(Action::Add));
                        }
                        if cdc_on {
                            changes.extend(doomed.into_iter().map(|row| {
                                StagedChange::new(ChangeType::Delete, row)
                            }));
                        }
                    }

                    rows_counter.store(deleted, Ordering::SeqCst);
                    rewrites_counter.store(rewritten, Ordering::SeqCst);
                    removed_counter.store(removed_whole, Ordering::SeqCst);

                    Ok(PreparedCommit {
                        operation: "DELETE".to_string(),
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

        Ok(DeleteMetrics {
            rows_deleted: rows_deleted.load(Ordering::SeqCst),
            files_rewritten: files_rewritten.load(Ordering::SeqCst),
            files_removed: files_removed.load(Ordering::SeqCst),
            commit: (!result.skipped).then_some(result),
        })
    }
}
