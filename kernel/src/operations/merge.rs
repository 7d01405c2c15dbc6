//! MERGE: reconcile a batch of incoming rows with the live data. Matched
//! rows run through the `when_matched` mutator (returning `None` deletes),
//! unmatched incoming rows through `when_not_matched` (returning `None`
//! skips). Produces mixed insert/update/delete change records.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::actions::{Action, Add, Remove};
use crate::cdc::{read_cdc_config, ChangeType, StagedChange};
use crate::error::{DlResult, Error};
use crate::query::filter::values_equal;
use crate::schema::{Row, Schema};
use crate::table::Table;
use crate::transaction::{CommitResult, PreparedCommit};
use crate::writer::{write_data_files, WriteOptions};

type MatchPredicate = Arc<dyn Fn(&Row, &Row) -> bool + Send + Sync>;
type MatchedMutator = Arc<dyn Fn(&Row, &Row) -> Option<Row> + Send + Sync>;
type NotMatchedMutator = Arc<dyn Fn(&Row) -> Option<Row> + Send + Sync>;

/// Builder describing one merge. The defaults upsert: matched rows are
/// replaced by the incoming row, unmatched incoming rows are inserted.
pub struct Merge {
    source: Vec<Row>,
    predicate: MatchPredicate,
    matched: MatchedMutator,
    not_matched: NotMatchedMutator,
}

impl Merge {
    pub fn new(source: Vec<Row>) -> Self {
        Self {
            source,
            predicate: Arc::new(|_, _| false),
            matched: Arc::new(|_existing, incoming| Some(incoming.clone())),
            not_matched: Arc::new(|incoming| Some(incoming.clone())),
        }
    }

    /// Match existing and incoming rows when every named column is equal.
    pub fn on_columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        self.predicate = Arc::new(move |existing, incoming| {
            !columns.is_empty()
                && columns.iter().all(|col| {
                    match (existing.get(col), incoming.get(col)) {
                        (Some(a), Some(b)) => values_equal(a, b),
                        _ => false,
                    }
                })
        });
        self
    }

    /// Match with an arbitrary predicate over (existing, incoming).
    pub fn on(mut self, predicate: impl Fn(&Row, &Row) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    /// What to do with a matched pair; `None` deletes the existing row.
    pub fn when_matched(
        mut self,
        mutator: impl Fn(&Row, &Row) -> Option<Row> + Send + Sync + 'static,
    ) -> Self {
        self.matched = Arc::new(mutator);
        self
    }

    /// What to do with an unmatched incoming row; `None` skips it.
    pub fn when_not_matched(
        mut self,
        mutator: impl Fn(&Row) -> Option<Row> + Send + Sync + 'static,
    ) -> Self {
        self.not_matched = Arc::new(mutator);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeMetrics {
    pub rows_inserted: usize,
    pub rows_updated: usize,
    pub rows_deleted: usize,
    /// `None` when the merge was a no-op.
    pub commit: Option<CommitResult>,
}

impl Table {
    pub async fn merge(&self, merge: Merge) -> DlResult<MergeMetrics> {
        if merge.source.is_empty() {
            return Err(Error::validation("merge source must not be empty"));
        }
        let source = Arc::new(merge.source);
        let predicate = merge.predicate;
        let matched = merge.matched;
        let not_matched = merge.not_matched;

        let inserted = Arc::new(AtomicUsize::new(0));
        let updated = Arc::new(AtomicUsize::new(0));
        let deleted = Arc::new(AtomicUsize::new(0));

        let ins = inserted.clone();
        let upd = updated.clone();
        let del = deleted.clone();
        let result = self
            .commit_with_retry(Box::new(move |snapshot| {
                let source = source.clone();
                let predicate = predicate.clone();
                let matched = matched.clone();
                let not_matched = not_matched.clone();
                let ins = ins.clone();
                let upd = upd.clone();
                let del = del.clone();
                Box::pin(async move {
                    let cdc_on = read_cdc_config(self.storage()).await;
                    let now = Utc::now().timestamp_millis();

                    let mut matched_incoming = vec![false; source.len()];
                    let mut actions: Vec<Action> = Vec::new();
                    let mut staged = Vec::new();
                    let mut changes = Vec::new();
                    let mut rows_updated = 0usize;
                    let mut rows_deleted = 0usize;

                    // Pass one: reconcile each live file against the source.
                    let mut affected: Vec<(Add, Vec<Row>)> = Vec::new();
                    let (table_schema, partition_columns, next_version, read_version) =
                        match &snapshot {
                            Some(snapshot) => {
                                for add in snapshot.files() {
                                    let rows = self.read_file_rows(&add.path).await?;
                                    let mut touched = false;
                                    let mut new_rows = Vec::with_capacity(rows.len());
                                    for row in rows {
                                        let hit = source.iter().enumerate().find(|(_, incoming)| {
                                            predicate(&row, incoming)
                                        });
                                        match hit {
                                            Some((idx, incoming)) => {
                                                matched_incoming[idx] = true;
                                                touched = true;
                                                match matched(&row, incoming) {
                                                    Some(new_row) => {
                                                        rows_updated += 1;
                                                        if cdc_on {
                                                            changes.push(StagedChange::new(
                                                                ChangeType::UpdatePreimage,
                                                                row.clone(),
                                                            ));
                                                            changes.push(StagedChange::new(
                                                                ChangeType::UpdatePostimage,
                                                                new_row.clone(),
                                                            ));
                                                        }
                                                        new_rows.push(new_row);
                                                    }
                                                    None => {
                                                        rows_deleted += 1;
                                                        if cdc_on {
                                                            changes.push(StagedChange::new(
                                                                ChangeType::Delete,
                                                                row.clone(),
                                                            ));
                                                        }
                                                    }
                                                }
                                            }
                                            None => new_rows.push(row),
                                        }
                                    }
                                    if touched {
                                        affected.push((add.clone(), new_rows));
                                    }
                                }
                                (
                                    Some(snapshot.schema()?),
                                    snapshot.metadata().partition_columns.clone(),
                                    snapshot.version() + 1,
                                    Some(snapshot.version()),
                                )
                            }
                            None => (None, vec![], 0, None),
                        };

                    // Pass two: unmatched incoming rows become inserts.
                    let inserts: Vec<Row> = source
                        .iter()
                        .zip(&matched_incoming)
                        .filter(|(_, was_matched)| !**was_matched)
                        .filter_map(|(incoming, _)| not_matched(incoming))
                        .collect();
                    if cdc_on {
                        changes.extend(
                            inserts
                                .iter()
                                .map(|row| StagedChange::new(ChangeType::Insert, row.clone())),
                        );
                    }

                    ins.store(inserts.len(), Ordering::SeqCst);
                    upd.store(rows_updated, Ordering::SeqCst);
                    del.store(rows_deleted, Ordering::SeqCst);

                    if affected.is_empty() && inserts.is_empty() {
                        return Ok(PreparedCommit {
                            operation: "MERGE".to_string(),
                            parameters: HashMap::new(),
                            actions: vec![],
                            staged: vec![],
                            changes: vec![],
                            read_version,
                            txn: None,
                        });
                    }

                    // Derive the write schema across everything we are
                    // about to write.
                    let mut schema_rows: Vec<&Row> =
                        affected.iter().flat_map(|(_, rows)| rows).collect();
                    schema_rows.extend(inserts.iter());
                    let write_schema = match (&table_schema, schema_rows.is_empty()) {
                        (_, true) => table_schema.clone().ok_or_else(|| {
                            Error::validation("merge produced no rows for a new table")
                        })?,
                        (Some(existing), false) => existing
                            .merge(&Schema::infer(&schema_rows)?, self.config().schema_evolution)?,
                        (None, false) => Schema::infer(&schema_rows)?,
                    };

                    if let Some(snapshot) = &snapshot {
                        let existing = snapshot.schema()?;
                        if write_schema != existing
                            || snapshot.metadata().cdc_enabled() != cdc_on
                        {
                            let mut updated =
                                snapshot.metadata().clone().with_schema(&write_schema)?;
                            updated.set_cdc_enabled(cdc_on);
                            actions.push(Action::Metadata(updated));
                        }
                    } else {
                        let mut metadata = crate::actions::Metadata::new(
                            &write_schema,
                            vec![],
                            now,
                        )?;
                        metadata.set_cdc_enabled(cdc_on);
                        actions.push(Action::Protocol(crate::actions::Protocol::default()));
                        actions.push(Action::Metadata(metadata));
                    }

                    let write_options = WriteOptions {
                        target_file_size: self.config().compaction.target_file_size,
                        statistics: self.config().statistics,
                        partition_columns,
                        data_change: true,
                    };
                    for (old, new_rows) in &affected {
                        actions.push(Action::Remove(Remove::for_add(old, now, true)));
                        if !new_rows.is_empty() {
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
                            actions.extend(adds.into_iter().map(Action::Add));
                        }
                    }
                    if !inserts.is_empty() {
                        let adds = write_data_files(
                            self.storage(),
                            next_version,
                            &write_schema,
                            &inserts,
                            &write_options,
                        )
                        .await?;
                        staged.extend(
                            adds.iter()
                                .map(|a| object_store::path::Path::from(a.path.as_str())),
                        );
                        actions.extend(adds.into_iter().map(Action::Add));
                    }

                    Ok(PreparedCommit {
                        operation: "MERGE".to_string(),
                        parameters: HashMap::from([(
                            "sourceRows".to_string(),
                            Value::from(source.len()),
                        )]),
                        actions,
                        staged,
                        changes,
                        read_version,
                        txn: None,
                    })
                })
            }))
            .await?;

        Ok(MergeMetrics {
            rows_inserted: inserted.load(Ordering::SeqCst),
            rows_updated: updated.load(Ordering::SeqCst),
            rows_deleted: deleted.load(Ordering::SeqCst),
            commit: (!result.skipped).then_some(result),
        })
    }
}
