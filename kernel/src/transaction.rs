//! The optimistic commit pipeline. Every table mutation funnels through
//! here: build the action set against a fresh snapshot, emit change-data
//! files when the feed is on, then claim the next commit file with a
//! conditional create. Losing the race cleans up staged files and retries
//! with a refreshed snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use object_store::path::Path;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::actions::{Action, CommitInfo, Txn};
use crate::cdc::{emit, ChangeRecord, StagedChange};
use crate::checkpoint::{should_checkpoint, write_checkpoint};
use crate::error::{DlResult, Error};
use crate::log::codec;
use crate::metrics::EngineMetrics;
use crate::path::commit_path;
use crate::retry::Retry;
use crate::snapshot::Snapshot;
use crate::table::Table;
use crate::Version;

/// Everything one attempt wants to commit. Built fresh per attempt so a
/// refreshed snapshot can change the action set.
pub(crate) struct PreparedCommit {
    pub operation: String,
    pub parameters: HashMap<String, Value>,
    /// Actions in emission order, `commitInfo` excluded (the pipeline
    /// prepends it).
    pub actions: Vec<Action>,
    /// Data files this attempt staged; deleted if the commit does not land.
    pub staged: Vec<Path>,
    /// Row-level changes for the change data feed; empty when CDC is off or
    /// the operation carries no data change.
    pub changes: Vec<StagedChange>,
    /// Version the builder read, `None` when creating the table.
    pub read_version: Option<Version>,
    /// Optional idempotency anchor; a snapshot already at or past this
    /// transaction's version skips the commit entirely.
    pub txn: Option<Txn>,
}

/// Outcome of a committed (or idempotently skipped) operation.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitResult {
    pub version: Version,
    pub timestamp_ms: i64,
    /// Attempts beyond the first.
    pub num_retries: u32,
    /// True when a `Txn` anchor showed the work was already applied.
    pub skipped: bool,
}

pub(crate) type CommitBuild<'a> =
    Box<dyn Fn(Option<Arc<Snapshot>>) -> BoxFuture<'a, DlResult<PreparedCommit>> + Send + Sync + 'a>;

impl Table {
    /// Run `build` against the current snapshot and commit its actions,
    /// retrying on commit races per the table's retry configuration.
    pub(crate) async fn commit_with_retry<'a>(
        &'a self,
        build: CommitBuild<'a>,
    ) -> DlResult<CommitResult> {
        let started = Instant::now();
        let mut retries = 0u32;
        let retries_ref = &mut retries;
        let build = &build;
        let result = Retry::new(self.config().retry.clone())
            .on_retry(|_, err| {
                *retries_ref += 1;
                warn!(error = %err, "commit lost the race, retrying with refreshed snapshot");
                true
            })
            .run(|| async move { self.attempt_commit(build).await })
            .await;
        match result {
            Ok(mut outcome) => {
                outcome.num_retries = retries;
                EngineMetrics::add(&self.metrics().commit_retries, retries as u64);
                debug!(
                    version = outcome.version,
                    retries,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "commit finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                EngineMetrics::incr(&self.metrics().commit_conflicts);
                Err(err)
            }
        }
    }

    /// One optimistic attempt: snapshot, build, stage CDC, conditional
    /// create. Staged files are cleaned up on any failure.
    async fn attempt_commit<'a>(&self, build: &CommitBuild<'a>) -> DlResult<CommitResult> {
        let snapshot = self.latest_snapshot_opt().await?;
        let prepared = build(snapshot.clone()).await?;

        // Idempotent replays: the anchor's version is already applied.
        if let (Some(snapshot), Some(txn)) = (&snapshot, &prepared.txn) {
            if snapshot
                .txn_version(&txn.app_id)
                .is_some_and(|applied| applied >= txn.version)
            {
                info!(
                    app_id = %txn.app_id,
                    version = txn.version,
                    "transaction already applied, skipping commit"
                );
                self.cleanup_staged(&prepared.staged).await;
                return Ok(CommitResult {
                    version: snapshot.version(),
                    timestamp_ms: snapshot.timestamp_ms(),
                    num_retries: 0,
                    skipped: true,
                });
            }
        }

        // Builders with nothing to change (no matching rows) do not spend a
        // version on an empty commit.
        if prepared.actions.is_empty() && prepared.changes.is_empty() {
            self.cleanup_staged(&prepared.staged).await;
            return Ok(CommitResult {
                version: snapshot.as_ref().map(|s| s.version()).unwrap_or(0),
                timestamp_ms: snapshot.as_ref().map(|s| s.timestamp_ms()).unwrap_or(0),
                num_retries: 0,
                skipped: true,
            });
        }

        let next_version = match (&snapshot, prepared.read_version) {
            (Some(snapshot), _) => snapshot.version() + 1,
            (None, None) => 0,
            (None, Some(read)) => {
                // The table vanished between build and commit.
                self.cleanup_staged(&prepared.staged).await;
                return Err(Error::not_found(format!(
                    "table disappeared after reading version {read}"
                )));
            }
        };
        let timestamp_ms = Utc::now().timestamp_millis();

        match self
            .finish_commit(&prepared, next_version, timestamp_ms)
            .await
        {
            Ok(records) => {
                EngineMetrics::incr(&self.metrics().commits);
                self.after_commit(next_version, records).await;
                Ok(CommitResult {
                    version: next_version,
                    timestamp_ms,
                    num_retries: 0,
                    skipped: false,
                })
            }
            Err(err) => {
                self.cleanup_staged(&prepared.staged).await;
                match err.into_commit_conflict(next_version) {
                    Error::Concurrency { expected, .. } => {
                        // Tell the caller how far ahead the log moved.
                        let actual = crate::log::segment::latest_version(self.storage())
                            .await
                            .ok()
                            .flatten()
                            .unwrap_or(expected);
                        Err(Error::Concurrency { expected, actual })
                    }
                    other => Err(other),
                }
            }
        }
    }

    /// Emit CDC files, then the commit file itself. On failure the caller
    /// removes everything staged, this function only tracks what it added.
    async fn finish_commit(
        &self,
        prepared: &PreparedCommit,
        next_version: Version,
        timestamp_ms: i64,
    ) -> DlResult<Vec<ChangeRecord>> {
        let mut actions: Vec<Action> =
            Vec::with_capacity(prepared.actions.len() + 2);
        let mut commit_info = CommitInfo::new(timestamp_ms, prepared.operation.clone());
        commit_info.operation_parameters = prepared.parameters.clone();
        commit_info.read_version = prepared.read_version;
        actions.push(Action::CommitInfo(commit_info));
        actions.extend(prepared.actions.iter().cloned());
        if let Some(txn) = &prepared.txn {
            actions.push(Action::Txn(txn.clone()));
        }

        let mut cdc_paths: Vec<Path> = Vec::new();
        let mut records = Vec::new();
        if !prepared.changes.is_empty() {
            let emitted = emit::write_change_files(
                self.storage(),
                next_version,
                timestamp_ms,
                &prepared.changes,
            )
            .await?;
            cdc_paths = emitted.paths;
            actions.push(Action::Cdc(emitted.action));
            records = prepared
                .changes
                .iter()
                .map(|change| ChangeRecord {
                    change_type: change.change_type,
                    commit_version: next_version,
                    commit_timestamp: timestamp_ms,
                    data: change.data.clone(),
                })
                .collect();
            EngineMetrics::add(&self.metrics().cdc_records_emitted, records.len() as u64);
        }

        let body = codec::encode_commit(&actions)?;
        let result = self
            .storage()
            .conditional_create(&commit_path(next_version), body, None)
            .await;
        if let Err(err) = result {
            // The commit did not land; the change files written above are
            // orphans now.
            self.cleanup_staged(&cdc_paths).await;
            return Err(err);
        }
        Ok(records)
    }

    /// Post-commit work, all best-effort: refresh the cached snapshot, fan
    /// out change records, write a checkpoint on the configured cadence.
    async fn after_commit(&self, version: Version, records: Vec<ChangeRecord>) {
        let snapshot = match Snapshot::try_new(self.storage(), Some(version)).await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.replace_cached_snapshot(Some(snapshot.clone())).await;
                Some(snapshot)
            }
            Err(e) => {
                warn!(version, error = %e, "failed to refresh snapshot after commit");
                self.replace_cached_snapshot(None).await;
                None
            }
        };

        if !records.is_empty() {
            self.subscribers().dispatch(records);
        }

        if should_checkpoint(version, self.config().checkpoint.interval) {
            if let Some(snapshot) = snapshot {
                match write_checkpoint(self.storage(), &snapshot).await {
                    Ok(_) => EngineMetrics::incr(&self.metrics().checkpoints_written),
                    Err(e) => error!(version, error = %e, "checkpoint write failed"),
                }
            }
        }
    }

    /// Best-effort deletion of staged files; failures are logged, never
    /// raised.
    pub(crate) async fn cleanup_staged(&self, staged: &[Path]) {
        for path in staged {
            if let Err(e) = self.storage().delete(path).await {
                warn!(path = %path, error = %e, "failed to clean up staged file");
            }
        }
    }
}
