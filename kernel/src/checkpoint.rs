//! Checkpoints: a materialized snapshot written as a columnar file so log
//! replay can start from the most recent one instead of version 0, plus the
//! `_last_checkpoint` pointer and the cleanup passes over old checkpoints
//! and commit files.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::actions::Action;
use crate::error::{DlResult, Error};
use crate::log::segment::{list_checkpoints, list_commits};
use crate::parquet;
use crate::path::{checkpoint_path, last_checkpoint_path, ParsedLogPath};
use crate::schema::{DataType, Field, Row, Schema};
use crate::snapshot::Snapshot;
use crate::storage::StorageBackend;
use crate::Version;

/// Contents of `_delta_log/_last_checkpoint`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastCheckpoint {
    pub version: Version,
    /// Number of actions in the checkpoint.
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_in_bytes: Option<u64>,
}

/// True every `interval` commits; the commit pipeline calls this after each
/// successful commit.
pub(crate) fn should_checkpoint(version: Version, interval: u64) -> bool {
    interval > 0 && version > 0 && version % interval == 0
}

pub(crate) async fn read_last_checkpoint(
    storage: &dyn StorageBackend,
) -> DlResult<Option<LastCheckpoint>> {
    match storage.read(&last_checkpoint_path()).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// One checkpoint row per action, each action under its own column as JSON
/// text. Columns mirror the commit-file keys; `commitInfo` never appears in
/// a checkpoint.
fn checkpoint_schema() -> Schema {
    Schema::new(vec![
        Field::new("protocol", DataType::Json, true),
        Field::new("metaData", DataType::Json, true),
        Field::new("txn", DataType::Json, true),
        Field::new("add", DataType::Json, true),
        Field::new("remove", DataType::Json, true),
    ])
}

/// Materialize `snapshot` as a checkpoint file and update
/// `_last_checkpoint`.
pub(crate) async fn write_checkpoint(
    storage: &dyn StorageBackend,
    snapshot: &Snapshot,
) -> DlResult<LastCheckpoint> {
    let mut actions: Vec<Action> = Vec::with_capacity(snapshot.files().len() + 2);
    actions.push(Action::Protocol(snapshot.protocol().clone()));
    actions.push(Action::Metadata(snapshot.metadata().clone()));
    actions.extend(snapshot.txns().map(|t| Action::Txn(t.clone())));
    actions.extend(snapshot.files().map(|a| Action::Add(a.clone())));

    let rows: Vec<Row> = actions
        .iter()
        .map(|action| {
            let value = serde_json::to_value(action)?;
            match value {
                Value::Object(map) => Ok(map),
                other => Err(Error::internal(format!(
                    "action serialized to non-object {other}"
                ))),
            }
        })
        .collect::<DlResult<_>>()?;

    let bytes = parquet::encode_rows(&checkpoint_schema(), &rows)?;
    let size_in_bytes = bytes.len() as u64;
    let location = checkpoint_path(snapshot.version());
    storage.write(&location, bytes).await?;

    let last = LastCheckpoint {
        version: snapshot.version(),
        size: rows.len() as u64,
        parts: None,
        size_in_bytes: Some(size_in_bytes),
    };
    storage
        .write(&last_checkpoint_path(), serde_json::to_vec(&last)?.into())
        .await?;
    info!(
        version = snapshot.version(),
        actions = last.size,
        "wrote checkpoint"
    );
    Ok(last)
}

/// Read the actions out of one checkpoint file.
pub(crate) async fn read_checkpoint(
    storage: &dyn StorageBackend,
    checkpoint: &ParsedLogPath,
) -> DlResult<Vec<Action>> {
    let bytes = storage.read(&checkpoint.location).await?;
    let rows = parquet::decode_rows(bytes)?;
    let mut actions = Vec::with_capacity(rows.len());
    for row in rows {
        let mut present = row.into_iter().filter(|(_, v)| !v.is_null());
        let Some((key, value)) = present.next() else {
            continue;
        };
        if present.next().is_some() {
            return Err(Error::integrity(
                checkpoint.location.as_ref(),
                "checkpoint row carries more than one action",
            ));
        }
        let mut envelope = serde_json::Map::new();
        envelope.insert(key, value);
        actions.push(serde_json::from_value(Value::Object(envelope))?);
    }
    Ok(actions)
}

/// Delete all but the `keep_last` newest checkpoint files.
pub(crate) async fn cleanup_checkpoints(
    storage: &dyn StorageBackend,
    keep_last: usize,
) -> DlResult<usize> {
    let checkpoints = list_checkpoints(storage).await?;
    if checkpoints.len() <= keep_last {
        return Ok(0);
    }
    let doomed = checkpoints.len() - keep_last;
    let mut deleted = 0;
    for checkpoint in checkpoints.into_iter().take(doomed) {
        match storage.delete(&checkpoint.location).await {
            Ok(()) => deleted += 1,
            Err(e) => warn!(path = %checkpoint.location, error = %e, "failed to delete checkpoint"),
        }
    }
    debug!(deleted, "cleaned up old checkpoints");
    Ok(deleted)
}

/// Delete commit files that predate the oldest retained checkpoint, always
/// keeping the `keep_versions` most recent commits.
pub(crate) async fn cleanup_logs(
    storage: &dyn StorageBackend,
    keep_versions: usize,
) -> DlResult<usize> {
    let checkpoints = list_checkpoints(storage).await?;
    let Some(oldest_checkpoint) = checkpoints.first().map(|p| p.version) else {
        // With no checkpoint every commit is needed for replay.
        return Ok(0);
    };
    let commits = list_commits(storage).await?;
    let cutoff_by_count = commits
        .len()
        .saturating_sub(keep_versions)
        .min(commits.len());
    let mut deleted = 0;
    for (commit, _) in commits.into_iter().take(cutoff_by_count) {
        if commit.version >= oldest_checkpoint {
            break;
        }
        match storage.delete(&commit.location).await {
            Ok(()) => deleted += 1,
            Err(e) => warn!(path = %commit.location, error = %e, "failed to delete commit file"),
        }
    }
    debug!(deleted, "cleaned up old commit files");
    Ok(deleted)
}

impl crate::table::Table {
    /// Materialize the current snapshot as a checkpoint.
    pub async fn checkpoint(&self) -> DlResult<LastCheckpoint> {
        let snapshot = self.refresh().await?;
        write_checkpoint(self.storage(), &snapshot).await
    }

    /// Delete all but the newest `keep_last` checkpoints. Returns how many
    /// were removed.
    pub async fn cleanup_checkpoints(&self, keep_last: usize) -> DlResult<usize> {
        cleanup_checkpoints(self.storage(), keep_last).await
    }

    /// Delete commit files already covered by the oldest retained
    /// checkpoint, keeping at least the `keep_versions` newest commits.
    pub async fn cleanup_logs(&self, keep_versions: usize) -> DlResult<usize> {
        cleanup_logs(self.storage(), keep_versions).await
    }
}
