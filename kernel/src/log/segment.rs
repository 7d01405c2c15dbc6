//! Selection of the log files needed to reconstruct a table state: the
//! newest usable checkpoint at or below the target version plus the commit
//! files after it, in replay order.

use chrono::{DateTime, Utc};
use object_store::path::Path;
use tracing::{debug, warn};

use crate::checkpoint::read_last_checkpoint;
use crate::error::{DlResult, Error};
use crate::log::codec;
use crate::path::{ParsedLogPath, DELTA_LOG_DIR};
use crate::storage::StorageBackend;
use crate::{actions::Action, Version};

#[derive(Debug, Clone)]
pub(crate) struct LogSegment {
    /// Checkpoint seeding the replay, if one at or below the target exists.
    pub checkpoint: Option<ParsedLogPath>,
    /// Commit files in `(checkpoint_version, end_version]`, ascending.
    pub commit_files: Vec<ParsedLogPath>,
    pub end_version: Version,
}

/// All commit files with their storage mtimes, ascending by version.
pub(crate) async fn list_commits(
    storage: &dyn StorageBackend,
) -> DlResult<Vec<(ParsedLogPath, DateTime<Utc>)>> {
    let entries = storage.list(Some(&Path::from(DELTA_LOG_DIR))).await?;
    let mut commits: Vec<_> = entries
        .into_iter()
        .filter_map(|entry| {
            let last_modified = entry.last_modified;
            ParsedLogPath::try_from(entry.path).map(|p| (p, last_modified))
        })
        .filter(|(p, _)| p.is_commit())
        .collect();
    commits.sort_by_key(|(p, _)| p.version);
    Ok(commits)
}

pub(crate) async fn list_checkpoints(
    storage: &dyn StorageBackend,
) -> DlResult<Vec<ParsedLogPath>> {
    let entries = storage.list(Some(&Path::from(DELTA_LOG_DIR))).await?;
    let mut checkpoints: Vec<_> = entries
        .into_iter()
        .filter_map(|entry| ParsedLogPath::try_from(entry.path))
        .filter(ParsedLogPath::is_checkpoint)
        .collect();
    checkpoints.sort_by_key(|p| p.version);
    Ok(checkpoints)
}

/// Latest committed version, or `None` for a table with no log.
pub(crate) async fn latest_version(storage: &dyn StorageBackend) -> DlResult<Option<Version>> {
    Ok(list_commits(storage).await?.last().map(|(p, _)| p.version))
}

impl LogSegment {
    /// Build the segment for `target` (`None` = latest).
    pub(crate) async fn build(
        storage: &dyn StorageBackend,
        target: Option<Version>,
    ) -> DlResult<Self> {
        let commits = list_commits(storage).await?;
        let latest = commits
            .last()
            .map(|(p, _)| p.version)
            .ok_or_else(|| Error::not_found("table has no transaction log"))?;
        let end_version = match target {
            Some(v) if v > latest => {
                return Err(Error::validation(format!(
                    "version {v} does not exist (latest is {latest})"
                )))
            }
            Some(v) => v,
            None => latest,
        };

        // Prefer the `_last_checkpoint` hint, but trust the listing: a hint
        // pointing past the target or at a missing file is ignored.
        let checkpoints = list_checkpoints(storage).await?;
        let hinted = match read_last_checkpoint(storage).await {
            Ok(Some(last)) => checkpoints
                .iter()
                .find(|p| p.version == last.version && p.version <= end_version)
                .cloned(),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable _last_checkpoint");
                None
            }
        };
        let checkpoint = hinted.or_else(|| {
            checkpoints
                .iter()
                .filter(|p| p.version <= end_version)
                .next_back()
                .cloned()
        });

        let replay_from = checkpoint.as_ref().map(|c| c.version);
        let commit_files: Vec<ParsedLogPath> = commits
            .into_iter()
            .map(|(p, _)| p)
            .filter(|p| {
                p.version <= end_version && replay_from.map_or(true, |cp| p.version > cp)
            })
            .collect();

        // Versions never skip; a hole means the log is damaged (or cleaned
        // past what this checkpoint covers).
        let mut expected = replay_from.map(|cp| cp + 1).unwrap_or_else(|| {
            commit_files.first().map(|p| p.version).unwrap_or(0)
        });
        if replay_from.is_none() && commit_files.first().is_some_and(|p| p.version != 0) {
            return Err(Error::validation(format!(
                "transaction log starts at version {} with no checkpoint",
                commit_files[0].version
            )));
        }
        for file in &commit_files {
            if file.version != expected {
                return Err(Error::validation(format!(
                    "transaction log is missing version {expected}"
                )));
            }
            expected += 1;
        }

        debug!(
            end_version,
            checkpoint = ?replay_from,
            commits = commit_files.len(),
            "resolved log segment"
        );
        Ok(Self {
            checkpoint,
            commit_files,
            end_version,
        })
    }
}

/// The commit timestamp used for time travel: `commitInfo.timestamp` when
/// the commit carries one, the storage mtime otherwise.
pub(crate) async fn commit_timestamp(
    storage: &dyn StorageBackend,
    commit: &ParsedLogPath,
    fallback: DateTime<Utc>,
) -> i64 {
    match storage.read(&commit.location).await {
        Ok(bytes) => match codec::decode_commit(&bytes) {
            Ok(actions) => actions
                .iter()
                .find_map(|a| match a {
                    Action::CommitInfo(info) => Some(info.timestamp),
                    _ => None,
                })
                .unwrap_or_else(|| fallback.timestamp_millis()),
            Err(_) => fallback.timestamp_millis(),
        },
        Err(_) => fallback.timestamp_millis(),
    }
}

/// Binary-search the log for the largest version committed at or before
/// `ts_ms`. Ties resolve to the higher version.
pub(crate) async fn version_at_timestamp(
    storage: &dyn StorageBackend,
    ts_ms: i64,
) -> DlResult<Version> {
    let commits = list_commits(storage).await?;
    if commits.is_empty() {
        return Err(Error::not_found("table has no transaction log"));
    }
    let (first, first_mtime) = &commits[0];
    if commit_timestamp(storage, first, *first_mtime).await > ts_ms {
        return Err(Error::validation(format!(
            "timestamp {ts_ms} precedes the first commit"
        )));
    }
    let (mut lo, mut hi) = (0usize, commits.len() - 1);
    while lo < hi {
        let mid = (lo + hi).div_ceil(2);
        let (commit, mtime) = &commits[mid];
        if commit_timestamp(storage, commit, *mtime).await <= ts_ms {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Ok(commits[lo].0.version)
}
