//! Reconstructed table state at one version: the live file set, schema,
//! protocol, and per-application transaction watermarks, derived by folding
//! the log from the newest usable checkpoint.

use std::collections::HashMap;

use indexmap::IndexMap;
use tracing::debug;

use crate::actions::{Action, Add, Metadata, Protocol, Txn};
use crate::checkpoint::read_checkpoint;
use crate::error::{DlResult, Error};
use crate::log::codec;
use crate::log::segment::LogSegment;
use crate::schema::Schema;
use crate::storage::StorageBackend;
use crate::Version;

/// Immutable view of a table at a version. Mutation produces a new
/// snapshot; handles share these behind `Arc`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: Version,
    timestamp_ms: i64,
    protocol: Protocol,
    metadata: Metadata,
    files: IndexMap<String, Add>,
    txns: HashMap<String, Txn>,
}

impl Snapshot {
    /// Reconstruct the snapshot at `target` (`None` = latest).
    pub(crate) async fn try_new(
        storage: &dyn StorageBackend,
        target: Option<Version>,
    ) -> DlResult<Self> {
        let segment = LogSegment::build(storage, target).await?;
        Self::try_new_from_segment(storage, segment).await
    }

    pub(crate) async fn try_new_from_segment(
        storage: &dyn StorageBackend,
        segment: LogSegment,
    ) -> DlResult<Self> {
        let mut protocol: Option<Protocol> = None;
        let mut metadata: Option<Metadata> = None;
        let mut files: IndexMap<String, Add> = IndexMap::new();
        let mut txns: HashMap<String, Txn> = HashMap::new();
        let mut timestamp_ms: Option<i64> = None;

        let mut apply = |action: Action, timestamp: &mut Option<i64>| {
            match action {
                Action::Add(add) => {
                    files.insert(add.path.clone(), add);
                }
                Action::Remove(remove) => {
                    files.shift_remove(&remove.path);
                }
                Action::Metadata(m) => metadata = Some(m),
                Action::Protocol(p) => protocol = Some(p),
                Action::Txn(txn) => {
                    txns.insert(txn.app_id.clone(), txn);
                }
                Action::CommitInfo(info) => *timestamp = Some(info.timestamp),
                Action::Cdc(_) => {}
            };
        };

        if let Some(checkpoint) = &segment.checkpoint {
            for action in read_checkpoint(storage, checkpoint).await? {
                apply(action, &mut None);
            }
        }
        for commit in &segment.commit_files {
            let bytes = storage.read(&commit.location).await?;
            let mut commit_ts = None;
            for action in codec::decode_commit(&bytes)? {
                apply(action, &mut commit_ts);
            }
            if commit_ts.is_some() {
                timestamp_ms = commit_ts;
            }
        }
        drop(apply);

        // Snapshots built exactly at a checkpoint replay no commits; fall
        // back to the checkpoint file's mtime for a usable timestamp.
        let timestamp_ms = match timestamp_ms {
            Some(ts) => ts,
            None => match &segment.checkpoint {
                Some(checkpoint) => storage
                    .stat(&checkpoint.location)
                    .await?
                    .map(|s| s.last_modified.timestamp_millis())
                    .unwrap_or_default(),
                None => 0,
            },
        };

        let metadata = metadata.ok_or_else(|| {
            Error::validation(format!(
                "no table metadata found replaying to version {}",
                segment.end_version
            ))
        })?;
        debug!(
            version = segment.end_version,
            files = files.len(),
            "reconstructed snapshot"
        );
        Ok(Self {
            version: segment.end_version,
            timestamp_ms,
            protocol: protocol.unwrap_or_default(),
            metadata,
            files,
            txns,
        })
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Commit timestamp of the snapshot's version (ms since epoch).
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn schema(&self) -> DlResult<Schema> {
        self.metadata.schema()
    }

    /// Live files in log order.
    pub fn files(&self) -> indexmap::map::Values<'_, String, Add> {
        self.files.values()
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn total_size(&self) -> i64 {
        self.files.values().map(|a| a.size).sum()
    }

    pub fn contains_file(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub(crate) fn txns(&self) -> impl Iterator<Item = &Txn> {
        self.txns.values()
    }

    /// Highest applied transaction version for an application id.
    pub fn txn_version(&self, app_id: &str) -> Option<i64> {
        self.txns.get(app_id).map(|t| t.version)
    }

    /// Whether this snapshot's metadata carries the change-data-feed flag.
    pub fn cdc_enabled(&self) -> bool {
        self.metadata.cdc_enabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::CommitInfo;
    use crate::path::commit_path;
    use crate::schema::{DataType, Field};
    use crate::storage::in_memory;
    use std::collections::HashMap as StdHashMap;

    fn add(path: &str, size: i64) -> Add {
        Add {
            path: path.to_string(),
            partition_values: StdHashMap::new(),
            size,
            modification_time: 1700000000000,
            data_change: true,
            stats: None,
        }
    }

    async fn write_commit(storage: &dyn StorageBackend, version: Version, actions: Vec<Action>) {
        let body = codec::encode_commit(&actions).unwrap();
        storage.write(&commit_path(version), body).await.unwrap();
    }

    fn base_actions(ts: i64) -> Vec<Action> {
        let schema = Schema::new(vec![Field::new("id", DataType::String, false)]);
        vec![
            Action::CommitInfo(CommitInfo::new(ts, "CREATE")),
            Action::Protocol(Protocol::default()),
            Action::Metadata(Metadata::new(&schema, vec![], ts).unwrap()),
        ]
    }

    #[tokio::test]
    async fn replay_folds_adds_and_removes() {
        let storage = in_memory();
        write_commit(storage.as_ref(), 0, base_actions(1000)).await;
        write_commit(
            storage.as_ref(),
            1,
            vec![
                Action::CommitInfo(CommitInfo::new(2000, "WRITE")),
                Action::Add(add("part-a.parquet", 10)),
                Action::Add(add("part-b.parquet", 20)),
            ],
        )
        .await;
        write_commit(
            storage.as_ref(),
            2,
            vec![
                Action::CommitInfo(CommitInfo::new(3000, "DELETE")),
                Action::Remove(crate::actions::Remove::for_add(
                    &add("part-a.parquet", 10),
                    3000,
                    true,
                )),
            ],
        )
        .await;

        let snapshot = Snapshot::try_new(storage.as_ref(), None).await.unwrap();
        assert_eq!(snapshot.version(), 2);
        assert_eq!(snapshot.timestamp_ms(), 3000);
        assert_eq!(snapshot.num_files(), 1);
        assert!(snapshot.contains_file("part-b.parquet"));
        assert_eq!(snapshot.total_size(), 20);

        let earlier = Snapshot::try_new(storage.as_ref(), Some(1)).await.unwrap();
        assert_eq!(earlier.num_files(), 2);
        assert!(earlier.contains_file("part-a.parquet"));
    }

    #[tokio::test]
    async fn txns_and_metadata_overwrite() {
        let storage = in_memory();
        write_commit(storage.as_ref(), 0, base_actions(1000)).await;
        write_commit(
            storage.as_ref(),
            1,
            vec![Action::Txn(Txn {
                app_id: "loader".to_string(),
                version: 5,
                last_updated: None,
            })],
        )
        .await;
        write_commit(
            storage.as_ref(),
            2,
            vec![Action::Txn(Txn {
                app_id: "loader".to_string(),
                version: 9,
                last_updated: None,
            })],
        )
        .await;

        let snapshot = Snapshot::try_new(storage.as_ref(), None).await.unwrap();
        assert_eq!(snapshot.txn_version("loader"), Some(9));
        assert_eq!(snapshot.txn_version("other"), None);
    }
}
