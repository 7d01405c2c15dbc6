//! Consumer offset tracking keyed by `(group, topic, partition)`, plus the
//! stateful consumer that reads the change feed and remembers where it
//! stopped. Auto-commit failures are logged, never raised.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::reader::CdcReader;
use super::ChangeRecord;
use crate::config::AutoCommitConfig;
use crate::error::DlResult;
use crate::path::offset_path;
use crate::storage::StorageRef;
use crate::Version;

/// One committed consumer position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedOffset {
    pub offset: Version,
    pub partition: i32,
    pub committed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

/// Where consumer offsets live. Keys are independent; there is no
/// cross-key coordination.
#[async_trait]
pub trait OffsetStorage: Send + Sync + std::fmt::Debug {
    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        offset: CommittedOffset,
    ) -> DlResult<()>;

    async fn get(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> DlResult<Option<CommittedOffset>>;

    async fn reset(&self, group: &str, topic: &str, partition: i32) -> DlResult<()>;
}

/// Process-local offset storage, mostly for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemoryOffsetStorage {
    offsets: std::sync::Mutex<HashMap<(String, String, i32), CommittedOffset>>,
}

#[async_trait]
impl OffsetStorage for InMemoryOffsetStorage {
    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        offset: CommittedOffset,
    ) -> DlResult<()> {
        if let Ok(mut offsets) = self.offsets.lock() {
            offsets.insert((group.to_string(), topic.to_string(), partition), offset);
        }
        Ok(())
    }

    async fn get(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> DlResult<Option<CommittedOffset>> {
        Ok(self.offsets.lock().ok().and_then(|offsets| {
            offsets
                .get(&(group.to_string(), topic.to_string(), partition))
                .cloned()
        }))
    }

    async fn reset(&self, group: &str, topic: &str, partition: i32) -> DlResult<()> {
        if let Ok(mut offsets) = self.offsets.lock() {
            offsets.remove(&(group.to_string(), topic.to_string(), partition));
        }
        Ok(())
    }
}

/// Offsets persisted in the table's store under `_cdc_offsets/`.
#[derive(Debug)]
pub struct BlobOffsetStorage {
    storage: StorageRef,
}

impl BlobOffsetStorage {
    pub fn new(storage: StorageRef) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl OffsetStorage for BlobOffsetStorage {
    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        offset: CommittedOffset,
    ) -> DlResult<()> {
        let path = offset_path(group, topic, partition);
        self.storage
            .write(&path, serde_json::to_vec(&offset)?.into())
            .await
    }

    async fn get(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> DlResult<Option<CommittedOffset>> {
        let path = offset_path(group, topic, partition);
        match self.storage.read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn reset(&self, group: &str, topic: &str, partition: i32) -> DlResult<()> {
        self.storage.delete(&offset_path(group, topic, partition)).await
    }
}

/// A change-feed consumer with a remembered read position.
pub struct CdcConsumer {
    reader: CdcReader,
    offsets: Arc<dyn OffsetStorage>,
    group: String,
    topic: String,
    partition: i32,
    auto_commit: AutoCommitConfig,
    state: Mutex<ConsumerState>,
}

struct ConsumerState {
    /// Next commit version to read.
    position: Version,
    cached_offset: Option<CommittedOffset>,
    last_auto_commit: Option<Instant>,
}

impl CdcConsumer {
    pub fn new(
        reader: CdcReader,
        offsets: Arc<dyn OffsetStorage>,
        group: impl Into<String>,
        topic: impl Into<String>,
        partition: i32,
        auto_commit: AutoCommitConfig,
    ) -> Self {
        Self {
            reader,
            offsets,
            group: group.into(),
            topic: topic.into(),
            partition,
            auto_commit,
            state: Mutex::new(ConsumerState {
                position: 0,
                cached_offset: None,
                last_auto_commit: None,
            }),
        }
    }

    /// Read everything committed at or past the current position, advance
    /// it, and maybe auto-commit.
    pub async fn poll(&self) -> DlResult<Vec<ChangeRecord>> {
        let mut state = self.state.lock().await;
        let Some(latest) = self.reader.latest_change_version().await? else {
            return Ok(vec![]);
        };
        if latest < state.position {
            return Ok(vec![]);
        }
        let records = self
            .reader
            .read_by_version(state.position, latest)
            .await?;
        state.position = latest + 1;

        if self.auto_commit.enabled && !records.is_empty() {
            let due = match (self.auto_commit.interval, state.last_auto_commit) {
                (Some(interval), Some(last)) => last.elapsed() >= interval,
                _ => true,
            };
            if due {
                let offset = self.offset_at(latest);
                if let Err(e) = self
                    .offsets
                    .commit(&self.group, &self.topic, self.partition, offset.clone())
                    .await
                {
                    warn!(group = %self.group, error = %e, "auto-commit failed");
                } else {
                    state.cached_offset = Some(offset);
                    state.last_auto_commit = Some(Instant::now());
                }
            }
        }
        Ok(records)
    }

    fn offset_at(&self, version: Version) -> CommittedOffset {
        CommittedOffset {
            offset: version,
            partition: self.partition,
            committed_at: Utc::now().timestamp_millis(),
            metadata: None,
        }
    }

    /// Commit an explicit offset.
    pub async fn commit(&self, version: Version) -> DlResult<()> {
        let offset = self.offset_at(version);
        self.offsets
            .commit(&self.group, &self.topic, self.partition, offset.clone())
            .await?;
        self.state.lock().await.cached_offset = Some(offset);
        Ok(())
    }

    /// Commit the last consumed version, if anything was consumed.
    pub async fn commit_current(&self) -> DlResult<()> {
        let position = self.state.lock().await.position;
        if position == 0 {
            return Ok(());
        }
        self.commit(position - 1).await
    }

    /// The stored committed offset; `bypass_cache` forces a storage read.
    pub async fn get_committed(&self, bypass_cache: bool) -> DlResult<Option<CommittedOffset>> {
        if !bypass_cache {
            if let Some(cached) = self.state.lock().await.cached_offset.clone() {
                return Ok(Some(cached));
            }
        }
        let stored = self
            .offsets
            .get(&self.group, &self.topic, self.partition)
            .await?;
        self.state.lock().await.cached_offset = stored.clone();
        Ok(stored)
    }

    /// Seek the read position to just past the stored offset.
    pub async fn resume_from_committed(&self) -> DlResult<Version> {
        let committed = self.get_committed(true).await?;
        let mut state = self.state.lock().await;
        state.position = committed.map(|o| o.offset + 1).unwrap_or(0);
        debug!(position = state.position, "consumer resumed");
        Ok(state.position)
    }

    /// Forget the stored offset and rewind to the beginning.
    pub async fn reset(&self) -> DlResult<()> {
        self.offsets
            .reset(&self.group, &self.topic, self.partition)
            .await?;
        let mut state = self.state.lock().await;
        state.cached_offset = None;
        state.position = 0;
        Ok(())
    }
}
