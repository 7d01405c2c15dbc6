//! The table handle: entry point for reads, writes, maintenance, and the
//! change data feed. A handle is cheap to share; all state lives in the
//! store, with one cached snapshot per handle.

use std::sync::Arc;

use bytes::Bytes;
use object_store::path::Path;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::actions::CommitInfo;
use crate::cdc::reader::CdcReader;
use crate::cdc::subscribe::{
    ChangeHandler, ErrorSink, SubscriberRegistry, SubscriptionHandle,
};
use crate::cdc::{read_cdc_config, write_cdc_config, ChangeRecord};
use crate::config::EngineConfig;
use crate::error::DlResult;
use crate::log::{codec, segment};
use crate::metrics::EngineMetrics;
use crate::parquet;
use crate::query::{file_may_match, Filter, Projection};
use crate::schema::Row;
use crate::snapshot::Snapshot;
use crate::storage::{parse_table_url, StorageBackend, StorageOptions, StorageRef};
use crate::Version;

/// A handle to one table in a store.
pub struct Table {
    location: String,
    storage: StorageRef,
    config: EngineConfig,
    metrics: Arc<EngineMetrics>,
    snapshot_cache: RwLock<Option<Arc<Snapshot>>>,
    subscribers: Arc<SubscriberRegistry>,
}

/// Summary row for [`Table::history`].
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub version: Version,
    pub info: Option<CommitInfo>,
}

/// Point-in-time description of the table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDetail {
    pub location: String,
    pub version: Version,
    pub num_files: usize,
    pub total_bytes: i64,
    pub partition_columns: Vec<String>,
    pub cdc_enabled: bool,
}

impl Table {
    /// Open a table at a storage URL (`memory://`, `file:///…`, `/abs`,
    /// `s3://…`, `r2://…`).
    pub fn open(location: impl Into<String>) -> DlResult<Self> {
        Self::open_with(location, &StorageOptions::default(), EngineConfig::new())
    }

    pub fn open_with(
        location: impl Into<String>,
        options: &StorageOptions,
        config: EngineConfig,
    ) -> DlResult<Self> {
        let location = location.into();
        let storage = parse_table_url(&location, options)?;
        Ok(Self::from_storage_at(location, storage, config))
    }

    /// Wire a table directly to a storage backend, bypassing URL parsing.
    pub fn from_storage(storage: StorageRef, config: EngineConfig) -> Self {
        Self::from_storage_at("<custom>".to_string(), storage, config)
    }

    fn from_storage_at(location: String, storage: StorageRef, config: EngineConfig) -> Self {
        Self {
            location,
            storage,
            config,
            metrics: Arc::new(EngineMetrics::default()),
            snapshot_cache: RwLock::new(None),
            subscribers: Arc::new(SubscriberRegistry::default()),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub(crate) fn storage(&self) -> &dyn StorageBackend {
        self.storage.as_ref()
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub(crate) fn subscribers(&self) -> &Arc<SubscriberRegistry> {
        &self.subscribers
    }

    // ------------------------------------------------------------------
    // Snapshots & time travel

    /// The latest snapshot, cached until the next successful commit or
    /// [`Table::refresh`].
    pub async fn snapshot(&self) -> DlResult<Arc<Snapshot>> {
        if let Some(snapshot) = self.snapshot_cache.read().await.clone() {
            return Ok(snapshot);
        }
        self.refresh().await
    }

    /// Re-derive the latest snapshot from storage.
    pub async fn refresh(&self) -> DlResult<Arc<Snapshot>> {
        let snapshot = Arc::new(Snapshot::try_new(self.storage(), None).await?);
        *self.snapshot_cache.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Snapshot at an exact version.
    pub async fn snapshot_at(&self, version: Version) -> DlResult<Arc<Snapshot>> {
        Ok(Arc::new(
            Snapshot::try_new(self.storage(), Some(version)).await?,
        ))
    }

    /// Snapshot at the largest version committed at or before `ts_ms`.
    pub async fn snapshot_at_timestamp(&self, ts_ms: i64) -> DlResult<Arc<Snapshot>> {
        let version = segment::version_at_timestamp(self.storage(), ts_ms).await?;
        self.snapshot_at(version).await
    }

    pub async fn version(&self) -> DlResult<Version> {
        Ok(self.snapshot().await?.version())
    }

    /// Fresh (uncached) latest snapshot; `None` when the table has no log
    /// yet. Commit attempts must see other writers' commits.
    pub(crate) async fn latest_snapshot_opt(&self) -> DlResult<Option<Arc<Snapshot>>> {
        match Snapshot::try_new(self.storage(), None).await {
            Ok(snapshot) => Ok(Some(Arc::new(snapshot))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn replace_cached_snapshot(&self, snapshot: Option<Arc<Snapshot>>) {
        *self.snapshot_cache.write().await = snapshot;
    }

    // ------------------------------------------------------------------
    // Reads

    /// Query the latest snapshot with a MongoDB-style filter and an
    /// optional projection (`Value::Null` selects everything).
    pub async fn query(&self, filter: Value, projection: Value) -> DlResult<Vec<Row>> {
        let snapshot = self.snapshot().await?;
        self.query_snapshot(&snapshot, filter, projection).await
    }

    /// Query at a historical version.
    pub async fn query_at(
        &self,
        version: Version,
        filter: Value,
        projection: Value,
    ) -> DlResult<Vec<Row>> {
        let snapshot = self.snapshot_at(version).await?;
        self.query_snapshot(&snapshot, filter, projection).await
    }

    pub(crate) async fn query_snapshot(
        &self,
        snapshot: &Snapshot,
        filter: Value,
        projection: Value,
    ) -> DlResult<Vec<Row>> {
        let filter = Filter::new(filter)?;
        let projection = Projection::from_value(&projection)?;
        let mut out = Vec::new();
        for add in snapshot.files() {
            if !file_may_match(&filter, add) {
                EngineMetrics::incr(&self.metrics.files_pruned);
                continue;
            }
            for row in self.read_file_rows(&add.path).await? {
                if filter.matches(&row) {
                    out.push(projection.apply(&row));
                }
            }
        }
        debug!(rows = out.len(), "query finished");
        Ok(out)
    }

    /// Read one live data file back into rows.
    pub(crate) async fn read_file_rows(&self, path: &str) -> DlResult<Vec<Row>> {
        let bytes = self.storage.read(&Path::from(path)).await?;
        let rows = parquet::decode_rows(bytes)?;
        EngineMetrics::incr(&self.metrics.files_read);
        EngineMetrics::add(&self.metrics.rows_read, rows.len() as u64);
        Ok(rows)
    }

    pub(crate) async fn read_file_bytes(&self, path: &str) -> DlResult<Bytes> {
        self.storage.read(&Path::from(path)).await
    }

    // ------------------------------------------------------------------
    // Introspection

    /// Per-version commit info, newest first.
    pub async fn history(&self, limit: Option<usize>) -> DlResult<Vec<HistoryEntry>> {
        let mut commits = segment::list_commits(self.storage()).await?;
        commits.reverse();
        if let Some(limit) = limit {
            commits.truncate(limit);
        }
        let mut entries = Vec::with_capacity(commits.len());
        for (commit, _) in commits {
            let bytes = self.storage.read(&commit.location).await?;
            let info = codec::decode_commit(&bytes)?
                .into_iter()
                .find_map(|action| match action {
                    crate::actions::Action::CommitInfo(info) => Some(info),
                    _ => None,
                });
            entries.push(HistoryEntry {
                version: commit.version,
                info,
            });
        }
        Ok(entries)
    }

    pub async fn detail(&self) -> DlResult<TableDetail> {
        let snapshot = self.snapshot().await?;
        Ok(TableDetail {
            location: self.location.clone(),
            version: snapshot.version(),
            num_files: snapshot.num_files(),
            total_bytes: snapshot.total_size(),
            partition_columns: snapshot.metadata().partition_columns.clone(),
            cdc_enabled: self.cdc_enabled().await,
        })
    }

    // ------------------------------------------------------------------
    // Change data feed surface

    /// Whether the change data feed is on, per `_cdc_config.json`.
    pub async fn cdc_enabled(&self) -> bool {
        read_cdc_config(self.storage()).await
    }

    /// Turn the feed on. Takes effect for subsequent commits; the next
    /// commit also records the flag in the table metadata.
    pub async fn enable_cdc(&self) -> DlResult<()> {
        write_cdc_config(self.storage(), true).await
    }

    pub async fn disable_cdc(&self) -> DlResult<()> {
        write_cdc_config(self.storage(), false).await
    }

    pub fn cdc_reader(&self) -> CdcReader {
        CdcReader::new(self.storage.clone())
    }

    /// A change-feed consumer for this table, tracking its position in the
    /// given offset storage under `(group, topic, partition)`.
    pub fn cdc_consumer(
        &self,
        offsets: Arc<dyn crate::cdc::offsets::OffsetStorage>,
        group: impl Into<String>,
        partition: i32,
    ) -> crate::cdc::offsets::CdcConsumer {
        crate::cdc::offsets::CdcConsumer::new(
            self.cdc_reader(),
            offsets,
            group,
            self.location.clone(),
            partition,
            self.config.auto_commit.clone(),
        )
    }

    /// Register a raw change handler with an optional error sink.
    pub fn subscribe(
        &self,
        handler: ChangeHandler,
        error_sink: Option<ErrorSink>,
    ) -> SubscriptionHandle {
        self.subscribers.subscribe(handler, error_sink)
    }

    /// Register an async closure as a change handler.
    pub fn subscribe_fn<F, Fut>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(ChangeRecord) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>>
            + Send
            + 'static,
    {
        self.subscribers.subscribe_fn(handler)
    }

    /// Ensure a table exists at this location, creating an empty one with
    /// `schema` (and optional partition columns) when absent.
    pub async fn create_if_absent(
        &self,
        schema: &crate::schema::Schema,
        partition_columns: Vec<String>,
    ) -> DlResult<Option<crate::transaction::CommitResult>> {
        if self.latest_snapshot_opt().await?.is_some() {
            return Ok(None);
        }
        self.create_table_commit(schema, partition_columns)
            .await
            .map(Some)
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("location", &self.location)
            .finish()
    }
}
