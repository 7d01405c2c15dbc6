//! doclake: a log-structured, ACID table engine for JSON documents that
//! speaks the Delta transaction-log protocol over any object store.
//!
//! A table is a path prefix in a store: data lives in immutable Parquet
//! parts, state transitions live in `_delta_log/` as numbered commit files
//! of newline-delimited actions. Writers race for the next commit file
//! with a conditional create; readers reconstruct any version by folding
//! the log from the newest checkpoint.
//!
//! # Example
//!
//! ```no_run
//! # use serde_json::json;
//! # async fn example() -> doclake::DlResult<()> {
//! let table = doclake::Table::open("memory://demo")?;
//! table
//!     .insert(vec![json!({"id": "1", "name": "Alice", "value": 100})
//!         .as_object()
//!         .cloned()
//!         .unwrap()])
//!     .await?;
//! let rows = table
//!     .query(json!({"name": "Alice"}), serde_json::Value::Null)
//!     .await?;
//! assert_eq!(rows.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! Feature highlights:
//! - INSERT / UPDATE / DELETE / MERGE under optimistic concurrency
//! - time travel by version and by timestamp
//! - per-commit change data capture with subscriptions and consumer
//!   offsets
//! - maintenance: compaction, Z-order clustering, deduplication, vacuum,
//!   checkpoints and log cleanup
//! - MongoDB-style filters with zone-map file pruning

pub mod actions;
pub mod cdc;
mod checkpoint;
pub mod config;
mod error;
mod log;
mod metrics;
pub mod operations;
mod parquet;
mod path;
pub mod query;
pub mod retry;
pub mod schema;
mod snapshot;
pub mod storage;
mod table;
mod transaction;
mod writer;

pub use cdc::{ChangeRecord, ChangeType};
pub use checkpoint::LastCheckpoint;
pub use config::{default_retry_config, set_default_retry_config, EngineConfig, RetryConfig};
pub use error::{CdcErrorCode, DlResult, Error};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use query::{Filter, Projection};
pub use schema::{DataType, Field, Row, Schema};
pub use snapshot::Snapshot;
pub use table::{HistoryEntry, Table, TableDetail};
pub use transaction::CommitResult;

/// A table version: a non-negative, gap-free sequence number. Version 0 is
/// the initial commit.
pub type Version = u64;
