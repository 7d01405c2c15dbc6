//! Change Data Capture: per-commit change files written atomically with the
//! commit, a reader over version and time ranges, live subscriptions, and
//! consumer offset tracking.
//!
//! The enabled bit lives in `_cdc_config.json` at the table root and is
//! read without coordination; a missing or corrupt file means disabled.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, EnumString};
use tracing::warn;

use crate::error::DlResult;
use crate::path::CDC_CONFIG_NAME;
use crate::schema::Row;
use crate::storage::StorageBackend;
use crate::Version;

pub(crate) mod emit;
pub mod offsets;
pub mod reader;
pub mod subscribe;

/// Reserved columns added to every change record.
pub const CHANGE_TYPE_COLUMN: &str = "_change_type";
pub const COMMIT_VERSION_COLUMN: &str = "_commit_version";
pub const COMMIT_TIMESTAMP_COLUMN: &str = "_commit_timestamp";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeType {
    Insert,
    UpdatePreimage,
    UpdatePostimage,
    Delete,
}

/// One row-level change staged by an operation, before the commit version
/// and timestamp are known.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StagedChange {
    pub change_type: ChangeType,
    pub data: Row,
}

impl StagedChange {
    pub(crate) fn new(change_type: ChangeType, data: Row) -> Self {
        Self { change_type, data }
    }
}

/// One fully-attributed change record as read back from a change file.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub change_type: ChangeType,
    pub commit_version: Version,
    pub commit_timestamp: i64,
    /// The row payload, reserved columns stripped.
    pub data: Row,
}

impl ChangeRecord {
    pub(crate) fn from_row(mut row: Row) -> Option<Self> {
        let change_type = match row.remove(CHANGE_TYPE_COLUMN)? {
            Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        let commit_version = match row.remove(COMMIT_VERSION_COLUMN)? {
            Value::Number(n) => n.as_u64()?,
            Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        let commit_timestamp = match row.remove(COMMIT_TIMESTAMP_COLUMN)? {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        Some(Self {
            change_type,
            commit_version,
            commit_timestamp,
            data: row,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct CdcConfig {
    pub enabled: bool,
}

/// Read the CDC-enabled bit. Absence and corruption both read as disabled.
pub(crate) async fn read_cdc_config(storage: &dyn StorageBackend) -> bool {
    let path = object_store::path::Path::from(CDC_CONFIG_NAME);
    match storage.read(&path).await {
        Ok(bytes) => match serde_json::from_slice::<CdcConfig>(&bytes) {
            Ok(config) => config.enabled,
            Err(e) => {
                warn!(error = %e, "malformed _cdc_config.json, treating CDC as disabled");
                false
            }
        },
        Err(_) => false,
    }
}

pub(crate) async fn write_cdc_config(storage: &dyn StorageBackend, enabled: bool) -> DlResult<()> {
    let path = object_store::path::Path::from(CDC_CONFIG_NAME);
    let body = serde_json::to_vec(&CdcConfig { enabled })?;
    storage.write(&path, body.into()).await
}
