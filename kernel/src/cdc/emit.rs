//! Emission of change-data files inside the commit pipeline. Files are
//! written before the commit file is created; the pipeline deletes them if
//! the commit loses.

use object_store::path::Path;
use serde_json::Value;
use tracing::debug;

use super::{
    StagedChange, CHANGE_TYPE_COLUMN, COMMIT_TIMESTAMP_COLUMN, COMMIT_VERSION_COLUMN,
};
use crate::actions::Cdc;
use crate::error::{CdcErrorCode, DlResult, Error};
use crate::parquet;
use crate::path::{cdc_date_file_path, cdc_file_path};
use crate::schema::{Row, Schema};
use crate::storage::StorageBackend;
use crate::Version;

#[derive(Debug)]
pub(crate) struct EmittedCdc {
    pub action: Cdc,
    /// Everything written; the date-partition mirror included.
    pub paths: Vec<Path>,
}

/// Stamp the staged changes with the commit version/timestamp and write the
/// change file plus its date-partition mirror.
pub(crate) async fn write_change_files(
    storage: &dyn StorageBackend,
    version: Version,
    timestamp_ms: i64,
    changes: &[StagedChange],
) -> DlResult<EmittedCdc> {
    if changes.is_empty() {
        return Err(Error::cdc(
            CdcErrorCode::EmptyWrite,
            "refusing to write a change file with no records",
        ));
    }
    let rows: Vec<Row> = changes
        .iter()
        .map(|change| {
            let mut row = change.data.clone();
            row.insert(
                CHANGE_TYPE_COLUMN.to_string(),
                Value::String(change.change_type.as_ref().to_string()),
            );
            row.insert(COMMIT_VERSION_COLUMN.to_string(), Value::from(version));
            row.insert(COMMIT_TIMESTAMP_COLUMN.to_string(), Value::from(timestamp_ms));
            row
        })
        .collect();
    let schema = Schema::infer(&rows)?;
    let bytes = parquet::encode_rows(&schema, &rows)?;

    let primary = cdc_file_path(version);
    let mirror = cdc_date_file_path(version, timestamp_ms);
    storage.write(&primary, bytes.clone()).await?;
    storage.write(&mirror, bytes.clone()).await?;
    debug!(version, records = rows.len(), path = %primary, "wrote change data");

    Ok(EmittedCdc {
        action: Cdc {
            path: primary.as_ref().to_string(),
            partition_values: Default::default(),
            size: bytes.len() as i64,
            data_change: false,
        },
        paths: vec![primary, mirror],
    })
}
