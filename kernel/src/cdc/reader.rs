//! Reading committed change data back out, by version range or time range.
//! Versions with no change file (feed off, or file lost) yield nothing;
//! corrupt files degrade to empty for that version.

use object_store::path::Path;
use tracing::warn;

use super::ChangeRecord;
use crate::error::{CdcErrorCode, DlResult, Error};
use crate::log::segment;
use crate::parquet;
use crate::path::CHANGE_DATA_DIR;
use crate::storage::StorageRef;
use crate::Version;

pub struct CdcReader {
    storage: StorageRef,
}

impl CdcReader {
    pub(crate) fn new(storage: StorageRef) -> Self {
        Self { storage }
    }

    /// Change records with `start <= _commit_version <= end`, ordered by
    /// version, insertion order within a commit.
    pub async fn read_by_version(
        &self,
        start: Version,
        end: Version,
    ) -> DlResult<Vec<ChangeRecord>> {
        if start > end {
            return Err(Error::cdc(
                CdcErrorCode::InvalidVersionRange,
                format!("start version {start} is greater than end version {end}"),
            ));
        }
        self.ensure_table_exists().await?;
        let mut files = self.change_files().await?;
        files.retain(|(version, _)| *version >= start && *version <= end);
        files.sort_by_key(|(version, _)| *version);

        let mut records = Vec::new();
        for (version, path) in files {
            records.extend(self.read_change_file(version, &path).await);
        }
        Ok(records)
    }

    /// Change records with commit timestamps in `[start_ms, end_ms]`.
    pub async fn read_by_timestamp(
        &self,
        start_ms: i64,
        end_ms: i64,
    ) -> DlResult<Vec<ChangeRecord>> {
        if start_ms > end_ms {
            return Err(Error::cdc(
                CdcErrorCode::InvalidTimeRange,
                format!("start {start_ms} is after end {end_ms}"),
            ));
        }
        self.ensure_table_exists().await?;
        let mut files = self.change_files().await?;
        files.sort_by_key(|(version, _)| *version);

        let mut records = Vec::new();
        for (version, path) in files {
            let file_records = self.read_change_file(version, &path).await;
            records.extend(
                file_records
                    .into_iter()
                    .filter(|r| r.commit_timestamp >= start_ms && r.commit_timestamp <= end_ms),
            );
        }
        Ok(records)
    }

    /// The latest version with a change file, if any.
    pub async fn latest_change_version(&self) -> DlResult<Option<Version>> {
        Ok(self
            .change_files()
            .await?
            .into_iter()
            .map(|(version, _)| version)
            .max())
    }

    async fn ensure_table_exists(&self) -> DlResult<()> {
        match segment::latest_version(self.storage.as_ref()).await? {
            Some(_) => Ok(()),
            None => Err(Error::cdc(
                CdcErrorCode::TableNotFound,
                "table has no transaction log",
            )),
        }
    }

    /// Primary change files (the date-partition mirrors are excluded).
    async fn change_files(&self) -> DlResult<Vec<(Version, Path)>> {
        let prefix = Path::from(CHANGE_DATA_DIR);
        let entries = match self.storage.list(Some(&prefix)).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(vec![]),
            Err(e) => {
                return Err(Error::cdc(
                    CdcErrorCode::StorageError,
                    format!("listing change data failed: {e}"),
                ))
            }
        };
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let filename = entry.path.filename()?;
                // date=…/cdc-… mirrors have an extra path segment
                if entry.path.parts().count() != 2 {
                    return None;
                }
                let version_part = filename
                    .strip_prefix("cdc-")?
                    .strip_suffix(".parquet")?;
                if version_part.len() != 20 {
                    return None;
                }
                let version = version_part.parse().ok()?;
                Some((version, entry.path))
            })
            .collect())
    }

    async fn read_change_file(&self, version: Version, path: &Path) -> Vec<ChangeRecord> {
        let bytes = match self.storage.read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(version, path = %path, error = %e, "change file unreadable, skipping");
                return vec![];
            }
        };
        match parquet::decode_rows(bytes) {
            Ok(rows) => rows
                .into_iter()
                .filter_map(ChangeRecord::from_row)
                .collect(),
            Err(e) => {
                warn!(version, path = %path, error = %e, "change file corrupt, skipping");
                vec![]
            }
        }
    }
}
