//! Names and parsing for everything that lives under a table root: commit
//! files, checkpoints, data parts, and the change-data tree.
//!
//! Version numbers in file names are always exactly 20 zero-padded decimal
//! digits; anything else is not a log file.

use chrono::{DateTime, Utc};
use object_store::path::Path;

use crate::Version;

pub(crate) const DELTA_LOG_DIR: &str = "_delta_log";
pub(crate) const LAST_CHECKPOINT_NAME: &str = "_last_checkpoint";
pub(crate) const CHANGE_DATA_DIR: &str = "_change_data";
pub(crate) const CDC_CONFIG_NAME: &str = "_cdc_config.json";
pub(crate) const CDC_OFFSETS_DIR: &str = "_cdc_offsets";

/// A file in `_delta_log/` that we recognized, along with the version baked
/// into its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedLogPath {
    pub location: Path,
    pub version: Version,
    pub file_type: LogPathFileType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogPathFileType {
    Commit,
    Checkpoint,
}

impl ParsedLogPath {
    /// Classify a path under the table root. Returns `None` for anything
    /// that is not a commit or checkpoint file (`_last_checkpoint`, temp
    /// files, directory markers).
    pub(crate) fn try_from(location: Path) -> Option<Self> {
        let filename = location.filename()?;
        let (version_part, file_type) =
            if let Some(stripped) = filename.strip_suffix(".checkpoint.parquet") {
                (stripped, LogPathFileType::Checkpoint)
            } else if let Some(stripped) = filename.strip_suffix(".json") {
                (stripped, LogPathFileType::Commit)
            } else {
                return None;
            };
        if version_part.len() != 20 || !version_part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let version = version_part.parse().ok()?;
        Some(Self {
            location,
            version,
            file_type,
        })
    }

    pub(crate) fn is_commit(&self) -> bool {
        self.file_type == LogPathFileType::Commit
    }

    pub(crate) fn is_checkpoint(&self) -> bool {
        self.file_type == LogPathFileType::Checkpoint
    }
}

/// `_delta_log/{version:020}.json`
pub(crate) fn commit_path(version: Version) -> Path {
    Path::from(format!("{DELTA_LOG_DIR}/{version:020}.json"))
}

/// `_delta_log/{version:020}.checkpoint.parquet`
pub(crate) fn checkpoint_path(version: Version) -> Path {
    Path::from(format!("{DELTA_LOG_DIR}/{version:020}.checkpoint.parquet"))
}

/// `_delta_log/_last_checkpoint`
pub(crate) fn last_checkpoint_path() -> Path {
    Path::from(format!("{DELTA_LOG_DIR}/{LAST_CHECKPOINT_NAME}"))
}

/// `part-{version:020}-{seq}.parquet`, written at the table root.
pub(crate) fn data_file_path(version: Version, seq: usize) -> Path {
    Path::from(format!("part-{version:020}-{seq}.parquet"))
}

/// `_change_data/cdc-{version:020}.parquet`
pub(crate) fn cdc_file_path(version: Version) -> Path {
    Path::from(format!("{CHANGE_DATA_DIR}/cdc-{version:020}.parquet"))
}

/// The date-partitioned mirror of [`cdc_file_path`]. The date is the commit
/// timestamp's UTC calendar date.
pub(crate) fn cdc_date_file_path(version: Version, commit_ts_ms: i64) -> Path {
    let date = DateTime::<Utc>::from_timestamp_millis(commit_ts_ms)
        .unwrap_or_else(Utc::now)
        .format("%Y-%m-%d");
    Path::from(format!(
        "{CHANGE_DATA_DIR}/date={date}/cdc-{version:020}.parquet"
    ))
}

/// `_cdc_offsets/{group}/{topic}/{partition}.json`
pub(crate) fn offset_path(group: &str, topic: &str, partition: i32) -> Path {
    Path::from(format!("{CDC_OFFSETS_DIR}/{group}/{topic}/{partition}.json"))
}

/// True for paths the vacuum scan must never consider data files.
pub(crate) fn is_internal_path(path: &Path) -> bool {
    let head = path.parts().next();
    match head {
        Some(part) => {
            let part = part.as_ref();
            part == DELTA_LOG_DIR
                || part == CHANGE_DATA_DIR
                || part == CDC_OFFSETS_DIR
                || part == CDC_CONFIG_NAME
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_paths_are_twenty_digits() {
        assert_eq!(
            commit_path(0).as_ref(),
            "_delta_log/00000000000000000000.json"
        );
        assert_eq!(
            commit_path(123).as_ref(),
            "_delta_log/00000000000000000123.json"
        );
    }

    #[test]
    fn parse_commit_and_checkpoint() {
        let parsed = ParsedLogPath::try_from(commit_path(7)).unwrap();
        assert_eq!(parsed.version, 7);
        assert!(parsed.is_commit());

        let parsed = ParsedLogPath::try_from(checkpoint_path(10)).unwrap();
        assert_eq!(parsed.version, 10);
        assert!(parsed.is_checkpoint());
    }

    #[test]
    fn rejects_non_log_files() {
        assert!(ParsedLogPath::try_from(last_checkpoint_path()).is_none());
        assert!(ParsedLogPath::try_from(Path::from("_delta_log/123.json")).is_none());
        assert!(ParsedLogPath::try_from(Path::from("_delta_log/notanumber.json")).is_none());
        assert!(ParsedLogPath::try_from(Path::from("part-00000000000000000001-0.parquet")).is_none());
    }

    #[test]
    fn cdc_date_partition_uses_utc_date() {
        // 2024-03-01T23:59:59Z
        let path = cdc_date_file_path(4, 1709337599000);
        assert_eq!(
            path.as_ref(),
            "_change_data/date=2024-03-01/cdc-00000000000000000004.parquet"
        );
        // one second later rolls the date
        let path = cdc_date_file_path(4, 1709337600000);
        assert!(path.as_ref().starts_with("_change_data/date=2024-03-02/"));
    }

    #[test]
    fn internal_paths() {
        assert!(is_internal_path(&commit_path(1)));
        assert!(is_internal_path(&Path::from("_cdc_config.json")));
        assert!(is_internal_path(&cdc_file_path(2)));
        assert!(!is_internal_path(&data_file_path(3, 0)));
    }
}
