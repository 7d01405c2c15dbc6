//! Defines [`Error`], the taxonomy of everything that can go wrong inside the
//! engine, along with the predicates the retry layer and callers key off.

use strum::AsRefStr;

/// Convenient alias used throughout the crate.
pub type DlResult<T, E = Error> = std::result::Result<T, E>;

/// Sub-codes carried by [`Error::Cdc`] so consumers can react to specific
/// change-data-feed failures without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CdcErrorCode {
    InvalidVersionRange,
    InvalidTimeRange,
    TableNotFound,
    CdcNotEnabled,
    StorageError,
    ParseError,
    EmptyWrite,
}

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An object was absent where presence was required.
    #[error("Object not found: {path}")]
    NotFound { path: String },

    /// A conditional write observed a different current version than the
    /// caller expected. Surfaces to the commit pipeline as [`Error::Concurrency`].
    #[error("Version mismatch on {path}: expected {expected:?}, found {actual:?}")]
    VersionMismatch {
        path: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// A commit lost the race: the next commit file already exists.
    #[error("Commit conflict: tried to commit version {expected}, but the log is already at {actual}")]
    Concurrency { expected: u64, actual: u64 },

    /// Bad input from the caller: malformed URL, invalid range, bad
    /// projection, and friends.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Generic storage fault (quota, permission, transient network).
    #[error("Storage error during {operation} on {path}: {source}")]
    Storage {
        operation: &'static str,
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// Change-data-feed failure with a machine-readable sub-code.
    #[error("CDC error [{}]: {message}", code.as_ref())]
    Cdc { code: CdcErrorCode, message: String },

    /// File contents inconsistent with expectations (bad magic bytes,
    /// stats that contradict the data) during verified maintenance.
    #[error("Integrity check failed for {path}: {message}")]
    Integrity { path: String, message: String },

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Error interacting with object store: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Invalid JSON in commit log: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid table location: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// This is an internal error that indicates a bug in the engine.
    #[error("Internal error: {0}. This is a bug in doclake.")]
    Internal(String),
}

impl Error {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn cdc(code: CdcErrorCode, message: impl Into<String>) -> Self {
        Self::Cdc {
            code,
            message: message.into(),
        }
    }

    pub fn integrity(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Integrity {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True when the object simply wasn't there.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::ObjectStore(object_store::Error::NotFound { .. }) => true,
            _ => false,
        }
    }

    /// The default classification used by [`crate::retry::with_retry`]: only
    /// commit races are worth retrying, everything else propagates.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Concurrency { .. } | Self::VersionMismatch { .. }
        )
    }

    /// Fold storage-level conditional-write failures into the concurrency
    /// taxonomy the commit pipeline reasons about.
    pub(crate) fn into_commit_conflict(self, version: u64) -> Self {
        match self {
            Self::VersionMismatch { .. }
            | Self::ObjectStore(object_store::Error::AlreadyExists { .. })
            | Self::ObjectStore(object_store::Error::Precondition { .. }) => {
                Self::Concurrency {
                    expected: version,
                    actual: version,
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::Concurrency { expected: 3, actual: 3 }.is_retryable());
        assert!(Error::VersionMismatch {
            path: "_delta_log/x".to_string(),
            expected: None,
            actual: Some("etag-1".to_string()),
        }
        .is_retryable());
        assert!(!Error::validation("nope").is_retryable());
        assert!(!Error::not_found("gone").is_retryable());
    }

    #[test]
    fn cdc_code_renders_screaming_snake() {
        let err = Error::cdc(CdcErrorCode::InvalidVersionRange, "start > end");
        assert!(err.to_string().contains("INVALID_VERSION_RANGE"));
    }

    #[test]
    fn conflict_folding() {
        let err = Error::VersionMismatch {
            path: "_delta_log/00000000000000000005.json".to_string(),
            expected: None,
            actual: Some("v".to_string()),
        };
        match err.into_commit_conflict(5) {
            Error::Concurrency { expected, .. } => assert_eq!(expected, 5),
            other => panic!("expected concurrency error, got {other}"),
        }
    }
}
