use std::path::PathBuf;

use haven_types::JournalSeq;
use rusqlite::ErrorCode;
use thiserror::Error;

/// Failures surfaced by the durable store.
///
/// `StorageFull`, `StorageCorrupt` and `WriteTimeout` are classified from
/// SQLite result codes so callers can react without inspecting driver errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage is full")]
    StorageFull,
    #[error("storage is corrupt: {detail}")]
    StorageCorrupt { detail: String },
    /// The database stayed locked past the busy timeout. Retry with backoff.
    #[error("timed out waiting for the database write lock")]
    WriteTimeout,
    #[error("journal entry {seq} cannot commit while entry {pending} is still pending")]
    OutOfOrderCommit { seq: JournalSeq, pending: JournalSeq },
    #[error("key '{key}' belongs to an engine partition")]
    PartitionViolation { key: String },
    #[error("journal entry {0} does not exist or is already resolved")]
    UnknownJournalEntry(JournalSeq),
    #[error("transaction already failed; it can only roll back")]
    TransactionAborted,
    #[error("invalid row in {table}: {detail}")]
    InvalidRow { table: &'static str, detail: String },
    #[error("sqlite error: {0}")]
    Sqlite(#[source] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl StoreError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, StoreError::WriteTimeout)
    }

    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, StoreError::StorageCorrupt { .. })
    }

    pub(crate) fn invalid_row(table: &'static str, detail: impl ToString) -> Self {
        StoreError::InvalidRow {
            table,
            detail: detail.to_string(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => StoreError::StorageFull,
            Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) => {
                StoreError::StorageCorrupt {
                    detail: err.to_string(),
                }
            }
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => StoreError::WriteTimeout,
            _ => StoreError::Sqlite(err),
        }
    }
}
