use confab_shared::IdentityError;
use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error that is not a transient lock condition.
    #[error("Database error: {0}")]
    Sqlite(rusqlite::Error),

    /// The database is busy or locked; the whole operation may be retried.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Rejected before any write.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The actor is not allowed to perform this mutation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The requested state change contradicts the current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed identifiers.
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::StorageUnavailable(e.to_string())
            }
            _ => StoreError::Sqlite(e),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
