use confab_shared::IdentityError;
use confab_store::StoreError;
use thiserror::Error;

/// Errors returned by [`ChatFacade`](crate::ChatFacade) operations.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Malformed ids, self-messaging, empty body. Never retried.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Transient; the whole logical operation may be retried.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::StorageUnavailable(_))
    }
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidArgument(msg) => ChatError::InvalidArgument(msg),
            StoreError::Identity(e) => ChatError::InvalidArgument(e.to_string()),
            StoreError::Forbidden(msg) => ChatError::Forbidden(msg),
            StoreError::Conflict(msg) => ChatError::Conflict(msg),
            StoreError::NotFound(msg) => ChatError::NotFound(msg),
            StoreError::StorageUnavailable(msg) => ChatError::StorageUnavailable(msg),
            other => {
                tracing::error!(error = %other, "store failure");
                ChatError::Internal(other.to_string())
            }
        }
    }
}

impl From<IdentityError> for ChatError {
    fn from(e: IdentityError) -> Self {
        ChatError::InvalidArgument(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
