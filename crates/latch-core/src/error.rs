//! Error types for distributed lock operations
//!
//! `LockError` is the caller-facing taxonomy; values compare by kind so
//! callers can branch on the variant rather than on message text.
//! `StoreError` classifies transport-level failures from a backing store
//! and decides what the retry loops may absorb.

use std::sync::Arc;

/// Caller-facing error for lock and manager operations.
///
/// Equality compares the variant only, never the message or cause, so
/// `TryLock` callers can match on `LockError::LockUnavailable` without
/// string inspection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("lock is held by another session")]
    LockUnavailable,

    #[error("session is not available")]
    SessionUnavailable,

    #[error("sync manager stopped")]
    ManagerStopped,

    #[error("lock key is required but missing")]
    InvalidKey,

    #[error("existing entry conflicts with lock use of the key")]
    KeyConflict,

    #[error("lock attempt cancelled")]
    Cancelled,

    #[error("leadership is not initialized")]
    NotInitialized,

    #[error("failed to release locks [{}]", keys.join(", "))]
    ReleaseFailed { keys: Vec<String> },

    #[error("store error: {0}")]
    Store(Arc<anyhow::Error>),
}

impl PartialEq for LockError {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for LockError {}

impl From<StoreError> for LockError {
    fn from(e: StoreError) -> Self {
        LockError::Store(Arc::new(e.into()))
    }
}

/// Transport-level error from a backing coordination store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request timed out")]
    Timeout,

    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store returned status {status}: {message}")]
    Server { status: u16, message: String },

    #[error("unexpected store response: {0}")]
    Decode(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    /// Whether the failure is transient and safe to retry after a pause.
    ///
    /// Timeouts, connection failures and server-side (5xx) errors are
    /// retryable; malformed responses and client-side rejections are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Timeout | StoreError::Connection(_) => true,
            StoreError::Server { status, .. } => *status >= 500,
            StoreError::Decode(_) | StoreError::Other(_) => false,
        }
    }
}
