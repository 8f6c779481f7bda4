use crate::auth::AuthError;
use crate::queue::QueueError;

/// Outcome of a failed `sync()`.
///
/// `Clone` because every caller joined to an in-flight sync receives the same
/// result.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No session, or the token could not be refreshed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The server rejected the token mid-sync (HTTP 401).
    #[error("server rejected credentials")]
    Unauthorized,

    #[error("sync cancelled")]
    Cancelled,

    #[error("queue error: {0}")]
    Queue(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<AuthError> for SyncError {
    fn from(e: AuthError) -> Self {
        SyncError::Auth(e.to_string())
    }
}

impl From<QueueError> for SyncError {
    fn from(e: QueueError) -> Self {
        SyncError::Queue(e.to_string())
    }
}
