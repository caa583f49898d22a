use thiserror::Error;

/// Top-level session failure taxonomy.
///
/// Only `AuthExpired` and `ConnectivityExhausted` may change top-level session
/// state (force logout / persistent offline indicator). Everything else is
/// recoverable and surfaced as a user-visible notice where appropriate.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Token refresh failed; the caller must treat this as "force logout".
    #[error("credentials expired and refresh failed")]
    AuthExpired,

    /// The reconnect budget ran out; no further automatic retry.
    #[error("connection attempts exhausted after {attempts} tries")]
    ConnectivityExhausted { attempts: u32 },

    /// The media provider rejected a transport-control request for lack of
    /// playback entitlement. Recoverable, user-facing.
    #[error("playback entitlement denied: {0}")]
    EntitlementDenied(String),

    /// A single request failed; retried only where an explicit retry loop
    /// exists (polling, reconnection), otherwise surfaced without retry.
    #[error("transient network error: {0}")]
    Transient(String),

    /// Only the comment author may remove a comment.
    #[error("user {user_id} is not the author of comment {comment_id}")]
    NotCommentAuthor { user_id: String, comment_id: String },

    /// No session installed; the caller must log in first.
    #[error("no active session")]
    NotLoggedIn,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Document-store failure taxonomy.
///
/// `NotFound` and `Conflict` are benign at mutation sites: the target vanished
/// under a concurrent writer, which the consistency rules already tolerate.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found")]
    NotFound,

    #[error("conflicting concurrent write")]
    Conflict,

    #[error("document store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Losing a race against a concurrent remove/cleanup is expected; callers
    /// use this to collapse those outcomes into a no-op.
    pub fn is_benign(&self) -> bool {
        matches!(self, StoreError::NotFound | StoreError::Conflict)
    }
}
