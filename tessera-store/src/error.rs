//! Error types for workspace lifecycle and synchronization.
//!
//! Lifecycle errors are surfaced synchronously to the caller of the offending
//! operation. Synchronization failures are never thrown into caller code —
//! they are observable only through controller state transitions.

/// Errors raised by workspace and document lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceError {
    /// A metadata record with this id already exists.
    DuplicateId(String),
    /// No live metadata record exists for this id.
    NotFound(String),
    /// A live document already exists for this id.
    AlreadyExists(String),
    /// The document was disposed and no longer accepts writes.
    Detached(String),
    /// A record could not be encoded or decoded.
    Serialization(String),
}

impl std::fmt::Display for WorkspaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkspaceError::DuplicateId(id) => write!(f, "duplicate document id: {id}"),
            WorkspaceError::NotFound(id) => write!(f, "document not found: {id}"),
            WorkspaceError::AlreadyExists(id) => write!(f, "document already exists: {id}"),
            WorkspaceError::Detached(id) => write!(f, "document is detached: {id}"),
            WorkspaceError::Serialization(e) => write!(f, "serialization error: {e}"),
        }
    }
}

impl std::error::Error for WorkspaceError {}

/// Transport and synchronization errors.
///
/// These surface inside the sync controllers (logged, retried) and from
/// transport implementations; lifecycle calls never return them.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// The remote store or peer could not be reached.
    Transport(String),
    /// A binary update or wire message could not be encoded/decoded.
    Encoding(String),
    /// The connection was closed by the remote end.
    Closed,
    /// The controller was stopped before the operation completed.
    Stopped,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Transport(e) => write!(f, "transport error: {e}"),
            SyncError::Encoding(e) => write!(f, "encoding error: {e}"),
            SyncError::Closed => write!(f, "connection closed"),
            SyncError::Stopped => write!(f, "sync stopped"),
        }
    }
}

impl std::error::Error for SyncError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_error_display() {
        let e = WorkspaceError::DuplicateId("x".into());
        assert_eq!(e.to_string(), "duplicate document id: x");

        let e = WorkspaceError::NotFound("y".into());
        assert_eq!(e.to_string(), "document not found: y");
    }

    #[test]
    fn test_sync_error_display() {
        let e = SyncError::Transport("refused".into());
        assert_eq!(e.to_string(), "transport error: refused");
        assert_eq!(SyncError::Closed.to_string(), "connection closed");
    }
}
