//! Background synchronization of content and presence.
//!
//! Two controllers run independently: [`DocSyncController`] reconciles the
//! shared structure's binary state against the remote store, and
//! [`AwarenessSyncController`] exchanges ephemeral presence with peers.
//! Both publish their lifecycle through a watch channel of [`SyncState`]
//! and communicate with the rest of the system only through the shared
//! structure's update stream and the awareness store — never by calling
//! back into metadata mutation.

mod awareness_sync;
mod doc_sync;

pub use awareness_sync::AwarenessSyncController;
pub use doc_sync::DocSyncController;

/// Lifecycle of a sync controller.
///
/// `Stopping` is reachable from any non-idle state; `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Connecting,
    Syncing,
    Synced,
    Stopping,
    Stopped,
}

pub(crate) const INITIAL_BACKOFF: std::time::Duration = std::time::Duration::from_millis(250);
pub(crate) const MAX_BACKOFF: std::time::Duration = std::time::Duration::from_secs(10);
