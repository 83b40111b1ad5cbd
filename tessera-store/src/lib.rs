//! # tessera-store — collaborative workspace core for block documents
//!
//! Manages a workspace of independently addressable documents backed by one
//! shared CRDT structure, and keeps two views consistent under concurrent,
//! possibly out-of-order replicated updates: the metadata ledger (the source
//! of truth for document identity) and the live document set (a derived
//! cache driven purely by ledger notifications).
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────── Workspace ──────────────────────────┐
//! │                                                               │
//! │  WorkspaceMeta ── added/updated/removed ──► live Doc map      │
//! │  (ledger root maps)        slots           (derived cache)    │
//! │        │                                        │             │
//! │        └────────────┐              ┌────────────┘             │
//! │                     ▼              ▼                          │
//! │               shared yrs::Doc (one per workspace)             │
//! │                     │                                         │
//! └─────────────────────┼─────────────────────────────────────────┘
//!                       │ binary updates            presence
//!                       ▼                               ▼
//!              DocSyncController              AwarenessSyncController
//!                       │                               │
//!                       ▼                               ▼
//!                 DocTransport                  AwarenessTransport
//!              (remote store/peers)              (peer fan-out)
//! ```
//!
//! ## Modules
//!
//! - [`workspace`] — the coordinator and its public lifecycle API
//! - [`meta`] — the replicated metadata ledger and its notifications
//! - [`doc`] — live documents bound to content subtrees
//! - [`sync`] — content and presence sync state machines
//! - [`transport`] — pluggable transports + in-process loopback hub
//! - [`awareness`] — ephemeral presence state
//! - [`slot`] — synchronous observer registry
//! - [`capability`] — optional blob storage and indexing seams

pub mod awareness;
pub mod capability;
pub mod doc;
pub mod error;
pub mod id;
pub mod meta;
pub mod slot;
pub mod sync;
pub mod transport;
pub mod workspace;

/// Transaction origin tag for updates replayed from remote replicas.
/// Local edits carry no origin; the sync controller uses the tag to avoid
/// echoing remote operations back out as local debt.
pub(crate) const REMOTE_ORIGIN: &str = "tessera:remote";

// Re-exports for convenience
pub use awareness::{AwarenessStore, AwarenessUpdate, CursorAnchor, PresenceState};
pub use capability::{BlobStore, DocIndexer, MemoryBlobStore, MemoryIndexer};
pub use doc::Doc;
pub use error::{SyncError, WorkspaceError};
pub use id::{AutoIncrementIdGenerator, IdGenerator, UuidGenerator};
pub use meta::{DocMeta, DocMetaPatch, WorkspaceMeta};
pub use slot::{Slot, SlotSubscription};
pub use sync::{AwarenessSyncController, DocSyncController, SyncState};
pub use transport::{AwarenessTransport, DocTransport, Handshake, MemoryConnector, MemoryHub};
pub use workspace::{CreateDocOptions, Workspace, WorkspaceOptions, WorkspaceSlots};
