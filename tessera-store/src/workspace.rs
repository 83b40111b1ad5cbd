//! The workspace coordinator.
//!
//! A [`Workspace`] owns one shared replicated structure, its metadata
//! ledger, the live document map, and the two sync controllers. The live
//! map is a derived cache: it is mutated exclusively by the handlers bound
//! to the ledger's notification channels, so documents materialize the same
//! way whether the metadata change originated locally or arrived as a
//! remote merge.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use yrs::{ReadTxn, StateVector, Transact};

use crate::awareness::AwarenessStore;
use crate::capability::{BlobStore, DocIndexer};
use crate::doc::Doc;
use crate::error::{SyncError, WorkspaceError};
use crate::id::{IdGenerator, UuidGenerator};
use crate::meta::{DocMeta, DocMetaPatch, WorkspaceMeta};
use crate::slot::{Slot, SlotSubscription};
use crate::sync::{AwarenessSyncController, DocSyncController, SyncState};
use crate::transport::{AwarenessTransport, DocTransport};

/// Operation count a single client writes during workspace initialization
/// (the two version markers).
const INIT_BOOKKEEPING_OPS: u32 = 2;

/// Coarse workspace notification channels.
pub struct WorkspaceSlots {
    pub doc_added: Slot<String>,
    pub doc_updated: Slot<()>,
    pub doc_removed: Slot<String>,
}

impl WorkspaceSlots {
    fn new() -> Self {
        Self {
            doc_added: Slot::new(),
            doc_updated: Slot::new(),
            doc_removed: Slot::new(),
        }
    }
}

/// Construction options. Transports and capabilities are optional; a
/// workspace without transports runs local-first.
pub struct WorkspaceOptions {
    pub id: String,
    /// Client id for the shared structure; minted randomly when absent.
    pub client_id: Option<u64>,
    pub id_generator: Option<Arc<dyn IdGenerator>>,
    pub doc_transport: Option<Arc<dyn DocTransport>>,
    pub awareness_transport: Option<Arc<dyn AwarenessTransport>>,
    pub blob_store: Option<Arc<dyn BlobStore>>,
    pub indexer: Option<Arc<dyn DocIndexer>>,
}

impl WorkspaceOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client_id: None,
            id_generator: None,
            doc_transport: None,
            awareness_transport: None,
            blob_store: None,
            indexer: None,
        }
    }
}

/// Options for [`Workspace::create_doc_with`].
#[derive(Debug, Clone, Default)]
pub struct CreateDocOptions {
    /// Caller-supplied id; minted via the workspace's generator when absent.
    pub id: Option<String>,
}

struct WorkspaceState {
    shared: yrs::Doc,
    docs: RwLock<HashMap<String, Arc<Doc>>>,
    awareness: Arc<AwarenessStore>,
    id_generator: Arc<dyn IdGenerator>,
    slots: WorkspaceSlots,
}

/// Top-level coordinator of documents, metadata, and synchronization.
pub struct Workspace {
    id: String,
    state: Arc<WorkspaceState>,
    meta: Arc<WorkspaceMeta>,
    doc_sync: Arc<DocSyncController>,
    awareness_sync: Arc<AwarenessSyncController>,
    blob_store: Option<Arc<dyn BlobStore>>,
    indexer: Option<Arc<dyn DocIndexer>>,
    _meta_subs: Vec<SlotSubscription<String>>,
}

impl Workspace {
    pub fn new(options: WorkspaceOptions) -> Self {
        let shared = match options.client_id {
            Some(client_id) => yrs::Doc::with_client_id(client_id),
            None => yrs::Doc::new(),
        };

        let meta = Arc::new(WorkspaceMeta::new(shared.clone()));
        meta.write_version_markers();

        let state = Arc::new(WorkspaceState {
            shared: shared.clone(),
            docs: RwLock::new(HashMap::new()),
            awareness: Arc::new(AwarenessStore::new(shared.client_id())),
            id_generator: options
                .id_generator
                .unwrap_or_else(|| Arc::new(UuidGenerator)),
            slots: WorkspaceSlots::new(),
        });

        let meta_subs = Self::bind_doc_meta_events(&state, &meta);

        let apply_remote = {
            let meta = meta.clone();
            Arc::new(move |bytes: &[u8]| meta.apply_update(bytes))
        };
        let doc_sync = Arc::new(DocSyncController::new(
            shared,
            options.doc_transport,
            apply_remote,
        ));
        let awareness_sync = Arc::new(AwarenessSyncController::new(
            state.awareness.clone(),
            options.awareness_transport,
        ));

        log::info!("workspace {} initialized", options.id);
        Self {
            id: options.id,
            state,
            meta,
            doc_sync,
            awareness_sync,
            blob_store: options.blob_store,
            indexer: options.indexer,
            _meta_subs: meta_subs,
        }
    }

    /// Bind ledger notifications to document materialization. The live map
    /// is touched nowhere else.
    fn bind_doc_meta_events(
        state: &Arc<WorkspaceState>,
        meta: &Arc<WorkspaceMeta>,
    ) -> Vec<SlotSubscription<String>> {
        let on_added = {
            let state = state.clone();
            let meta = meta.clone();
            let slot = meta.doc_meta_added().clone();
            slot.on(move |id: &String| {
                let doc = Arc::new(Doc::new(
                    id.clone(),
                    state.shared.clone(),
                    state.id_generator.clone(),
                    state.awareness.clone(),
                    meta.clone(),
                ));
                state.docs.write().unwrap().insert(id.clone(), doc);
                state.slots.doc_added.emit(id);
            })
        };

        let on_updated = {
            let state = state.clone();
            meta.doc_meta_updated().on(move |_id: &String| {
                state.slots.doc_updated.emit(&());
            })
        };

        let on_removed = {
            let state = state.clone();
            meta.doc_meta_removed().on(move |id: &String| {
                let doc = state.docs.write().unwrap().remove(id);
                if let Some(doc) = doc {
                    doc.dispose();
                }
                state.slots.doc_removed.emit(id);
            })
        };

        vec![on_added, on_updated, on_removed]
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The metadata ledger.
    pub fn meta(&self) -> &Arc<WorkspaceMeta> {
        &self.meta
    }

    /// Coarse notification channels: `doc_added`, `doc_updated`,
    /// `doc_removed`.
    pub fn slots(&self) -> &WorkspaceSlots {
        &self.state.slots
    }

    pub fn awareness_store(&self) -> &Arc<AwarenessStore> {
        &self.state.awareness
    }

    pub fn blob_store(&self) -> Option<&Arc<dyn BlobStore>> {
        self.blob_store.as_ref()
    }

    pub fn indexer(&self) -> Option<&Arc<dyn DocIndexer>> {
        self.indexer.as_ref()
    }

    /// Create a document with a freshly minted id.
    pub fn create_doc(&self) -> Result<Arc<Doc>, WorkspaceError> {
        self.create_doc_with(CreateDocOptions::default())
    }

    /// Create a document, optionally with a caller-supplied id.
    ///
    /// Materialization is synchronous: the returned document is already in
    /// the live map. Fails with [`WorkspaceError::AlreadyExists`] when a
    /// live document occupies the id — checked against the live map, not
    /// just the ledger, so a removal in progress cannot be raced.
    pub fn create_doc_with(&self, options: CreateDocOptions) -> Result<Arc<Doc>, WorkspaceError> {
        let id = options
            .id
            .unwrap_or_else(|| self.state.id_generator.generate());
        if self.state.docs.read().unwrap().contains_key(&id) {
            return Err(WorkspaceError::AlreadyExists(id));
        }
        self.meta.add_doc_meta(DocMeta::new(id.clone()))?;
        self.get_doc(&id)
            .ok_or(WorkspaceError::NotFound(id))
    }

    /// Update a document's metadata. Never touches document content and
    /// never creates or destroys a document.
    pub fn set_doc_meta(&self, id: &str, patch: DocMetaPatch) -> Result<(), WorkspaceError> {
        self.meta.set_doc_meta(id, patch)
    }

    /// Remove a document: release its bound resources, delete its metadata
    /// record, and drop it from the live map — in that order.
    ///
    /// Fails with [`WorkspaceError::NotFound`] when no metadata record
    /// exists. When metadata exists but no live document does (a divergence
    /// that normal operation never produces), returns `Ok(())` without side
    /// effects.
    pub fn remove_doc(&self, id: &str) -> Result<(), WorkspaceError> {
        if self.meta.get_doc_meta(id).is_none() {
            return Err(WorkspaceError::NotFound(id.to_string()));
        }
        let Some(doc) = self.get_doc(id) else {
            log::warn!("metadata for {id} exists without a live doc; skipping removal");
            return Ok(());
        };
        doc.dispose();
        self.meta.remove_doc_meta(id);
        Ok(())
    }

    /// Look up a live document.
    pub fn get_doc(&self, id: &str) -> Option<Arc<Doc>> {
        self.state.docs.read().unwrap().get(id).cloned()
    }

    /// Read-only snapshot of the live document map.
    pub fn docs(&self) -> HashMap<String, Arc<Doc>> {
        self.state.docs.read().unwrap().clone()
    }

    /// Number of live documents (the strict notion of emptiness).
    pub fn doc_count(&self) -> usize {
        self.state.docs.read().unwrap().len()
    }

    /// Best-effort structural emptiness.
    ///
    /// True iff the shared structure records no client contributions, or
    /// contributions from exactly one client that do not exceed the two
    /// bookkeeping entries written at initialization. This is a heuristic
    /// over low-level operation counts, not a document count — use
    /// [`Workspace::doc_count`] for that.
    pub fn is_empty(&self) -> bool {
        let txn = self.state.shared.transact();
        let sv = txn.state_vector();
        let mut clients = sv.iter().filter(|(_, clock)| **clock > 0);
        match (clients.next(), clients.next()) {
            (None, _) => true,
            (Some((_, ops)), None) => *ops <= INIT_BOOKKEEPING_OPS,
            _ => false,
        }
    }

    /// Encode the full replicated state as one binary update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.state.shared.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge a remote binary update, materializing and destroying documents
    /// per the resulting ledger changes.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), SyncError> {
        self.meta.apply_update(update)
    }

    // ------------------------------------------------------------------
    // Synchronization facade
    // ------------------------------------------------------------------

    /// Start content reconciliation and presence broadcasting. Idempotent.
    pub fn start(&self) {
        self.doc_sync.clone().start();
        self.awareness_sync.clone().connect();
    }

    /// Whether every locally produced update has been acknowledged as
    /// durably stored by the remote. Non-blocking.
    pub fn can_graceful_stop(&self) -> bool {
        self.doc_sync.can_graceful_stop()
    }

    /// Suspend until durability holds, or until `cancel` triggers (returns
    /// `false`). Stops nothing by itself.
    pub async fn wait_for_graceful_stop(&self, cancel: Option<CancellationToken>) -> bool {
        self.doc_sync.wait_for_graceful_stop(cancel).await
    }

    /// Tear down synchronization immediately. Unacknowledged local updates
    /// may be lost; check [`Workspace::can_graceful_stop`] first when that
    /// matters. Idempotent.
    pub fn force_stop(&self) {
        self.doc_sync.force_stop();
        self.awareness_sync.disconnect();
    }

    /// Suspend until content sync has reconciled local and remote views at
    /// least once. Returns `false` if sync stopped first.
    pub async fn wait_for_synced(&self) -> bool {
        self.doc_sync.wait_for_synced().await
    }

    /// Content-sync controller state, non-blocking.
    pub fn sync_state(&self) -> SyncState {
        self.doc_sync.state()
    }

    /// Presence-sync controller state, non-blocking.
    pub fn awareness_sync_state(&self) -> SyncState {
        self.awareness_sync.state()
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("id", &self.id)
            .field("doc_count", &self.doc_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::AutoIncrementIdGenerator;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn workspace_fixture() -> Workspace {
        let mut options = WorkspaceOptions::new("test-ws");
        options.id_generator = Some(Arc::new(AutoIncrementIdGenerator::default()));
        Workspace::new(options)
    }

    fn live_ids(ws: &Workspace) -> BTreeSet<String> {
        ws.docs().into_keys().collect()
    }

    fn assert_bijection(ws: &Workspace) {
        assert_eq!(live_ids(ws), ws.meta().doc_ids());
    }

    #[test]
    fn test_create_doc_materializes_synchronously() {
        let ws = workspace_fixture();
        let doc = ws.create_doc().unwrap();
        assert_eq!(doc.id(), "0");
        assert!(ws.get_doc("0").is_some());
        assert_bijection(&ws);
    }

    #[test]
    fn test_create_doc_mints_fresh_ids() {
        let ws = workspace_fixture();
        let a = ws.create_doc().unwrap();
        let b = ws.create_doc().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(ws.doc_count(), 2);
    }

    #[test]
    fn test_create_duplicate_id_fails() {
        let ws = workspace_fixture();
        ws.create_doc_with(CreateDocOptions {
            id: Some("x".into()),
        })
        .unwrap();

        let err = ws
            .create_doc_with(CreateDocOptions {
                id: Some("x".into()),
            })
            .unwrap_err();
        assert_eq!(err, WorkspaceError::AlreadyExists("x".into()));

        // The live map still contains exactly one doc for "x".
        assert_eq!(ws.doc_count(), 1);
        assert!(ws.get_doc("x").is_some());
        assert_bijection(&ws);
    }

    #[test]
    fn test_remove_doc() {
        let ws = workspace_fixture();
        let doc = ws.create_doc().unwrap();
        let id = doc.id().to_string();

        ws.remove_doc(&id).unwrap();
        assert!(ws.get_doc(&id).is_none());
        assert!(ws.meta().get_doc_meta(&id).is_none());
        assert!(doc.is_detached());
        assert_bijection(&ws);
    }

    #[test]
    fn test_remove_doc_without_meta_fails() {
        let ws = workspace_fixture();
        let err = ws.remove_doc("ghost").unwrap_err();
        assert_eq!(err, WorkspaceError::NotFound("ghost".into()));
    }

    #[test]
    fn test_bijection_through_create_remove_sequences() {
        let ws = workspace_fixture();
        assert_bijection(&ws);

        let a = ws.create_doc().unwrap().id().to_string();
        assert_bijection(&ws);
        let b = ws.create_doc().unwrap().id().to_string();
        assert_bijection(&ws);
        ws.remove_doc(&a).unwrap();
        assert_bijection(&ws);
        let c = ws.create_doc().unwrap().id().to_string();
        assert_bijection(&ws);
        ws.remove_doc(&b).unwrap();
        ws.remove_doc(&c).unwrap();
        assert_bijection(&ws);
        assert_eq!(ws.doc_count(), 0);
    }

    #[test]
    fn test_set_doc_meta_fires_updated_once() {
        let ws = workspace_fixture();
        let doc = ws.create_doc().unwrap();
        let id = doc.id().to_string();
        let created = ws.meta().get_doc_meta(&id).unwrap().create_date;

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let _sub = ws.slots().doc_updated.on(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        ws.set_doc_meta(&id, DocMetaPatch::title("T")).unwrap();

        let record = ws.meta().get_doc_meta(&id).unwrap();
        assert_eq!(record.title, "T");
        assert_eq!(record.create_date, created);
        assert!(record.tags.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // No materialization or destruction implied.
        assert_eq!(ws.doc_count(), 1);
    }

    #[test]
    fn test_workspace_events() {
        let ws = workspace_fixture();
        let events = Arc::new(Mutex::new(Vec::new()));

        let e = events.clone();
        let _a = ws.slots().doc_added.on(move |id| {
            e.lock().unwrap().push(format!("+{id}"));
        });
        let e = events.clone();
        let _r = ws.slots().doc_removed.on(move |id| {
            e.lock().unwrap().push(format!("-{id}"));
        });

        let doc = ws.create_doc().unwrap();
        let id = doc.id().to_string();
        ws.remove_doc(&id).unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![format!("+{id}"), format!("-{id}")]
        );
    }

    #[test]
    fn test_is_empty_heuristic() {
        let ws = workspace_fixture();
        // Only the two bookkeeping entries exist.
        assert!(ws.is_empty());
        assert_eq!(ws.doc_count(), 0);

        let doc = ws.create_doc().unwrap();
        assert!(!ws.is_empty());

        // Emptiness is structural, not a doc count: removing the doc leaves
        // operations behind.
        ws.remove_doc(doc.id()).unwrap();
        assert_eq!(ws.doc_count(), 0);
        assert!(!ws.is_empty());
    }

    #[test]
    fn test_remote_update_materializes_docs() {
        let source = workspace_fixture();
        source
            .create_doc_with(CreateDocOptions {
                id: Some("a".into()),
            })
            .unwrap();
        source
            .create_doc_with(CreateDocOptions {
                id: Some("b".into()),
            })
            .unwrap();

        let target = workspace_fixture();
        let added = Arc::new(Mutex::new(Vec::new()));
        let added2 = added.clone();
        let _sub = target.slots().doc_added.on(move |id| {
            added2.lock().unwrap().push(id.clone());
        });

        target.apply_update(&source.encode_state_as_update()).unwrap();

        assert_eq!(
            *added.lock().unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(target.get_doc("a").is_some());
        assert!(target.get_doc("b").is_some());
        assert_bijection(&target);
    }

    #[test]
    fn test_remote_removal_destroys_doc() {
        let source = workspace_fixture();
        source
            .create_doc_with(CreateDocOptions {
                id: Some("a".into()),
            })
            .unwrap();

        let target = workspace_fixture();
        target.apply_update(&source.encode_state_as_update()).unwrap();
        let doc = target.get_doc("a").unwrap();

        source.remove_doc("a").unwrap();
        target.apply_update(&source.encode_state_as_update()).unwrap();

        assert!(target.get_doc("a").is_none());
        assert!(doc.is_detached());
        assert_bijection(&target);
    }

    #[test]
    fn test_doc_content_survives_meta_update() {
        let ws = workspace_fixture();
        let doc = ws.create_doc().unwrap();
        doc.add_block(serde_json::json!({"text": "hello"})).unwrap();

        ws.set_doc_meta(doc.id(), DocMetaPatch::title("titled"))
            .unwrap();
        assert_eq!(doc.block_count(), 1);
    }

    #[test]
    fn test_capabilities_injected() {
        use crate::capability::{MemoryBlobStore, MemoryIndexer};

        let mut options = WorkspaceOptions::new("caps");
        options.blob_store = Some(MemoryBlobStore::new());
        options.indexer = Some(MemoryIndexer::new());
        let ws = Workspace::new(options);

        let blobs = ws.blob_store().unwrap();
        let key = blobs.put(vec![7, 7]);
        assert_eq!(blobs.get(&key), Some(vec![7, 7]));

        let indexer = ws.indexer().unwrap();
        indexer.index("d1", "needle in haystack");
        assert_eq!(indexer.search("needle"), vec!["d1".to_string()]);

        let bare = workspace_fixture();
        assert!(bare.blob_store().is_none());
        assert!(bare.indexer().is_none());
    }

    #[tokio::test]
    async fn test_local_first_sync_facade() {
        let ws = workspace_fixture();
        assert_eq!(ws.sync_state(), SyncState::Idle);

        ws.start();
        ws.start();
        assert!(ws.wait_for_synced().await);
        assert!(ws.can_graceful_stop());
        assert!(ws.wait_for_graceful_stop(None).await);

        ws.force_stop();
        assert_eq!(ws.sync_state(), SyncState::Stopped);
        assert_eq!(ws.awareness_sync_state(), SyncState::Stopped);
    }
}
