//! A live collaborative document.
//!
//! A [`Doc`] binds one subtree of the workspace's shared structure (the
//! root map `doc:<id>`) and exposes block-level content access. Docs are
//! materialized and destroyed exclusively by the workspace's metadata
//! notification handlers — a live `Doc` exists if and only if a live
//! metadata record with the same id exists.
//!
//! The workspace owns the `Doc`; the `Doc` only carries the narrow pieces
//! it needs back from its owner (id generator for interior block ids, the
//! shared awareness store, the metadata ledger for link maintenance) and
//! never extends the workspace's lifetime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use yrs::{Map, MapRef, Transact};

use crate::awareness::{AwarenessStore, CursorAnchor, PresenceState};
use crate::error::WorkspaceError;
use crate::id::IdGenerator;
use crate::meta::{DocMeta, WorkspaceMeta};

/// Root-map name for a document's block subtree.
pub(crate) fn block_space_name(doc_id: &str) -> String {
    format!("doc:{doc_id}")
}

/// One live collaborative document bound to its content subtree.
pub struct Doc {
    id: String,
    shared: yrs::Doc,
    blocks: MapRef,
    id_generator: Arc<dyn IdGenerator>,
    awareness: Arc<AwarenessStore>,
    meta: Arc<WorkspaceMeta>,
    detached: AtomicBool,
}

impl Doc {
    pub(crate) fn new(
        id: String,
        shared: yrs::Doc,
        id_generator: Arc<dyn IdGenerator>,
        awareness: Arc<AwarenessStore>,
        meta: Arc<WorkspaceMeta>,
    ) -> Self {
        let blocks = shared.get_or_insert_map(block_space_name(&id));
        Self {
            id,
            shared,
            blocks,
            id_generator,
            awareness,
            meta,
            detached: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// This document's metadata record, if it is still live.
    pub fn meta(&self) -> Option<DocMeta> {
        self.meta.get_doc_meta(&self.id)
    }

    /// The shared awareness store of the owning workspace.
    pub fn awareness(&self) -> &Arc<AwarenessStore> {
        &self.awareness
    }

    /// Whether this document has been disposed.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    fn check_attached(&self) -> Result<(), WorkspaceError> {
        if self.is_detached() {
            Err(WorkspaceError::Detached(self.id.clone()))
        } else {
            Ok(())
        }
    }

    /// Insert a block with a freshly minted id; returns the id.
    pub fn add_block(&self, props: serde_json::Value) -> Result<String, WorkspaceError> {
        self.check_attached()?;
        let block_id = self.id_generator.generate();
        self.write_block(&block_id, &props)?;
        Ok(block_id)
    }

    /// Replace an existing block's properties.
    pub fn set_block(&self, block_id: &str, props: serde_json::Value) -> Result<(), WorkspaceError> {
        self.check_attached()?;
        if self.get_block(block_id).is_none() {
            return Err(WorkspaceError::NotFound(block_id.to_string()));
        }
        self.write_block(block_id, &props)
    }

    pub fn get_block(&self, block_id: &str) -> Option<serde_json::Value> {
        let txn = self.shared.transact();
        self.blocks
            .get(&txn, block_id)
            .and_then(|value| serde_json::from_str(&value.to_string(&txn)).ok())
    }

    /// Remove a block; returns whether it existed.
    pub fn remove_block(&self, block_id: &str) -> Result<bool, WorkspaceError> {
        self.check_attached()?;
        let mut txn = self.shared.transact_mut();
        Ok(self.blocks.remove(&mut txn, block_id).is_some())
    }

    pub fn block_count(&self) -> usize {
        let txn = self.shared.transact();
        self.blocks.len(&txn) as usize
    }

    /// Snapshot of all blocks as `(block_id, props)` pairs.
    pub fn blocks(&self) -> Vec<(String, serde_json::Value)> {
        let txn = self.shared.transact();
        self.blocks
            .iter(&txn)
            .filter_map(|(id, value)| {
                let props = serde_json::from_str(&value.to_string(&txn)).ok()?;
                Some((id.to_string(), props))
            })
            .collect()
    }

    /// Publish the local replica's cursor anchored in this document.
    pub fn set_cursor(&self, user_name: impl Into<String>, block_id: &str, offset: u32) {
        self.awareness.set_local_state(PresenceState {
            user_name: user_name.into(),
            cursor: Some(CursorAnchor {
                doc_id: self.id.clone(),
                block_id: block_id.to_string(),
                offset,
            }),
        });
    }

    /// Record a reference from this document to `child_id`. Updates the
    /// system-managed `sub_doc_ids` of this document's metadata record.
    pub fn link_sub_doc(&self, child_id: &str) -> Result<(), WorkspaceError> {
        self.check_attached()?;
        if self.meta.get_doc_meta(child_id).is_none() {
            return Err(WorkspaceError::NotFound(child_id.to_string()));
        }
        let mut meta = self
            .meta
            .get_doc_meta(&self.id)
            .ok_or_else(|| WorkspaceError::NotFound(self.id.clone()))?;
        if meta.sub_doc_ids.insert(child_id.to_string()) {
            self.meta.set_sub_doc_ids(&self.id, meta.sub_doc_ids)?;
        }
        Ok(())
    }

    /// Drop a reference from this document to `child_id`.
    pub fn unlink_sub_doc(&self, child_id: &str) -> Result<(), WorkspaceError> {
        self.check_attached()?;
        let mut meta = self
            .meta
            .get_doc_meta(&self.id)
            .ok_or_else(|| WorkspaceError::NotFound(self.id.clone()))?;
        if meta.sub_doc_ids.remove(child_id) {
            self.meta.set_sub_doc_ids(&self.id, meta.sub_doc_ids)?;
        }
        Ok(())
    }

    /// Release the subtree binding: clear this document's block map and
    /// refuse all further writes. Idempotent. Root types of the shared
    /// structure cannot be dropped, so an emptied map is the releasable
    /// form of the binding.
    pub fn dispose(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        let block_ids: Vec<String> = {
            let txn = self.shared.transact();
            self.blocks.keys(&txn).map(|k| k.to_string()).collect()
        };
        if !block_ids.is_empty() {
            let mut txn = self.shared.transact_mut();
            for block_id in &block_ids {
                self.blocks.remove(&mut txn, block_id);
            }
        }
        log::debug!("disposed doc {}", self.id);
    }

    fn write_block(&self, block_id: &str, props: &serde_json::Value) -> Result<(), WorkspaceError> {
        let record = serde_json::to_string(props)
            .map_err(|e| WorkspaceError::Serialization(e.to_string()))?;
        let mut txn = self.shared.transact_mut();
        self.blocks.insert(&mut txn, block_id.to_string(), record);
        Ok(())
    }
}

impl std::fmt::Debug for Doc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Doc")
            .field("id", &self.id)
            .field("detached", &self.is_detached())
            .finish()
    }
}
