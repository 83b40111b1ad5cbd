//! The replicated document-metadata ledger.
//!
//! Document identity lives in a distinguished root map of the shared
//! structure (`meta:docs`, id → JSON record). A second root map
//! (`meta:space`) carries the two version markers written once at workspace
//! initialization. Content and metadata are decoupled: editing a document
//! never touches its ledger record.
//!
//! All mutations emit on one of three notification channels — *added*,
//! *updated*, *removed* — synchronously, in the order the operations were
//! applied at this replica. Remote updates go through [`WorkspaceMeta::apply_update`],
//! which merges the binary update under the sync origin and emits the same
//! channels from a before/after diff of the ledger, so documents materialize
//! identically no matter which replica created them or in what order their
//! records arrive.

use std::collections::{BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::{Doc, Map, MapRef, ReadTxn, Transact, Update};

use crate::error::{SyncError, WorkspaceError};
use crate::slot::Slot;
use crate::REMOTE_ORIGIN;

/// Root map holding one JSON record per live document id.
const META_DOCS_MAP: &str = "meta:docs";
/// Root map holding workspace bookkeeping (version markers).
const META_SPACE_MAP: &str = "meta:space";

const WORKSPACE_VERSION: i64 = 1;
const DOC_FORMAT_VERSION: i64 = 1;

/// Metadata record for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocMeta {
    pub id: String,
    pub title: String,
    /// Milliseconds since the Unix epoch.
    pub create_date: i64,
    pub tags: Vec<String>,
    /// Ids of documents this one references. System-managed: derived from
    /// cross-document links, never set directly by callers.
    #[serde(default)]
    pub sub_doc_ids: BTreeSet<String>,
}

impl DocMeta {
    /// A fresh record with default fields: empty title, current timestamp,
    /// no tags.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            create_date: now_millis(),
            tags: Vec::new(),
            sub_doc_ids: BTreeSet::new(),
        }
    }
}

/// Partial update for [`WorkspaceMeta::set_doc_meta`]. Fields left `None`
/// are untouched. `sub_doc_ids` is system-managed and intentionally not
/// expressible here.
#[derive(Debug, Clone, Default)]
pub struct DocMetaPatch {
    pub title: Option<String>,
    pub create_date: Option<i64>,
    pub tags: Option<Vec<String>>,
}

impl DocMetaPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The canonical ledger of document metadata for one workspace.
pub struct WorkspaceMeta {
    shared: Doc,
    docs_map: MapRef,
    space_map: MapRef,
    added: Slot<String>,
    updated: Slot<String>,
    removed: Slot<String>,
}

impl WorkspaceMeta {
    pub fn new(shared: Doc) -> Self {
        let docs_map = shared.get_or_insert_map(META_DOCS_MAP);
        let space_map = shared.get_or_insert_map(META_SPACE_MAP);
        Self {
            shared,
            docs_map,
            space_map,
            added: Slot::new(),
            updated: Slot::new(),
            removed: Slot::new(),
        }
    }

    /// Fires with the id of a newly added record.
    pub fn doc_meta_added(&self) -> &Slot<String> {
        &self.added
    }

    /// Fires with the id of an updated record.
    pub fn doc_meta_updated(&self) -> &Slot<String> {
        &self.updated
    }

    /// Fires with the id of a removed record.
    pub fn doc_meta_removed(&self) -> &Slot<String> {
        &self.removed
    }

    pub(crate) fn shared(&self) -> &Doc {
        &self.shared
    }

    /// Write the two bookkeeping version markers if absent. Called once at
    /// workspace initialization; a freshly initialized structure therefore
    /// records exactly two operations from the local replica.
    pub(crate) fn write_version_markers(&self) {
        let mut txn = self.shared.transact_mut();
        if self.space_map.get(&txn, "workspace_version").is_none() {
            self.space_map
                .insert(&mut txn, "workspace_version", WORKSPACE_VERSION);
        }
        if self.space_map.get(&txn, "doc_format_version").is_none() {
            self.space_map
                .insert(&mut txn, "doc_format_version", DOC_FORMAT_VERSION);
        }
    }

    /// Insert a new record and emit *added*.
    ///
    /// This is the only sanctioned way to create document identity. Fails
    /// with [`WorkspaceError::DuplicateId`] when a live record already
    /// exists for the id.
    pub fn add_doc_meta(&self, meta: DocMeta) -> Result<(), WorkspaceError> {
        let id = meta.id.clone();
        let record = serde_json::to_string(&meta)
            .map_err(|e| WorkspaceError::Serialization(e.to_string()))?;
        {
            let mut txn = self.shared.transact_mut();
            if self.docs_map.get(&txn, &id).is_some() {
                return Err(WorkspaceError::DuplicateId(id));
            }
            self.docs_map.insert(&mut txn, id.clone(), record);
        }
        self.added.emit(&id);
        Ok(())
    }

    /// Merge `patch` into an existing record and emit *updated*. Fields not
    /// supplied are untouched.
    pub fn set_doc_meta(&self, id: &str, patch: DocMetaPatch) -> Result<(), WorkspaceError> {
        let mut meta = self
            .get_doc_meta(id)
            .ok_or_else(|| WorkspaceError::NotFound(id.to_string()))?;
        if let Some(title) = patch.title {
            meta.title = title;
        }
        if let Some(create_date) = patch.create_date {
            meta.create_date = create_date;
        }
        if let Some(tags) = patch.tags {
            meta.tags = tags;
        }
        self.write_record(&meta)?;
        self.updated.emit(&meta.id);
        Ok(())
    }

    /// Replace the system-managed `sub_doc_ids` of a record.
    pub(crate) fn set_sub_doc_ids(
        &self,
        id: &str,
        sub_doc_ids: BTreeSet<String>,
    ) -> Result<(), WorkspaceError> {
        let mut meta = self
            .get_doc_meta(id)
            .ok_or_else(|| WorkspaceError::NotFound(id.to_string()))?;
        meta.sub_doc_ids = sub_doc_ids;
        self.write_record(&meta)?;
        self.updated.emit(&meta.id);
        Ok(())
    }

    /// Delete a record and emit *removed*. Removing an absent id is a
    /// silent no-op: no notification fires, no error is raised.
    pub fn remove_doc_meta(&self, id: &str) {
        let removed = {
            let mut txn = self.shared.transact_mut();
            self.docs_map.remove(&mut txn, id).is_some()
        };
        if removed {
            self.removed.emit(&id.to_string());
        }
    }

    /// Look up a record. Never errors.
    pub fn get_doc_meta(&self, id: &str) -> Option<DocMeta> {
        let txn = self.shared.transact();
        self.docs_map
            .get(&txn, id)
            .and_then(|value| decode_record(&value.to_string(&txn)))
    }

    /// All live records, ordered by `(create_date, id)`.
    pub fn doc_metas(&self) -> Vec<DocMeta> {
        let mut metas: Vec<DocMeta> = self.snapshot().into_values().collect();
        metas.sort_by(|a, b| {
            a.create_date
                .cmp(&b.create_date)
                .then_with(|| a.id.cmp(&b.id))
        });
        metas
    }

    /// Ids of all live records.
    pub fn doc_ids(&self) -> BTreeSet<String> {
        let txn = self.shared.transact();
        self.docs_map
            .keys(&txn)
            .map(|k| k.to_string())
            .collect()
    }

    pub fn doc_count(&self) -> usize {
        let txn = self.shared.transact();
        self.docs_map.len(&txn) as usize
    }

    /// Merge a remote binary update into the shared structure and emit
    /// *added*/*updated*/*removed* for every ledger record that changed.
    ///
    /// The transaction is tagged with the sync origin so locally registered
    /// update observers can tell replayed remote operations from local
    /// edits.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), SyncError> {
        let before = self.snapshot();
        let decoded =
            Update::decode_v1(update).map_err(|e| SyncError::Encoding(e.to_string()))?;
        {
            let mut txn = self.shared.transact_mut_with(REMOTE_ORIGIN);
            txn.apply_update(decoded)
                .map_err(|e| SyncError::Encoding(e.to_string()))?;
        }
        let after = self.snapshot();
        self.emit_diff(&before, &after);
        Ok(())
    }

    fn emit_diff(&self, before: &HashMap<String, DocMeta>, after: &HashMap<String, DocMeta>) {
        let mut added: Vec<&String> = after.keys().filter(|id| !before.contains_key(*id)).collect();
        added.sort();
        for id in added {
            self.added.emit(id);
        }

        let mut updated: Vec<&String> = after
            .keys()
            .filter(|id| before.get(*id).is_some_and(|old| old != &after[*id]))
            .collect();
        updated.sort();
        for id in updated {
            self.updated.emit(id);
        }

        let mut removed: Vec<&String> = before.keys().filter(|id| !after.contains_key(*id)).collect();
        removed.sort();
        for id in removed {
            self.removed.emit(id);
        }
    }

    fn snapshot(&self) -> HashMap<String, DocMeta> {
        let txn = self.shared.transact();
        self.docs_map
            .iter(&txn)
            .filter_map(|(id, value)| {
                let meta = decode_record(&value.to_string(&txn))?;
                Some((id.to_string(), meta))
            })
            .collect()
    }

    fn write_record(&self, meta: &DocMeta) -> Result<(), WorkspaceError> {
        let record = serde_json::to_string(meta)
            .map_err(|e| WorkspaceError::Serialization(e.to_string()))?;
        let mut txn = self.shared.transact_mut();
        self.docs_map.insert(&mut txn, meta.id.clone(), record);
        Ok(())
    }
}

fn decode_record(json: &str) -> Option<DocMeta> {
    match serde_json::from_str(json) {
        Ok(meta) => Some(meta),
        Err(e) => {
            log::warn!("skipping undecodable metadata record: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use yrs::StateVector;

    fn meta_fixture() -> WorkspaceMeta {
        WorkspaceMeta::new(Doc::new())
    }

    fn full_state(meta: &WorkspaceMeta) -> Vec<u8> {
        let txn = meta.shared().transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    #[test]
    fn test_add_and_get() {
        let meta = meta_fixture();
        meta.add_doc_meta(DocMeta::new("a")).unwrap();

        let record = meta.get_doc_meta("a").unwrap();
        assert_eq!(record.id, "a");
        assert_eq!(record.title, "");
        assert!(record.tags.is_empty());
        assert!(record.create_date > 0);
    }

    #[test]
    fn test_duplicate_add_fails() {
        let meta = meta_fixture();
        meta.add_doc_meta(DocMeta::new("a")).unwrap();
        let err = meta.add_doc_meta(DocMeta::new("a")).unwrap_err();
        assert_eq!(err, WorkspaceError::DuplicateId("a".into()));
        assert_eq!(meta.doc_count(), 1);
    }

    #[test]
    fn test_set_doc_meta_partial() {
        let meta = meta_fixture();
        let mut record = DocMeta::new("a");
        record.tags = vec!["keep".into()];
        let created = record.create_date;
        meta.add_doc_meta(record).unwrap();

        meta.set_doc_meta("a", DocMetaPatch::title("Hello")).unwrap();

        let record = meta.get_doc_meta("a").unwrap();
        assert_eq!(record.title, "Hello");
        assert_eq!(record.tags, vec!["keep".to_string()]);
        assert_eq!(record.create_date, created);
    }

    #[test]
    fn test_set_doc_meta_missing_fails() {
        let meta = meta_fixture();
        let err = meta.set_doc_meta("nope", DocMetaPatch::title("T")).unwrap_err();
        assert_eq!(err, WorkspaceError::NotFound("nope".into()));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let meta = meta_fixture();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let _sub = meta.doc_meta_removed().on(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        // Absent id: no event, no error.
        meta.remove_doc_meta("ghost");
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        meta.add_doc_meta(DocMeta::new("a")).unwrap();
        meta.remove_doc_meta("a");
        meta.remove_doc_meta("a");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(meta.get_doc_meta("a").is_none());
    }

    #[test]
    fn test_notifications_in_application_order() {
        let meta = meta_fixture();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let _a = meta.doc_meta_added().on(move |id| {
            o.lock().unwrap().push(format!("+{id}"));
        });
        let o = order.clone();
        let _r = meta.doc_meta_removed().on(move |id| {
            o.lock().unwrap().push(format!("-{id}"));
        });

        meta.add_doc_meta(DocMeta::new("a")).unwrap();
        meta.add_doc_meta(DocMeta::new("b")).unwrap();
        meta.remove_doc_meta("a");

        assert_eq!(*order.lock().unwrap(), vec!["+a", "+b", "-a"]);
    }

    #[test]
    fn test_doc_metas_ordered_by_create_date() {
        let meta = meta_fixture();
        let mut early = DocMeta::new("late-id");
        early.create_date = 100;
        let mut late = DocMeta::new("early-id");
        late.create_date = 200;
        meta.add_doc_meta(late).unwrap();
        meta.add_doc_meta(early).unwrap();

        let ids: Vec<String> = meta.doc_metas().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["late-id".to_string(), "early-id".to_string()]);
    }

    #[test]
    fn test_apply_update_emits_added() {
        let source = meta_fixture();
        source.add_doc_meta(DocMeta::new("a")).unwrap();
        source.add_doc_meta(DocMeta::new("b")).unwrap();

        let target = meta_fixture();
        let added = Arc::new(Mutex::new(Vec::new()));
        let added2 = added.clone();
        let _sub = target.doc_meta_added().on(move |id| {
            added2.lock().unwrap().push(id.clone());
        });

        target.apply_update(&full_state(&source)).unwrap();

        assert_eq!(*added.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(target.doc_count(), 2);
    }

    #[test]
    fn test_apply_update_emits_removed_and_updated() {
        let source = meta_fixture();
        source.add_doc_meta(DocMeta::new("a")).unwrap();
        source.add_doc_meta(DocMeta::new("b")).unwrap();

        let target = meta_fixture();
        target.apply_update(&full_state(&source)).unwrap();

        source.set_doc_meta("a", DocMetaPatch::title("renamed")).unwrap();
        source.remove_doc_meta("b");

        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        let _u = target.doc_meta_updated().on(move |id| {
            e.lock().unwrap().push(format!("~{id}"));
        });
        let e = events.clone();
        let _r = target.doc_meta_removed().on(move |id| {
            e.lock().unwrap().push(format!("-{id}"));
        });

        target.apply_update(&full_state(&source)).unwrap();

        assert_eq!(*events.lock().unwrap(), vec!["~a".to_string(), "-b".to_string()]);
        assert_eq!(target.get_doc_meta("a").unwrap().title, "renamed");
        assert!(target.get_doc_meta("b").is_none());
    }

    #[test]
    fn test_apply_garbage_update_fails() {
        let meta = meta_fixture();
        assert!(meta.apply_update(&[0xFF, 0x00, 0x12]).is_err());
    }

    #[test]
    fn test_version_markers_written_once() {
        let meta = meta_fixture();
        meta.write_version_markers();
        meta.write_version_markers();

        let txn = meta.shared().transact();
        assert_eq!(meta.space_map.len(&txn), 2);
    }
}
