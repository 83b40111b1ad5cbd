//! Ephemeral presence state for active collaborators.
//!
//! The [`AwarenessStore`] holds the local replica's presence (who is here,
//! where their cursor is) and the last known presence of every remote peer.
//! Nothing in this module touches the replicated structure: presence is
//! transient by design and disappears when a peer disconnects.
//!
//! Updates are ordered per peer by a Lamport clock; a stale update (clock
//! not newer than the last applied one) is ignored. An update carrying
//! `state: None` announces the peer going offline.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::slot::Slot;

/// Cursor anchored inside a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorAnchor {
    pub doc_id: String,
    pub block_id: String,
    pub offset: u32,
}

/// One replica's presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PresenceState {
    pub user_name: String,
    pub cursor: Option<CursorAnchor>,
}

/// Wire form of a presence change, bincode-encoded.
///
/// `state: None` means the peer went offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub client_id: u64,
    pub clock: u64,
    pub state: Option<PresenceState>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Encoding(e.to_string()))?;
        Ok(update)
    }
}

struct PeerEntry {
    clock: u64,
    state: PresenceState,
}

/// Presence for one workspace: local state plus remote peers.
pub struct AwarenessStore {
    client_id: u64,
    clock: AtomicU64,
    local: Mutex<Option<PresenceState>>,
    peers: Mutex<HashMap<u64, PeerEntry>>,
    changed: Slot<u64>,
}

impl AwarenessStore {
    /// Create a store for the replica identified by `client_id` (the client
    /// id of the shared structure, so presence identity matches CRDT
    /// identity).
    pub fn new(client_id: u64) -> Self {
        Self {
            client_id,
            clock: AtomicU64::new(0),
            local: Mutex::new(None),
            peers: Mutex::new(HashMap::new()),
            changed: Slot::new(),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Fires with the client id whose presence changed (local or remote).
    pub fn changed(&self) -> &Slot<u64> {
        &self.changed
    }

    /// Replace the local replica's presence.
    pub fn set_local_state(&self, state: PresenceState) {
        *self.local.lock().unwrap() = Some(state);
        self.clock.fetch_add(1, Ordering::SeqCst);
        self.changed.emit(&self.client_id);
    }

    pub fn local_state(&self) -> Option<PresenceState> {
        self.local.lock().unwrap().clone()
    }

    /// Drop the local presence (going offline).
    pub fn clear_local_state(&self) {
        *self.local.lock().unwrap() = None;
        self.clock.fetch_add(1, Ordering::SeqCst);
        self.changed.emit(&self.client_id);
    }

    /// Encode the local presence for broadcast.
    pub fn encode_local(&self) -> Result<Vec<u8>, SyncError> {
        AwarenessUpdate {
            client_id: self.client_id,
            clock: self.clock.load(Ordering::SeqCst),
            state: self.local.lock().unwrap().clone(),
        }
        .encode()
    }

    /// Encode an offline announcement for the local replica.
    pub fn encode_offline(&self) -> Result<Vec<u8>, SyncError> {
        AwarenessUpdate {
            client_id: self.client_id,
            clock: self.clock.fetch_add(1, Ordering::SeqCst) + 1,
            state: None,
        }
        .encode()
    }

    /// Apply a peer's presence update received from the transport.
    ///
    /// Returns the client id that changed, or `None` when the update was
    /// our own echo or stale.
    pub fn apply_update(&self, bytes: &[u8]) -> Result<Option<u64>, SyncError> {
        let update = AwarenessUpdate::decode(bytes)?;
        if update.client_id == self.client_id {
            return Ok(None);
        }

        let changed = {
            let mut peers = self.peers.lock().unwrap();
            match update.state {
                Some(state) => match peers.entry(update.client_id) {
                    Entry::Occupied(mut entry) => {
                        if entry.get().clock >= update.clock {
                            false
                        } else {
                            entry.insert(PeerEntry {
                                clock: update.clock,
                                state,
                            });
                            true
                        }
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(PeerEntry {
                            clock: update.clock,
                            state,
                        });
                        true
                    }
                },
                None => peers.remove(&update.client_id).is_some(),
            }
        };

        if changed {
            log::debug!("presence changed for peer {}", update.client_id);
            self.changed.emit(&update.client_id);
            Ok(Some(update.client_id))
        } else {
            Ok(None)
        }
    }

    /// Forget a peer without an explicit offline announcement.
    pub fn remove_peer(&self, client_id: u64) {
        let removed = self.peers.lock().unwrap().remove(&client_id).is_some();
        if removed {
            self.changed.emit(&client_id);
        }
    }

    /// Snapshot of every known remote peer's presence.
    pub fn peer_states(&self) -> HashMap<u64, PresenceState> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, entry)| (*id, entry.state.clone()))
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn remote_update(client_id: u64, clock: u64, name: &str) -> Vec<u8> {
        AwarenessUpdate {
            client_id,
            clock,
            state: Some(PresenceState {
                user_name: name.into(),
                cursor: None,
            }),
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_local_state_roundtrip() {
        let store = AwarenessStore::new(1);
        assert!(store.local_state().is_none());

        store.set_local_state(PresenceState {
            user_name: "alice".into(),
            cursor: None,
        });
        assert_eq!(store.local_state().unwrap().user_name, "alice");

        store.clear_local_state();
        assert!(store.local_state().is_none());
    }

    #[test]
    fn test_apply_remote_update() {
        let store = AwarenessStore::new(1);
        let applied = store.apply_update(&remote_update(2, 1, "bob")).unwrap();
        assert_eq!(applied, Some(2));
        assert_eq!(store.peer_count(), 1);
        assert_eq!(store.peer_states()[&2].user_name, "bob");
    }

    #[test]
    fn test_stale_update_ignored() {
        let store = AwarenessStore::new(1);
        store.apply_update(&remote_update(2, 5, "bob")).unwrap();
        let applied = store.apply_update(&remote_update(2, 3, "old bob")).unwrap();
        assert_eq!(applied, None);
        assert_eq!(store.peer_states()[&2].user_name, "bob");
    }

    #[test]
    fn test_own_echo_ignored() {
        let store = AwarenessStore::new(7);
        let applied = store.apply_update(&remote_update(7, 1, "me")).unwrap();
        assert_eq!(applied, None);
        assert_eq!(store.peer_count(), 0);
    }

    #[test]
    fn test_offline_removes_peer() {
        let store = AwarenessStore::new(1);
        store.apply_update(&remote_update(2, 1, "bob")).unwrap();

        let offline = AwarenessUpdate {
            client_id: 2,
            clock: 2,
            state: None,
        }
        .encode()
        .unwrap();
        let applied = store.apply_update(&offline).unwrap();
        assert_eq!(applied, Some(2));
        assert_eq!(store.peer_count(), 0);
    }

    #[test]
    fn test_changed_slot_fires() {
        let store = AwarenessStore::new(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let _sub = store.changed().on(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        store.set_local_state(PresenceState::default());
        store.apply_update(&remote_update(2, 1, "bob")).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_update_encode_decode() {
        let update = AwarenessUpdate {
            client_id: 9,
            clock: 4,
            state: Some(PresenceState {
                user_name: "carol".into(),
                cursor: Some(CursorAnchor {
                    doc_id: "d1".into(),
                    block_id: "b1".into(),
                    offset: 12,
                }),
            }),
        };
        let bytes = update.encode().unwrap();
        let decoded = AwarenessUpdate::decode(&bytes).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(AwarenessUpdate::decode(&[0xFF, 0xFE]).is_err());
    }
}
