//! Pluggable transports for content and presence synchronization.
//!
//! The sync controllers speak to the outside world only through these two
//! traits. A content transport fronts the remote store: the handshake
//! exchanges state vectors, [`DocTransport::push`] resolves once the remote
//! store has durably persisted the update (the signal graceful stop waits
//! on), and [`DocTransport::recv`] yields updates produced by peers. The
//! presence transport is a plain fan-out of awareness messages.
//!
//! [`MemoryHub`] is the in-process implementation: an authority replica
//! plus broadcast fan-out, mirroring a sync server room. It backs the test
//! suite and local multi-workspace setups.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, Mutex};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::error::SyncError;

/// Result of the content-sync handshake.
pub struct Handshake {
    /// The remote store's state vector at handshake time.
    pub remote_state_vector: Vec<u8>,
    /// Updates present remotely but missing locally.
    pub missing: Vec<u8>,
}

/// Binary-update sink/source fronting the remote store.
pub trait DocTransport: Send + Sync {
    /// Establish the connection. Called again after every disconnect; must
    /// be safe to retry indefinitely.
    fn connect(&self) -> BoxFuture<'_, Result<(), SyncError>>;

    /// Exchange state vectors with the remote store.
    fn handshake(&self, local_state_vector: Vec<u8>) -> BoxFuture<'_, Result<Handshake, SyncError>>;

    /// Send one local update. Resolves once the remote store acknowledges
    /// durable persistence.
    fn push(&self, update: Vec<u8>) -> BoxFuture<'_, Result<(), SyncError>>;

    /// Receive the next remote update. `Ok(None)` means the connection was
    /// closed by the remote end.
    fn recv(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>, SyncError>>;

    fn disconnect(&self) -> BoxFuture<'_, Result<(), SyncError>>;
}

/// Presence-message sink/source.
pub trait AwarenessTransport: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<(), SyncError>>;
    fn send(&self, update: Vec<u8>) -> BoxFuture<'_, Result<(), SyncError>>;
    fn recv(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>, SyncError>>;
    fn disconnect(&self) -> BoxFuture<'_, Result<(), SyncError>>;
}

const HUB_CHANNEL_CAPACITY: usize = 256;

/// In-process remote store: one authority replica with broadcast fan-out.
///
/// Every connected endpoint pushes updates into the authority document and
/// receives every other endpoint's updates. Reachability can be toggled to
/// exercise the connect-retry path.
pub struct MemoryHub {
    authority: yrs::Doc,
    doc_tx: broadcast::Sender<(u64, Arc<Vec<u8>>)>,
    presence_tx: broadcast::Sender<(u64, Arc<Vec<u8>>)>,
    reachable: Arc<AtomicBool>,
    next_endpoint: AtomicU64,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        let (doc_tx, _) = broadcast::channel(HUB_CHANNEL_CAPACITY);
        let (presence_tx, _) = broadcast::channel(HUB_CHANNEL_CAPACITY);
        Self {
            authority: yrs::Doc::new(),
            doc_tx,
            presence_tx,
            reachable: Arc::new(AtomicBool::new(true)),
            next_endpoint: AtomicU64::new(1),
        }
    }

    /// Toggle reachability. While unreachable, connects and pushes fail
    /// with a transport error and receives report the connection closed.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Create a per-client endpoint implementing both transport traits.
    /// The endpoint shares the hub's authority replica and fan-out
    /// channels, so it stays valid independently of the hub value itself.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            authority: self.authority.clone(),
            doc_tx: self.doc_tx.clone(),
            presence_tx: self.presence_tx.clone(),
            reachable: self.reachable.clone(),
            endpoint: self.next_endpoint.fetch_add(1, Ordering::Relaxed),
            doc_rx: Mutex::new(self.doc_tx.subscribe()),
            presence_rx: Mutex::new(self.presence_tx.subscribe()),
        }
    }

    /// The authority replica's full state (diagnostics and tests).
    pub fn authority_state(&self) -> Vec<u8> {
        let txn = self.authority.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

/// One endpoint of a [`MemoryHub`].
pub struct MemoryConnector {
    authority: yrs::Doc,
    doc_tx: broadcast::Sender<(u64, Arc<Vec<u8>>)>,
    presence_tx: broadcast::Sender<(u64, Arc<Vec<u8>>)>,
    reachable: Arc<AtomicBool>,
    endpoint: u64,
    doc_rx: Mutex<broadcast::Receiver<(u64, Arc<Vec<u8>>)>>,
    presence_rx: Mutex<broadcast::Receiver<(u64, Arc<Vec<u8>>)>>,
}

impl MemoryConnector {
    fn check_reachable(&self) -> Result<(), SyncError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::Transport("hub unreachable".into()))
        }
    }

    fn apply_to_authority(&self, update: &[u8]) -> Result<(), SyncError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| SyncError::Encoding(e.to_string()))?;
        let mut txn = self.authority.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| SyncError::Encoding(e.to_string()))?;
        Ok(())
    }

    async fn recv_filtered(
        &self,
        rx: &Mutex<broadcast::Receiver<(u64, Arc<Vec<u8>>)>>,
    ) -> Result<Option<Vec<u8>>, SyncError> {
        if self.check_reachable().is_err() {
            return Ok(None);
        }
        let mut rx = rx.lock().await;
        loop {
            match rx.recv().await {
                Ok((source, bytes)) if source != self.endpoint => {
                    return Ok(Some(bytes.as_ref().clone()))
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("memory hub receiver lagged, skipped {skipped} messages");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

impl DocTransport for MemoryConnector {
    fn connect(&self) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            self.check_reachable()?;
            // Drop any backlog from before this connection; the handshake
            // covers everything the endpoint missed.
            *self.doc_rx.lock().await = self.doc_tx.subscribe();
            Ok(())
        })
    }

    fn handshake(&self, local_state_vector: Vec<u8>) -> BoxFuture<'_, Result<Handshake, SyncError>> {
        Box::pin(async move {
            self.check_reachable()?;
            let local_sv = StateVector::decode_v1(&local_state_vector)
                .map_err(|e| SyncError::Encoding(e.to_string()))?;
            let txn = self.authority.transact();
            Ok(Handshake {
                remote_state_vector: txn.state_vector().encode_v1(),
                missing: txn.encode_state_as_update_v1(&local_sv),
            })
        })
    }

    fn push(&self, update: Vec<u8>) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            self.check_reachable()?;
            self.apply_to_authority(&update)?;
            // A send error only means no other endpoint is listening.
            let _ = self.doc_tx.send((self.endpoint, Arc::new(update)));
            Ok(())
        })
    }

    fn recv(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>, SyncError>> {
        Box::pin(self.recv_filtered(&self.doc_rx))
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move { Ok(()) })
    }
}

impl AwarenessTransport for MemoryConnector {
    fn connect(&self) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            self.check_reachable()?;
            *self.presence_rx.lock().await = self.presence_tx.subscribe();
            Ok(())
        })
    }

    fn send(&self, update: Vec<u8>) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            self.check_reachable()?;
            let _ = self.presence_tx.send((self.endpoint, Arc::new(update)));
            Ok(())
        })
    }

    fn recv(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>, SyncError>> {
        Box::pin(self.recv_filtered(&self.presence_rx))
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::Map;

    fn state_vector_of(doc: &yrs::Doc) -> Vec<u8> {
        let txn = doc.transact();
        txn.state_vector().encode_v1()
    }

    #[tokio::test]
    async fn test_push_reaches_authority_and_peers() {
        let hub = MemoryHub::new();
        let a = hub.connector();
        let b = hub.connector();
        DocTransport::connect(&a).await.unwrap();
        DocTransport::connect(&b).await.unwrap();

        // Produce an update from a local replica.
        let doc = yrs::Doc::new();
        let map = doc.get_or_insert_map("m");
        let update = {
            let mut txn = doc.transact_mut();
            map.insert(&mut txn, "k", "v");
            txn.encode_update_v1()
        };

        a.push(update.clone()).await.unwrap();

        // The other endpoint sees it; the pusher does not get an echo.
        let received = DocTransport::recv(&b).await.unwrap().unwrap();
        assert_eq!(received, update);
        assert!(!hub.authority_state().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_returns_missing_state() {
        let hub = MemoryHub::new();
        let a = hub.connector();
        DocTransport::connect(&a).await.unwrap();

        let doc = yrs::Doc::new();
        let map = doc.get_or_insert_map("m");
        let update = {
            let mut txn = doc.transact_mut();
            map.insert(&mut txn, "k", "v");
            txn.encode_update_v1()
        };
        a.push(update).await.unwrap();

        // A fresh replica handshakes and receives the authority state.
        let fresh = yrs::Doc::new();
        let hs = a.handshake(state_vector_of(&fresh)).await.unwrap();
        assert!(!hs.missing.is_empty());

        let mut txn = fresh.transact_mut();
        txn.apply_update(Update::decode_v1(&hs.missing).unwrap()).unwrap();
        drop(txn);

        let map = fresh.get_or_insert_map("m");
        let txn = fresh.transact();
        assert_eq!(map.len(&txn), 1);
    }

    #[tokio::test]
    async fn test_unreachable_hub_rejects() {
        let hub = MemoryHub::new();
        let a = hub.connector();
        hub.set_reachable(false);

        assert!(DocTransport::connect(&a).await.is_err());
        assert!(a.push(vec![1, 2, 3]).await.is_err());

        hub.set_reachable(true);
        assert!(DocTransport::connect(&a).await.is_ok());
    }

    #[tokio::test]
    async fn test_awareness_fanout_skips_sender() {
        let hub = MemoryHub::new();
        let a = hub.connector();
        let b = hub.connector();
        AwarenessTransport::connect(&a).await.unwrap();
        AwarenessTransport::connect(&b).await.unwrap();

        AwarenessTransport::send(&a, vec![9, 9]).await.unwrap();
        let got = AwarenessTransport::recv(&b).await.unwrap().unwrap();
        assert_eq!(got, vec![9, 9]);
    }
}
