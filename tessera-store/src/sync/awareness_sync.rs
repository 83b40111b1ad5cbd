//! Presence synchronization with peers.
//!
//! Broadcasts the local replica's presence whenever it changes (cursor
//! updates throttled to one per 33 ms) and folds remote presence into the
//! shared [`AwarenessStore`](crate::awareness::AwarenessStore). Disconnect
//! announces the local replica going offline so peers drop its cursor
//! promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use super::{SyncState, INITIAL_BACKOFF, MAX_BACKOFF};
use crate::awareness::AwarenessStore;
use crate::slot::SlotSubscription;
use crate::transport::AwarenessTransport;

/// Minimum interval between presence broadcasts.
const BROADCAST_THROTTLE: Duration = Duration::from_millis(33);

/// Background presence-sync controller.
pub struct AwarenessSyncController {
    awareness: Arc<AwarenessStore>,
    transport: Option<Arc<dyn AwarenessTransport>>,
    state_tx: watch::Sender<SyncState>,
    state_rx: watch::Receiver<SyncState>,
    local_changed: Arc<Notify>,
    stop: CancellationToken,
    started: AtomicBool,
    _changed_sub: SlotSubscription<u64>,
}

impl AwarenessSyncController {
    pub(crate) fn new(
        awareness: Arc<AwarenessStore>,
        transport: Option<Arc<dyn AwarenessTransport>>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SyncState::Idle);
        let local_changed = Arc::new(Notify::new());

        let notify = local_changed.clone();
        let local_id = awareness.client_id();
        let changed_sub = awareness.changed().on(move |client_id| {
            if *client_id == local_id {
                notify.notify_one();
            }
        });

        Self {
            awareness,
            transport,
            state_tx,
            state_rx,
            local_changed,
            stop: CancellationToken::new(),
            started: AtomicBool::new(false),
            _changed_sub: changed_sub,
        }
    }

    /// Begin presence broadcasting. Idempotent.
    pub fn connect(self: Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(transport) = self.transport.clone() else {
            let _ = self.state_tx.send(SyncState::Synced);
            return;
        };
        tokio::spawn(async move {
            self.run(transport).await;
        });
    }

    /// Halt presence broadcasting, announcing the local replica offline.
    /// Idempotent.
    pub fn disconnect(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        log::info!("presence sync: disconnect");
        if self.transport.is_none() || !self.started.load(Ordering::SeqCst) {
            self.stop.cancel();
            let _ = self.state_tx.send(SyncState::Stopped);
            return;
        }
        let _ = self.state_tx.send(SyncState::Stopping);
        self.stop.cancel();
    }

    pub fn state(&self) -> SyncState {
        *self.state_rx.borrow()
    }

    fn set_state(&self, state: SyncState) {
        let _ = self.state_tx.send(state);
    }

    async fn run(&self, transport: Arc<dyn AwarenessTransport>) {
        let mut backoff = INITIAL_BACKOFF;
        'outer: loop {
            if self.stop.is_cancelled() {
                break;
            }
            self.set_state(SyncState::Connecting);
            if let Err(e) = transport.connect().await {
                log::warn!("presence sync: connect failed ({e}), retrying in {backoff:?}");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.stop.cancelled() => break 'outer,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
            backoff = INITIAL_BACKOFF;
            self.set_state(SyncState::Syncing);

            // Announce our current presence to the room.
            if let Err(e) = self.broadcast_local(&transport).await {
                log::warn!("presence sync: join broadcast failed ({e})");
                continue;
            }
            self.set_state(SyncState::Synced);

            let mut last_broadcast = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    _ = self.stop.cancelled() => break 'outer,
                    _ = self.local_changed.notified() => {
                        let elapsed = last_broadcast.elapsed();
                        if elapsed < BROADCAST_THROTTLE {
                            tokio::select! {
                                _ = tokio::time::sleep(BROADCAST_THROTTLE - elapsed) => {}
                                _ = self.stop.cancelled() => break 'outer,
                            }
                        }
                        if let Err(e) = self.broadcast_local(&transport).await {
                            log::warn!("presence sync: broadcast failed ({e})");
                            break;
                        }
                        last_broadcast = tokio::time::Instant::now();
                    }
                    received = transport.recv() => match received {
                        Ok(Some(update)) => {
                            if let Err(e) = self.awareness.apply_update(&update) {
                                log::warn!("presence sync: bad remote presence ({e})");
                            }
                        }
                        Ok(None) => {
                            log::info!("presence sync: connection closed by remote");
                            break;
                        }
                        Err(e) => {
                            log::warn!("presence sync: receive failed ({e})");
                            break;
                        }
                    }
                }
            }
        }

        self.set_state(SyncState::Stopping);
        // Best-effort offline announcement; peers also time presence out.
        if let Ok(update) = self.awareness.encode_offline() {
            if let Err(e) = transport.send(update).await {
                log::debug!("presence sync: offline announce failed ({e})");
            }
        }
        if let Err(e) = transport.disconnect().await {
            log::debug!("presence sync: disconnect error ignored ({e})");
        }
        self.set_state(SyncState::Stopped);
    }

    async fn broadcast_local(
        &self,
        transport: &Arc<dyn AwarenessTransport>,
    ) -> Result<(), crate::error::SyncError> {
        let update = self.awareness.encode_local()?;
        transport.send(update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::PresenceState;
    use crate::transport::MemoryHub;
    use std::time::Duration;
    use tokio::time::timeout;

    fn wait_until<F: Fn() -> bool>(cond: F) -> impl std::future::Future<Output = bool> {
        async move {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
            while tokio::time::Instant::now() < deadline {
                if cond() {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            false
        }
    }

    fn controller(
        client_id: u64,
        transport: Option<Arc<dyn AwarenessTransport>>,
    ) -> (Arc<AwarenessStore>, Arc<AwarenessSyncController>) {
        let store = Arc::new(AwarenessStore::new(client_id));
        let sync = Arc::new(AwarenessSyncController::new(store.clone(), transport));
        (store, sync)
    }

    #[tokio::test]
    async fn test_detached_controller_settles() {
        let (_store, sync) = controller(1, None);
        sync.clone().connect();
        assert_eq!(sync.state(), SyncState::Synced);
        sync.disconnect();
        assert_eq!(sync.state(), SyncState::Stopped);
    }

    #[tokio::test]
    async fn test_presence_propagates_between_peers() {
        let hub = MemoryHub::new();
        let (store_a, sync_a) = controller(1, Some(Arc::new(hub.connector())));
        let (store_b, sync_b) = controller(2, Some(Arc::new(hub.connector())));

        sync_a.clone().connect();
        sync_b.clone().connect();
        assert!(wait_until(|| sync_a.state() == SyncState::Synced).await);
        assert!(wait_until(|| sync_b.state() == SyncState::Synced).await);

        store_a.set_local_state(PresenceState {
            user_name: "alice".into(),
            cursor: None,
        });

        assert!(
            wait_until(|| store_b
                .peer_states()
                .get(&1)
                .is_some_and(|s| s.user_name == "alice"))
            .await
        );
    }

    #[tokio::test]
    async fn test_disconnect_announces_offline() {
        let hub = MemoryHub::new();
        let (store_a, sync_a) = controller(1, Some(Arc::new(hub.connector())));
        let (store_b, sync_b) = controller(2, Some(Arc::new(hub.connector())));

        sync_a.clone().connect();
        sync_b.clone().connect();
        assert!(wait_until(|| sync_a.state() == SyncState::Synced).await);
        assert!(wait_until(|| sync_b.state() == SyncState::Synced).await);

        store_a.set_local_state(PresenceState {
            user_name: "alice".into(),
            cursor: None,
        });
        assert!(wait_until(|| store_b.peer_count() == 1).await);

        sync_a.disconnect();
        assert!(wait_until(|| store_b.peer_count() == 0).await);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let hub = MemoryHub::new();
        let (_store, sync) = controller(1, Some(Arc::new(hub.connector())));
        sync.clone().connect();
        sync.clone().connect();
        assert!(wait_until(|| sync.state() == SyncState::Synced).await);
    }

    #[tokio::test]
    async fn test_disconnect_never_hangs() {
        let hub = MemoryHub::new();
        hub.set_reachable(false);
        let (_store, sync) = controller(1, Some(Arc::new(hub.connector())));
        sync.clone().connect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        sync.disconnect();
        let ok = timeout(Duration::from_secs(2), async {
            while sync.state() != SyncState::Stopped {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(ok.is_ok());
    }
}
