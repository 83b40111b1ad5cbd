//! Content synchronization against the remote store.
//!
//! The controller runs one background task: connect (retrying indefinitely
//! with capped backoff), handshake state vectors, then pump — local edits
//! are pushed as diffs against the last acknowledged state vector, remote
//! updates are merged through the workspace's metadata-aware applier.
//!
//! Durability is the acknowledged state vector covering the local one:
//! `can_graceful_stop` is true exactly when every locally produced
//! operation has been acknowledged as persisted by the remote store. A
//! connection loss re-enters the connect/handshake cycle; the diff encoding
//! makes re-pushing after reconnect idempotent, so no offline queue is
//! needed — the structure itself buffers.
//!
//! Transport failures are never surfaced to lifecycle callers; they are
//! observable only as the controller lingering in `Connecting`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact};

use super::{SyncState, INITIAL_BACKOFF, MAX_BACKOFF};
use crate::error::SyncError;
use crate::transport::DocTransport;
use crate::REMOTE_ORIGIN;

/// Interval of the periodic reconciliation sweep in the steady loop.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

type RemoteApplier = Arc<dyn Fn(&[u8]) -> Result<(), SyncError> + Send + Sync>;

/// Background content-sync state machine.
pub struct DocSyncController {
    shared: yrs::Doc,
    transport: Option<Arc<dyn DocTransport>>,
    apply_remote: RemoteApplier,
    state_tx: watch::Sender<SyncState>,
    state_rx: watch::Receiver<SyncState>,
    /// Latches true the first time the controller reaches `Synced`.
    synced_tx: watch::Sender<bool>,
    synced_rx: watch::Receiver<bool>,
    durable_tx: watch::Sender<bool>,
    durable_rx: watch::Receiver<bool>,
    /// State vector the remote store has acknowledged as persisted.
    acked: Mutex<StateVector>,
    dirty: Arc<Notify>,
    stop: CancellationToken,
    started: AtomicBool,
    _update_sub: Option<yrs::Subscription>,
}

impl DocSyncController {
    /// Create a controller for `shared`. With no transport the controller
    /// is local-first: `start` settles at `Synced` and durability holds
    /// vacuously, since there is no remote store to owe updates to.
    pub(crate) fn new(
        shared: yrs::Doc,
        transport: Option<Arc<dyn DocTransport>>,
        apply_remote: RemoteApplier,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SyncState::Idle);
        let (synced_tx, synced_rx) = watch::channel(false);
        let initially_durable = transport.is_none() || {
            let txn = shared.transact();
            txn.state_vector() == StateVector::default()
        };
        let (durable_tx, durable_rx) = watch::channel(initially_durable);
        let dirty = Arc::new(Notify::new());

        let update_sub = if transport.is_some() {
            let durable = durable_tx.clone();
            let dirty = dirty.clone();
            let sub = shared
                .observe_update_v1(move |txn, _event| {
                    // Remote merges are replayed state, not local debt.
                    if txn.origin() == Some(&REMOTE_ORIGIN.into()) {
                        return;
                    }
                    let _ = durable.send(false);
                    dirty.notify_one();
                })
                .expect("failed to observe shared structure updates");
            Some(sub)
        } else {
            None
        };

        Self {
            shared,
            transport,
            apply_remote,
            state_tx,
            state_rx,
            synced_tx,
            synced_rx,
            durable_tx,
            durable_rx,
            acked: Mutex::new(StateVector::default()),
            dirty,
            stop: CancellationToken::new(),
            started: AtomicBool::new(false),
            _update_sub: update_sub,
        }
    }

    /// Begin background reconciliation. Idempotent.
    pub fn start(self: Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(transport) = self.transport.clone() else {
            self.set_state(SyncState::Synced);
            return;
        };
        tokio::spawn(async move {
            self.run(transport).await;
        });
    }

    /// Current state, non-blocking.
    pub fn state(&self) -> SyncState {
        *self.state_rx.borrow()
    }

    /// True iff every locally produced update has been acknowledged as
    /// durably stored by the remote. Non-blocking.
    pub fn can_graceful_stop(&self) -> bool {
        *self.durable_rx.borrow()
    }

    /// Suspend until the durability condition holds, or until `cancel`
    /// triggers (returns `false`). A barrier only: stops nothing, and the
    /// controller keeps working toward durability in the background. An
    /// already-triggered token returns immediately regardless of
    /// durability.
    pub async fn wait_for_graceful_stop(&self, cancel: Option<CancellationToken>) -> bool {
        let mut rx = self.durable_rx.clone();
        let durable = rx.wait_for(|d| *d);
        match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => false,
                    result = durable => result.is_ok(),
                }
            }
            None => durable.await.is_ok(),
        }
    }

    /// Suspend until the controller has reached `Synced` at least once.
    /// Returns `false` if it stopped without ever getting there; never
    /// hangs after [`DocSyncController::force_stop`].
    pub async fn wait_for_synced(&self) -> bool {
        let mut synced = self.synced_rx.clone();
        let mut state = self.state_rx.clone();
        tokio::select! {
            result = synced.wait_for(|reached| *reached) => result.is_ok(),
            _ = state.wait_for(|s| *s == SyncState::Stopped) => *self.synced_rx.borrow(),
        }
    }

    /// Tear the connection down without waiting for durability. Idempotent
    /// and always safe to call, but lossy: unacknowledged local updates may
    /// never reach the remote store.
    pub fn force_stop(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        log::info!("content sync: forced stop");
        if self.transport.is_none() || !self.started.load(Ordering::SeqCst) {
            self.stop.cancel();
            let _ = self.state_tx.send(SyncState::Stopped);
            return;
        }
        let _ = self.state_tx.send(SyncState::Stopping);
        self.stop.cancel();
    }

    fn set_state(&self, state: SyncState) {
        if state == SyncState::Synced {
            let _ = self.synced_tx.send(true);
        }
        let _ = self.state_tx.send(state);
    }

    async fn run(&self, transport: Arc<dyn DocTransport>) {
        let mut backoff = INITIAL_BACKOFF;
        'outer: loop {
            if self.stop.is_cancelled() {
                break;
            }
            self.set_state(SyncState::Connecting);
            if let Err(e) = transport.connect().await {
                log::warn!("content sync: connect failed ({e}), retrying in {backoff:?}");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.stop.cancelled() => break 'outer,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
            backoff = INITIAL_BACKOFF;
            self.set_state(SyncState::Syncing);

            let local_sv = {
                let txn = self.shared.transact();
                txn.state_vector().encode_v1()
            };
            let handshake = tokio::select! {
                result = transport.handshake(local_sv) => result,
                _ = self.stop.cancelled() => break 'outer,
            };
            let handshake = match handshake {
                Ok(h) => h,
                Err(e) => {
                    log::warn!("content sync: handshake failed ({e})");
                    continue;
                }
            };
            if !handshake.missing.is_empty() {
                if let Err(e) = (self.apply_remote)(&handshake.missing) {
                    log::warn!("content sync: failed to apply remote state ({e})");
                }
            }
            match StateVector::decode_v1(&handshake.remote_state_vector) {
                Ok(sv) => *self.acked.lock().unwrap() = sv,
                Err(e) => log::warn!("content sync: undecodable remote state vector ({e})"),
            }
            if let Err(e) = self.push_pending(&transport).await {
                log::warn!("content sync: initial push failed ({e})");
                continue;
            }
            self.set_state(SyncState::Synced);

            loop {
                tokio::select! {
                    _ = self.stop.cancelled() => break 'outer,
                    _ = self.dirty.notified() => {
                        if let Err(e) = self.push_pending(&transport).await {
                            log::warn!("content sync: push failed ({e})");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                        if let Err(e) = self.push_pending(&transport).await {
                            log::warn!("content sync: sweep push failed ({e})");
                            break;
                        }
                    }
                    received = transport.recv() => match received {
                        Ok(Some(update)) => {
                            if let Err(e) = (self.apply_remote)(&update) {
                                log::warn!("content sync: failed to apply remote update ({e})");
                            }
                        }
                        Ok(None) => {
                            log::info!("content sync: connection closed by remote");
                            break;
                        }
                        Err(e) => {
                            log::warn!("content sync: receive failed ({e})");
                            break;
                        }
                    }
                }
            }
            // Connection lost: back to connecting.
        }

        self.set_state(SyncState::Stopping);
        if let Err(e) = transport.disconnect().await {
            log::debug!("content sync: disconnect error ignored ({e})");
        }
        self.set_state(SyncState::Stopped);
    }

    /// Push everything the remote has not acknowledged, as one diff per
    /// round, until the acknowledged state vector covers the local one.
    async fn push_pending(&self, transport: &Arc<dyn DocTransport>) -> Result<(), SyncError> {
        loop {
            let (local_sv, update) = {
                let txn = self.shared.transact();
                let local_sv = txn.state_vector();
                let acked = self.acked.lock().unwrap().clone();
                if covers(&acked, &local_sv) {
                    let _ = self.durable_tx.send(true);
                    return Ok(());
                }
                let update = txn.encode_state_as_update_v1(&acked);
                (local_sv, update)
            };
            transport.push(update).await?;
            *self.acked.lock().unwrap() = local_sv;
            // Loop: a local edit may have landed during the push.
        }
    }
}

/// Whether `acked` covers every operation recorded in `local`.
fn covers(acked: &StateVector, local: &StateVector) -> bool {
    local.iter().all(|(client, clock)| acked.get(client) >= *clock)
}
