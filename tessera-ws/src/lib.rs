//! # tessera-ws — WebSocket transport for tessera workspaces
//!
//! Implements the store crate's [`DocTransport`] and [`AwarenessTransport`]
//! over one WebSocket connection to a remote store.
//!
//! ```text
//! ┌──────────────┐    WireMessage (bincode)    ┌──────────────┐
//! │ WsTransport  │ ◄─────────────────────────► │ remote store │
//! │ (per client) │   Update / UpdateAck / …    │              │
//! └──────┬───────┘                             └──────────────┘
//!        │ writer task: mpsc → sink
//!        │ reader task: stream → route
//!        ▼
//!   acks → oneshot waiters, updates/awareness → recv channels
//! ```
//!
//! Reconnection is owned by the workspace's sync controller: when the
//! socket drops, `recv` reports the close and the controller calls
//! `connect` again.

pub mod protocol;

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;

use tessera_store::{AwarenessTransport, DocTransport, Handshake, SyncError};

pub use protocol::{HandshakeReply, MessageKind, WireError, WireMessage};

/// Default wait for a store acknowledgment before the push is failed.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_CAPACITY: usize = 256;

/// Connection settings for [`WsTransport`].
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Store endpoint, e.g. `ws://127.0.0.1:9090/sync`.
    pub url: String,
    /// Workspace this client syncs.
    pub workspace_id: String,
    /// Client id of the local shared structure.
    pub client_id: u64,
    /// How long to wait for handshake replies and update acks.
    pub ack_timeout: Duration,
}

impl WsConfig {
    pub fn new(url: impl Into<String>, workspace_id: impl Into<String>, client_id: u64) -> Self {
        Self {
            url: url.into(),
            workspace_id: workspace_id.into(),
            client_id,
            ack_timeout: ACK_TIMEOUT,
        }
    }
}

/// WebSocket implementation of both workspace transports.
pub struct WsTransport {
    config: WsConfig,
    seq: AtomicU64,
    outgoing: StdMutex<Option<mpsc::Sender<Vec<u8>>>>,
    pending_acks: Arc<StdMutex<HashMap<u64, oneshot::Sender<()>>>>,
    handshake_wait: Arc<StdMutex<Option<oneshot::Sender<HandshakeReply>>>>,
    doc_in_tx: mpsc::Sender<Vec<u8>>,
    doc_in_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    awareness_in_tx: mpsc::Sender<Vec<u8>>,
    awareness_in_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    connected_tx: Arc<watch::Sender<bool>>,
    connected_rx: watch::Receiver<bool>,
}

impl WsTransport {
    pub fn new(config: WsConfig) -> Arc<Self> {
        let (doc_in_tx, doc_in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (awareness_in_tx, awareness_in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(false);
        Arc::new(Self {
            config,
            seq: AtomicU64::new(0),
            outgoing: StdMutex::new(None),
            pending_acks: Arc::new(StdMutex::new(HashMap::new())),
            handshake_wait: Arc::new(StdMutex::new(None)),
            doc_in_tx,
            doc_in_rx: Mutex::new(doc_in_rx),
            awareness_in_tx,
            awareness_in_rx: Mutex::new(awareness_in_rx),
            connected_tx: Arc::new(connected_tx),
            connected_rx,
        })
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    async fn open(&self) -> Result<(), SyncError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.config.url)
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let (mut ws_sink, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        *self.outgoing.lock().unwrap() = Some(out_tx.clone());
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_sink.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: route incoming messages.
        let pending_acks = self.pending_acks.clone();
        let handshake_wait = self.handshake_wait.clone();
        let doc_in = self.doc_in_tx.clone();
        let awareness_in = self.awareness_in_tx.clone();
        let connected = self.connected_tx.clone();
        let own_client = self.config.client_id;
        let pong_tx = out_tx;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let wire = match WireMessage::decode(&bytes) {
                            Ok(wire) => wire,
                            Err(e) => {
                                log::warn!("dropping undecodable message: {e}");
                                continue;
                            }
                        };
                        match wire.kind {
                            MessageKind::HandshakeReply => {
                                let waiter = handshake_wait.lock().unwrap().take();
                                match (waiter, wire.handshake_reply_payload()) {
                                    (Some(tx), Ok(reply)) => {
                                        let _ = tx.send(reply);
                                    }
                                    (_, Err(e)) => log::warn!("bad handshake reply: {e}"),
                                    _ => {}
                                }
                            }
                            MessageKind::UpdateAck => {
                                let waiter = pending_acks.lock().unwrap().remove(&wire.seq);
                                if let Some(tx) = waiter {
                                    let _ = tx.send(());
                                }
                            }
                            MessageKind::Update => {
                                if wire.client != own_client
                                    && doc_in.send(wire.payload).await.is_err()
                                {
                                    break;
                                }
                            }
                            MessageKind::Awareness => {
                                if wire.client != own_client
                                    && awareness_in.send(wire.payload).await.is_err()
                                {
                                    break;
                                }
                            }
                            MessageKind::Ping => {
                                if let Ok(encoded) = WireMessage::pong(own_client).encode() {
                                    let _ = pong_tx.send(encoded).await;
                                }
                            }
                            MessageKind::Pong | MessageKind::Handshake => {}
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::info!("sync socket closed");
            let _ = connected.send(false);
        });

        let _ = self.connected_tx.send(true);
        log::info!("connected to {}", self.config.url);
        Ok(())
    }

    async fn send_message(&self, msg: WireMessage) -> Result<(), SyncError> {
        let encoded = msg
            .encode()
            .map_err(|e| SyncError::Encoding(e.to_string()))?;
        let tx = self
            .outgoing
            .lock()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or(SyncError::Closed)?;
        tx.send(encoded).await.map_err(|_| SyncError::Closed)
    }

    /// Receive from one of the inbound channels, reporting a closed
    /// connection as `Ok(None)`.
    async fn recv_from(
        &self,
        rx: &Mutex<mpsc::Receiver<Vec<u8>>>,
    ) -> Result<Option<Vec<u8>>, SyncError> {
        if !self.is_connected() {
            return Ok(None);
        }
        let mut rx = rx.lock().await;
        let mut connected = self.connected_rx.clone();
        tokio::select! {
            msg = rx.recv() => Ok(msg),
            _ = connected.wait_for(|up| !*up) => Ok(None),
        }
    }
}

impl DocTransport for WsTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            if self.is_connected() {
                return Ok(());
            }
            self.open().await
        })
    }

    fn handshake(&self, local_state_vector: Vec<u8>) -> BoxFuture<'_, Result<Handshake, SyncError>> {
        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            *self.handshake_wait.lock().unwrap() = Some(tx);
            self.send_message(WireMessage::handshake(
                self.config.client_id,
                self.config.workspace_id.clone(),
                local_state_vector,
            ))
            .await?;

            let reply = tokio::time::timeout(self.config.ack_timeout, rx)
                .await
                .map_err(|_| SyncError::Transport("handshake timed out".into()))?
                .map_err(|_| SyncError::Closed)?;
            Ok(Handshake {
                remote_state_vector: reply.state_vector,
                missing: reply.missing,
            })
        })
    }

    fn push(&self, update: Vec<u8>) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            let seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
            let (tx, rx) = oneshot::channel();
            self.pending_acks.lock().unwrap().insert(seq, tx);

            let sent = self
                .send_message(WireMessage::update(
                    self.config.client_id,
                    self.config.workspace_id.clone(),
                    seq,
                    update,
                ))
                .await;
            if let Err(e) = sent {
                self.pending_acks.lock().unwrap().remove(&seq);
                return Err(e);
            }

            match tokio::time::timeout(self.config.ack_timeout, rx).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(SyncError::Closed),
                Err(_) => {
                    self.pending_acks.lock().unwrap().remove(&seq);
                    Err(SyncError::Transport("update ack timed out".into()))
                }
            }
        })
    }

    fn recv(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>, SyncError>> {
        Box::pin(self.recv_from(&self.doc_in_rx))
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            // Dropping the outgoing sender ends the writer task, which
            // closes the socket; the reader task then flags the close.
            *self.outgoing.lock().unwrap() = None;
            let _ = self.connected_tx.send(false);
            Ok(())
        })
    }
}

impl AwarenessTransport for WsTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), SyncError>> {
        DocTransport::connect(self)
    }

    fn send(&self, update: Vec<u8>) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move {
            self.send_message(WireMessage::awareness(
                self.config.client_id,
                self.config.workspace_id.clone(),
                update,
            ))
            .await
        })
    }

    fn recv(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>, SyncError>> {
        Box::pin(self.recv_from(&self.awareness_in_rx))
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), SyncError>> {
        DocTransport::disconnect(self)
    }
}
