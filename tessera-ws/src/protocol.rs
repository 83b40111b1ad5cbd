//! Binary wire protocol for workspace synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬──────────┬───────────────┬──────────┬──────────┐
//! │ kind     │ client   │ workspace     │ seq      │ payload  │
//! │ 1 byte   │ 8 bytes  │ variable      │ 8 bytes  │ variable │
//! └──────────┴──────────┴───────────────┴──────────┴──────────┘
//! ```
//!
//! Update messages carry a sequence number; the store answers each with an
//! `UpdateAck` bearing the same number once the update is durably
//! persisted. That acknowledgment is the durability signal the workspace's
//! graceful stop waits on.

use serde::{Deserialize, Serialize};

/// Message kinds for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Client state vector opening the sync exchange
    Handshake = 1,
    /// Store state vector plus the updates the client is missing
    HandshakeReply = 2,
    /// Incremental binary update
    Update = 3,
    /// Store acknowledgment that an update was durably persisted
    UpdateAck = 4,
    /// Ephemeral presence payload
    Awareness = 5,
    /// Heartbeat ping
    Ping = 6,
    /// Heartbeat pong
    Pong = 7,
}

/// Payload of a [`MessageKind::HandshakeReply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeReply {
    /// The store's state vector at reply time.
    pub state_vector: Vec<u8>,
    /// Updates present at the store but missing at the client.
    pub missing: Vec<u8>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub kind: MessageKind,
    /// Client id of the sender (the shared structure's client id).
    pub client: u64,
    pub workspace: String,
    /// Sequence number pairing updates with acknowledgments.
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn handshake(client: u64, workspace: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Handshake,
            client,
            workspace: workspace.into(),
            seq: 0,
            payload: state_vector,
        }
    }

    pub fn handshake_reply(
        client: u64,
        workspace: impl Into<String>,
        reply: &HandshakeReply,
    ) -> Result<Self, WireError> {
        let payload = bincode::serde::encode_to_vec(reply, bincode::config::standard())
            .map_err(|e| WireError::Serialization(e.to_string()))?;
        Ok(Self {
            kind: MessageKind::HandshakeReply,
            client,
            workspace: workspace.into(),
            seq: 0,
            payload,
        })
    }

    pub fn update(client: u64, workspace: impl Into<String>, seq: u64, update: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Update,
            client,
            workspace: workspace.into(),
            seq,
            payload: update,
        }
    }

    pub fn update_ack(client: u64, workspace: impl Into<String>, seq: u64) -> Self {
        Self {
            kind: MessageKind::UpdateAck,
            client,
            workspace: workspace.into(),
            seq,
            payload: Vec::new(),
        }
    }

    pub fn awareness(client: u64, workspace: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Awareness,
            client,
            workspace: workspace.into(),
            seq: 0,
            payload,
        }
    }

    pub fn ping(client: u64) -> Self {
        Self {
            kind: MessageKind::Ping,
            client,
            workspace: String::new(),
            seq: 0,
            payload: Vec::new(),
        }
    }

    pub fn pong(client: u64) -> Self {
        Self {
            kind: MessageKind::Pong,
            client,
            workspace: String::new(),
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| WireError::Serialization(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| WireError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a handshake-reply payload.
    pub fn handshake_reply_payload(&self) -> Result<HandshakeReply, WireError> {
        if self.kind != MessageKind::HandshakeReply {
            return Err(WireError::InvalidKind);
        }
        let (reply, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| WireError::Deserialization(e.to_string()))?;
        Ok(reply)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum WireError {
    Serialization(String),
    Deserialization(String),
    InvalidKind,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Serialization(e) => write!(f, "serialization error: {e}"),
            WireError::Deserialization(e) => write!(f, "deserialization error: {e}"),
            WireError::InvalidKind => write!(f, "invalid message kind"),
        }
    }
}

impl std::error::Error for WireError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_roundtrip() {
        let msg = WireMessage::update(7, "ws", 42, vec![1, 2, 3]);
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, MessageKind::Update);
        assert_eq!(decoded.client, 7);
        assert_eq!(decoded.workspace, "ws");
        assert_eq!(decoded.seq, 42);
        assert_eq!(decoded.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_handshake_roundtrip() {
        let msg = WireMessage::handshake(1, "ws", vec![9, 9]);
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, MessageKind::Handshake);
        assert_eq!(decoded.payload, vec![9, 9]);
    }

    #[test]
    fn test_handshake_reply_payload() {
        let reply = HandshakeReply {
            state_vector: vec![1],
            missing: vec![2, 3],
        };
        let msg = WireMessage::handshake_reply(1, "ws", &reply).unwrap();
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.handshake_reply_payload().unwrap(), reply);
    }

    #[test]
    fn test_ack_roundtrip() {
        let msg = WireMessage::update_ack(3, "ws", 17);
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, MessageKind::UpdateAck);
        assert_eq!(decoded.seq, 17);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_ping_pong() {
        let ping = WireMessage::decode(&WireMessage::ping(1).encode().unwrap()).unwrap();
        let pong = WireMessage::decode(&WireMessage::pong(1).encode().unwrap()).unwrap();
        assert_eq!(ping.kind, MessageKind::Ping);
        assert_eq!(pong.kind, MessageKind::Pong);
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let msg = WireMessage::ping(1);
        assert!(msg.handshake_reply_payload().is_err());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(WireMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }
}
