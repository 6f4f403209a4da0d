//! Binary protocol for operation-based document synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ to        │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 0/17 bytes│ 16 bytes │ varint   │ variable │
//! └──────────┴───────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `to` is `None` for frames fanned out to the whole room and `Some` for
//! replies addressed to a single peer. The relay never looks inside the
//! payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use quire_core::{Operation, ReplicaId, VectorClock};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Frontier of the sender, asking peers for what it lacks
    SyncStep1 = 1,
    /// Operations the requester lacks plus the replier's frontier
    SyncStep2 = 2,
    /// Incremental operations
    Operations = 3,
    /// Ephemeral presence payload
    Awareness = 4,
    /// Peer joined notification (also the hello a client sends first)
    PeerJoined = 5,
    /// Peer left notification
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
    /// Relay's answer to a hello: who is already in the room
    Welcome = 9,
    /// Applied frontier, trims the sender's pending operations
    Ack = 10,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: ReplicaId,
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(ReplicaId::new(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: ReplicaId, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// `SyncStep1` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncRequest {
    pub frontier: VectorClock,
    /// Ask for the whole retained history instead of the difference.
    pub full: bool,
}

/// `SyncStep2` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncReply {
    pub ops: Vec<Operation>,
    pub frontier: VectorClock,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: ReplicaId,
    /// Recipient of an addressed reply; `None` means the whole room.
    pub to: Option<ReplicaId>,
    pub doc_id: Uuid,
    /// Sender's Lamport time, or the awareness clock for `Awareness`.
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn with_payload(
        msg_type: MessageType,
        peer_id: ReplicaId,
        doc_id: Uuid,
        clock: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            msg_type,
            peer_id,
            to: None,
            doc_id,
            clock,
            payload,
        }
    }

    /// Address this frame to a single peer.
    pub fn addressed_to(mut self, to: ReplicaId) -> Self {
        self.to = Some(to);
        self
    }

    /// Create a sync step 1 (frontier request).
    pub fn sync_step1(
        peer_id: ReplicaId,
        doc_id: Uuid,
        request: &SyncRequest,
    ) -> Result<Self, ProtocolError> {
        let payload = encode_payload(request)?;
        Ok(Self::with_payload(MessageType::SyncStep1, peer_id, doc_id, 0, payload))
    }

    /// Create a sync step 2 (missing operations response).
    pub fn sync_step2(
        peer_id: ReplicaId,
        doc_id: Uuid,
        reply: &SyncReply,
    ) -> Result<Self, ProtocolError> {
        let payload = encode_payload(reply)?;
        Ok(Self::with_payload(MessageType::SyncStep2, peer_id, doc_id, 0, payload))
    }

    /// Create an operations update message.
    pub fn operations(
        peer_id: ReplicaId,
        doc_id: Uuid,
        clock: u64,
        ops: &[Operation],
    ) -> Result<Self, ProtocolError> {
        let payload = encode_payload(&ops)?;
        Ok(Self::with_payload(MessageType::Operations, peer_id, doc_id, clock, payload))
    }

    /// Create an awareness update. `None` clears the sender's state.
    pub fn awareness(
        peer_id: ReplicaId,
        doc_id: Uuid,
        clock: u64,
        state: Option<&[u8]>,
    ) -> Result<Self, ProtocolError> {
        let payload = encode_payload(&state)?;
        Ok(Self::with_payload(MessageType::Awareness, peer_id, doc_id, clock, payload))
    }

    /// Create a peer joined notification.
    pub fn peer_joined(peer_id: ReplicaId, doc_id: Uuid, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = encode_payload(info)?;
        Ok(Self::with_payload(MessageType::PeerJoined, peer_id, doc_id, 0, payload))
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: ReplicaId, doc_id: Uuid) -> Self {
        Self::with_payload(MessageType::PeerLeft, peer_id, doc_id, 0, Vec::new())
    }

    /// Create the relay's welcome for a newly joined peer.
    pub fn welcome(doc_id: Uuid, to: ReplicaId, peers: &[PeerInfo]) -> Result<Self, ProtocolError> {
        let payload = encode_payload(&peers)?;
        Ok(Self::with_payload(MessageType::Welcome, ReplicaId::NIL, doc_id, 0, payload).addressed_to(to))
    }

    /// Create an acknowledgement carrying the sender's applied frontier.
    pub fn ack(peer_id: ReplicaId, doc_id: Uuid, frontier: &VectorClock) -> Result<Self, ProtocolError> {
        let payload = encode_payload(frontier)?;
        Ok(Self::with_payload(MessageType::Ack, peer_id, doc_id, 0, payload))
    }

    /// Create a ping message.
    pub fn ping(peer_id: ReplicaId, doc_id: Uuid) -> Self {
        Self::with_payload(MessageType::Ping, peer_id, doc_id, 0, Vec::new())
    }

    /// Create a pong message.
    pub fn pong(peer_id: ReplicaId, doc_id: Uuid) -> Self {
        Self::with_payload(MessageType::Pong, peer_id, doc_id, 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    /// Whether a peer should process this frame.
    pub fn is_for(&self, peer: ReplicaId) -> bool {
        self.peer_id != peer && !matches!(self.to, Some(to) if to != peer)
    }

    fn expect_type(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::UnexpectedType {
                expected,
                actual: self.msg_type,
            });
        }
        Ok(())
    }

    pub fn sync_request(&self) -> Result<SyncRequest, ProtocolError> {
        self.expect_type(MessageType::SyncStep1)?;
        decode_payload(&self.payload)
    }

    pub fn sync_reply(&self) -> Result<SyncReply, ProtocolError> {
        self.expect_type(MessageType::SyncStep2)?;
        decode_payload(&self.payload)
    }

    pub fn operations_payload(&self) -> Result<Vec<Operation>, ProtocolError> {
        self.expect_type(MessageType::Operations)?;
        decode_payload(&self.payload)
    }

    pub fn awareness_state(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.expect_type(MessageType::Awareness)?;
        decode_payload(&self.payload)
    }

    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.expect_type(MessageType::PeerJoined)?;
        decode_payload(&self.payload)
    }

    pub fn welcome_peers(&self) -> Result<Vec<PeerInfo>, ProtocolError> {
        self.expect_type(MessageType::Welcome)?;
        decode_payload(&self.payload)
    }

    pub fn ack_frontier(&self) -> Result<VectorClock, ProtocolError> {
        self.expect_type(MessageType::Ack)?;
        decode_payload(&self.payload)
    }
}

fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("expected {expected:?} message, got {actual:?}")]
    UnexpectedType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("room is full")]
    RoomFull,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::{EditIntent, NodeKey, Replica};

    fn sample_ops() -> Vec<Operation> {
        let mut replica = Replica::new(ReplicaId::from_u128(1));
        let p = replica
            .submit(EditIntent::insert_element(NodeKey::ROOT, 0, "paragraph"))
            .unwrap();
        replica
            .submit(EditIntent::insert_text(NodeKey(p.id), 0, "Hello"))
            .unwrap();
        replica.history()
    }

    #[test]
    fn test_operations_roundtrip() {
        let peer = ReplicaId::new();
        let doc = Uuid::new_v4();
        let ops = sample_ops();

        let msg = SyncMessage::operations(peer, doc, 2, &ops).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Operations);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.doc_id, doc);
        assert_eq!(decoded.clock, 2);
        assert_eq!(decoded.operations_payload().unwrap(), ops);
    }

    #[test]
    fn test_sync_steps_roundtrip() {
        let peer = ReplicaId::new();
        let doc = Uuid::new_v4();
        let frontier: VectorClock = [(ReplicaId::from_u128(1), 2)].into_iter().collect();

        let request = SyncRequest {
            frontier: frontier.clone(),
            full: true,
        };
        let msg = SyncMessage::sync_step1(peer, doc, &request).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.sync_request().unwrap(), request);

        let reply = SyncReply {
            ops: sample_ops(),
            frontier,
        };
        let target = ReplicaId::new();
        let msg = SyncMessage::sync_step2(peer, doc, &reply)
            .unwrap()
            .addressed_to(target);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.to, Some(target));
        assert_eq!(decoded.sync_reply().unwrap(), reply);
    }

    #[test]
    fn test_awareness_roundtrip() {
        let peer = ReplicaId::new();
        let doc = Uuid::new_v4();

        let msg = SyncMessage::awareness(peer, doc, 7, Some(b"cursor".as_slice())).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.clock, 7);
        assert_eq!(decoded.awareness_state().unwrap(), Some(b"cursor".to_vec()));

        let cleared = SyncMessage::awareness(peer, doc, 8, None).unwrap();
        assert_eq!(cleared.awareness_state().unwrap(), None);
    }

    #[test]
    fn test_peer_joined_and_welcome_roundtrip() {
        let info = PeerInfo::new("Alice");
        let doc = Uuid::new_v4();

        let msg = SyncMessage::peer_joined(info.peer_id, doc, &info).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.peer_info().unwrap(), info);

        let newcomer = ReplicaId::new();
        let welcome = SyncMessage::welcome(doc, newcomer, &[info.clone()]).unwrap();
        let decoded = SyncMessage::decode(&welcome.encode().unwrap()).unwrap();
        assert_eq!(decoded.peer_id, ReplicaId::NIL);
        assert_eq!(decoded.to, Some(newcomer));
        assert_eq!(decoded.welcome_peers().unwrap(), vec![info]);
    }

    #[test]
    fn test_ack_roundtrip() {
        let peer = ReplicaId::new();
        let frontier: VectorClock = [(peer, 9)].into_iter().collect();
        let msg = SyncMessage::ack(peer, Uuid::new_v4(), &frontier).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.ack_frontier().unwrap(), frontier);
    }

    #[test]
    fn test_peer_left_and_ping_have_empty_payload() {
        let peer = ReplicaId::new();
        let doc = Uuid::new_v4();
        for msg in [
            SyncMessage::peer_left(peer, doc),
            SyncMessage::ping(peer, doc),
            SyncMessage::pong(peer, doc),
        ] {
            let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded, msg);
            assert!(decoded.payload.is_empty());
        }
    }

    #[test]
    fn test_is_for_filters_own_and_addressed_frames() {
        let a = ReplicaId::from_u128(1);
        let b = ReplicaId::from_u128(2);
        let c = ReplicaId::from_u128(3);
        let doc = Uuid::nil();

        let broadcast = SyncMessage::ping(a, doc);
        assert!(!broadcast.is_for(a));
        assert!(broadcast.is_for(b));

        let addressed = SyncMessage::pong(a, doc).addressed_to(b);
        assert!(addressed.is_for(b));
        assert!(!addressed.is_for(c));
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = SyncMessage::ping(ReplicaId::new(), Uuid::nil());
        assert_eq!(
            msg.peer_info(),
            Err(ProtocolError::UnexpectedType {
                expected: MessageType::PeerJoined,
                actual: MessageType::Ping
            })
        );
        assert!(msg.operations_payload().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            SyncMessage::decode(&garbage),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::Operations as u8, 3);
        assert_eq!(MessageType::Pong as u8, 8);
        assert_eq!(MessageType::Welcome as u8, 9);
        assert_eq!(MessageType::Ack as u8, 10);
    }

    #[test]
    fn test_ping_frame_is_small() {
        let msg = SyncMessage::ping(ReplicaId::new(), Uuid::new_v4());
        let encoded = msg.encode().unwrap();
        // type + peer + to + doc + clock + empty payload
        assert!(encoded.len() < 48, "ping encoded to {} bytes", encoded.len());
    }
}
