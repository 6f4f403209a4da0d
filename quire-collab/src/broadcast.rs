//! Document rooms: which replicas are connected to which document, and the
//! fan-out of frames between them.
//!
//! Frames travel through a room as [`RoutedFrame`]s. The connection that
//! receives a frame from its peer decodes it once and keeps the sender and
//! recipient next to the bytes, so delivering it to every member costs an
//! id comparison per member instead of a decode per member.
//!
//! Each member reads the room through its own `tokio::sync::broadcast`
//! receiver holding up to `capacity` frames. A member further behind than
//! that sees `Lagged`; the relay then closes its link and the peer's next
//! sync recovers what it missed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use quire_core::ReplicaId;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Encoded frame plus the routing header it was decoded with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedFrame {
    pub from: ReplicaId,
    pub to: Option<ReplicaId>,
    pub bytes: Vec<u8>,
}

impl RoutedFrame {
    /// Wrap `bytes`, which must be the encoding of `msg`.
    pub fn new(msg: &SyncMessage, bytes: Vec<u8>) -> Self {
        Self {
            from: msg.peer_id,
            to: msg.to,
            bytes,
        }
    }

    pub fn encode(msg: &SyncMessage) -> Result<Self, ProtocolError> {
        Ok(Self::new(msg, msg.encode()?))
    }

    /// Whether `peer` should receive this frame. Matches
    /// [`SyncMessage::is_for`] on the decoded frame.
    pub fn is_for(&self, peer: ReplicaId) -> bool {
        self.from != peer && self.to.map_or(true, |to| to == peer)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomStats {
    /// Frames that reached at least one receiver.
    pub frames_sent: u64,
    /// Frames published while nobody was listening.
    pub frames_unheard: u64,
    pub members: usize,
}

#[derive(Debug)]
struct Member {
    info: PeerInfo,
    /// A replica that reconnects before its old connection is torn down
    /// briefly holds two.
    connections: usize,
}

/// What a connection gets on joining a room.
#[derive(Debug)]
pub struct Membership {
    /// Other replicas already in the room.
    pub existing: Vec<PeerInfo>,
    /// Subscribed before the join became visible, so no frame published
    /// after it is missed.
    pub receiver: broadcast::Receiver<Arc<RoutedFrame>>,
}

/// One document's members and the channel they share.
pub struct Room {
    doc_id: Uuid,
    sender: broadcast::Sender<Arc<RoutedFrame>>,
    members: Mutex<HashMap<ReplicaId, Member>>,
    frames_sent: AtomicU64,
    frames_unheard: AtomicU64,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room").field("doc_id", &self.doc_id).finish()
    }
}

impl Room {
    fn new(doc_id: Uuid, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            doc_id,
            sender,
            members: Mutex::new(HashMap::new()),
            frames_sent: AtomicU64::new(0),
            frames_unheard: AtomicU64::new(0),
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Admit a connection unless `max_members` other replicas are already
    /// in. A replica that is already a member is always admitted.
    async fn admit(&self, info: PeerInfo, max_members: usize) -> Result<Membership, ProtocolError> {
        let mut members = self.members.lock().await;
        let id = info.peer_id;
        if !members.contains_key(&id) && members.len() >= max_members {
            return Err(ProtocolError::RoomFull);
        }

        let existing = members
            .values()
            .filter(|m| m.info.peer_id != id)
            .map(|m| m.info.clone())
            .collect();
        let receiver = self.sender.subscribe();
        let member = members.entry(id).or_insert_with(|| Member {
            info: info.clone(),
            connections: 0,
        });
        member.info = info;
        member.connections += 1;
        Ok(Membership { existing, receiver })
    }

    /// Fan a frame out to every member, its sender included. Returns how
    /// many receivers it reached.
    pub fn publish(&self, frame: RoutedFrame) -> usize {
        match self.sender.send(Arc::new(frame)) {
            Ok(count) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                count
            }
            Err(_) => {
                self.frames_unheard.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub async fn members(&self) -> Vec<PeerInfo> {
        self.members
            .lock()
            .await
            .values()
            .map(|m| m.info.clone())
            .collect()
    }

    pub async fn member_count(&self) -> usize {
        self.members.lock().await.len()
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_unheard: self.frames_unheard.load(Ordering::Relaxed),
            members: self.member_count().await,
        }
    }
}

/// Open rooms by document. A room exists exactly while it has members:
/// joining and leaving both hold the registry lock, so a room is never
/// closed between a newcomer finding it and being admitted.
pub struct Rooms {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    capacity: usize,
}

impl Rooms {
    /// `capacity` is how many frames a member buffers before lagging.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Join `doc_id`'s room, opening it if needed.
    pub async fn join(
        &self,
        doc_id: Uuid,
        info: PeerInfo,
        max_members: usize,
    ) -> Result<(Arc<Room>, Membership), ProtocolError> {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(&doc_id) {
            Some(room) => room.clone(),
            None => Arc::new(Room::new(doc_id, self.capacity)),
        };
        let membership = room.admit(info, max_members).await?;
        if !rooms.contains_key(&doc_id) {
            log::debug!("Opening room for doc {doc_id}");
            rooms.insert(doc_id, room.clone());
        }
        Ok((room, membership))
    }

    /// Release one connection of `peer`. Returns its info once its last
    /// connection is gone. The room closes with its last member.
    pub async fn leave(&self, room: &Room, peer: &ReplicaId) -> Option<PeerInfo> {
        let mut rooms = self.rooms.write().await;
        let mut members = room.members.lock().await;

        let member = members.get_mut(peer)?;
        member.connections -= 1;
        let left = if member.connections == 0 {
            members.remove(peer).map(|m| m.info)
        } else {
            None
        };

        if members.is_empty() {
            rooms.remove(&room.doc_id);
            log::info!("Room {} closed (empty)", room.doc_id);
        }
        left
    }

    pub async fn get(&self, doc_id: &Uuid) -> Option<Arc<Room>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }
}
