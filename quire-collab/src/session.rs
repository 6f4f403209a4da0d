//! Sans-IO sync session: one replica's view of a document room.
//!
//! The session never touches a socket. Frames come in through
//! [`SyncSession::handle_frame`] and leave through
//! [`SyncSession::poll_transmit`]; the actor in `actor.rs` (or a test
//! harness) moves bytes between sessions.
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──Welcome──► Syncing ──► Synced
//!       ▲                                     │ (no peers)          │
//!       │                                     └────────────────────►│
//!       └──────────────────────── disconnect() ─────────────────────┘
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use uuid::Uuid;

use quire_core::{
    Change, DocumentSnapshot, EditError, EditIntent, Operation, OperationId, Replica, ReplicaId,
    VectorClock,
};

use crate::awareness::AwarenessChannel;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage, SyncReply, SyncRequest};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Room (document) to join.
    pub doc_id: Uuid,
    /// Display name announced to peers.
    pub peer_name: String,
    /// Remote awareness entries older than this are dropped.
    pub awareness_timeout: Duration,
    /// Capacity of the actor's command and event channels.
    pub channel_capacity: usize,
    /// How often the actor sweeps idle awareness entries.
    pub awareness_sweep: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            doc_id: Uuid::nil(),
            peer_name: "anonymous".to_string(),
            awareness_timeout: Duration::from_secs(30),
            channel_capacity: 256,
            awareness_sweep: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Create a config suitable for testing (short timeouts).
    pub fn for_testing() -> Self {
        Self {
            awareness_timeout: Duration::from_millis(200),
            channel_capacity: 64,
            awareness_sweep: Duration::from_millis(50),
            ..Default::default()
        }
    }

    pub fn with_doc(mut self, doc_id: Uuid) -> Self {
        self.doc_id = doc_id;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.peer_name = name.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Syncing,
    Synced,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        !matches!(self, SessionState::Disconnected)
    }
}

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Sync finished with causal gaps no peer could fill.
    Stalled { missing: VectorClock },
    PeerJoined(PeerInfo),
    PeerLeft(ReplicaId),
    AwarenessChanged(ReplicaId),
}

#[derive(Debug, Clone)]
struct PeerState {
    info: PeerInfo,
    /// Latest frontier the peer reported.
    frontier: VectorClock,
}

pub struct SyncSession {
    config: SessionConfig,
    replica: Replica,
    state: SessionState,
    peers: HashMap<ReplicaId, PeerState>,
    /// Peers whose `SyncStep2` has not arrived yet.
    awaiting: HashSet<ReplicaId>,
    /// Frontiers peers reported in their `SyncStep2` this round.
    target: VectorClock,
    full_requested: bool,
    stalled_reported: bool,
    awareness: AwarenessChannel,
    outbox: VecDeque<Vec<u8>>,
    events: VecDeque<SessionEvent>,
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("replica", &self.replica)
            .field("state", &self.state)
            .field("peers", &self.peers.len())
            .field("outbox", &self.outbox.len())
            .finish()
    }
}

impl SyncSession {
    pub fn new(id: ReplicaId, config: SessionConfig) -> Self {
        let awareness = AwarenessChannel::new(id, config.awareness_timeout);
        Self {
            config,
            replica: Replica::new(id),
            state: SessionState::Disconnected,
            peers: HashMap::new(),
            awaiting: HashSet::new(),
            target: VectorClock::new(),
            full_requested: false,
            stalled_reported: false,
            awareness,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.replica.id()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo::with_id(self.id(), self.config.peer_name.clone())
    }

    /// Peers currently in the room, excluding self.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.values().map(|p| p.info.clone()).collect()
    }

    pub fn get_document_snapshot(&self) -> DocumentSnapshot {
        self.replica.snapshot()
    }

    pub fn subscribe(&mut self, callback: impl FnMut(&Change) + Send + 'static) {
        self.replica.subscribe(callback);
    }

    // ─────────────────────────────────────────────────────────────────
    // Connection lifecycle
    // ─────────────────────────────────────────────────────────────────

    /// Announce ourselves and request what we are missing.
    pub fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.state.is_connected() {
            return Ok(());
        }
        self.set_state(SessionState::Connecting);
        self.full_requested = false;
        self.stalled_reported = false;
        self.target = VectorClock::new();

        let hello = SyncMessage::peer_joined(self.id(), self.config.doc_id, &self.peer_info())?;
        self.queue(hello)?;
        let request = SyncRequest {
            frontier: self.replica.frontier().clone(),
            full: false,
        };
        let step1 = SyncMessage::sync_step1(self.id(), self.config.doc_id, &request)?;
        self.queue(step1)
    }

    /// Stop all outbound traffic. Pending local operations are kept and
    /// retransmitted by the next sync.
    pub fn disconnect(&mut self) {
        if !self.state.is_connected() {
            return;
        }
        self.outbox.clear();
        self.peers.clear();
        self.awaiting.clear();
        self.target = VectorClock::new();
        self.full_requested = false;
        self.stalled_reported = false;
        self.awareness.reset();
        self.set_state(SessionState::Disconnected);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        log::info!("{} session {:?} -> {:?}", self.id(), self.state, state);
        self.state = state;
        self.events.push_back(SessionEvent::StateChanged(state));
    }

    // ─────────────────────────────────────────────────────────────────
    // Local edits and awareness
    // ─────────────────────────────────────────────────────────────────

    /// Apply a local edit. It is transmitted right away once the session
    /// is syncing, otherwise it waits in the pending log.
    pub fn submit_edit_intent(&mut self, intent: EditIntent) -> Result<OperationId, EditError> {
        let op = self.replica.submit(intent)?;
        let id = op.id;
        if matches!(self.state, SessionState::Syncing | SessionState::Synced) {
            if let Err(e) = self.send_operations(&[op], None) {
                log::error!("{} failed to encode {}: {}", self.id(), id, e);
            }
        }
        Ok(id)
    }

    pub fn set_local_awareness(&mut self, payload: Vec<u8>) -> Result<(), ProtocolError> {
        let clock = self.awareness.set_local(payload);
        if self.state.is_connected() {
            self.send_awareness(clock, None)?;
        }
        Ok(())
    }

    pub fn clear_local_awareness(&mut self) -> Result<(), ProtocolError> {
        let clock = self.awareness.clear_local();
        if self.state.is_connected() {
            self.send_awareness(clock, None)?;
        }
        Ok(())
    }

    pub fn get_awareness(&self, replica: &ReplicaId) -> Option<&[u8]> {
        self.awareness.get(replica)
    }

    /// Re-announce local awareness with a fresh clock once a third of the
    /// idle timeout has passed since it last changed, so peers that hear
    /// nothing else from us keep it.
    pub fn refresh_awareness(&mut self, now: Instant) -> Result<(), ProtocolError> {
        if !matches!(self.state, SessionState::Syncing | SessionState::Synced) {
            return Ok(());
        }
        match self.awareness.renew_local(now) {
            Some(clock) => self.send_awareness(clock, None),
            None => Ok(()),
        }
    }

    /// Drop awareness of peers idle past the configured timeout.
    pub fn expire_idle(&mut self, now: Instant) -> Vec<ReplicaId> {
        let expired = self.awareness.expire_idle(now);
        for id in &expired {
            log::trace!("{} awareness of {} expired", self.id(), id);
            self.events.push_back(SessionEvent::AwarenessChanged(*id));
        }
        expired
    }

    /// Drop history every known peer has applied. Returns the number of
    /// operations dropped.
    pub fn compact_history(&mut self) -> usize {
        let mut stable = self.replica.frontier().clone();
        for peer in self.peers.values() {
            stable = stable.meet(&peer.frontier);
        }
        self.replica.compact(&stable)
    }

    // ─────────────────────────────────────────────────────────────────
    // Transport interface
    // ─────────────────────────────────────────────────────────────────

    /// Next encoded frame to put on the wire.
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.outbox.pop_front()
    }

    pub fn has_transmit(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub fn drain_transmit(&mut self) -> Vec<Vec<u8>> {
        self.outbox.drain(..).collect()
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Frame known to carry operations (`Operations` or `SyncStep2`).
    pub fn on_remote_operation(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let msg = SyncMessage::decode(bytes)?;
        match msg.msg_type {
            MessageType::Operations | MessageType::SyncStep2 => self.dispatch(msg),
            actual => Err(ProtocolError::UnexpectedType {
                expected: MessageType::Operations,
                actual,
            }),
        }
    }

    pub fn on_remote_awareness(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let msg = SyncMessage::decode(bytes)?;
        match msg.msg_type {
            MessageType::Awareness => self.dispatch(msg),
            actual => Err(ProtocolError::UnexpectedType {
                expected: MessageType::Awareness,
                actual,
            }),
        }
    }

    /// Process any inbound frame.
    pub fn handle_frame(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let msg = SyncMessage::decode(bytes)?;
        self.dispatch(msg)
    }

    fn dispatch(&mut self, msg: SyncMessage) -> Result<(), ProtocolError> {
        if !self.state.is_connected() {
            return Ok(());
        }
        if msg.doc_id != self.config.doc_id || !msg.is_for(self.id()) {
            return Ok(());
        }
        match msg.msg_type {
            MessageType::Welcome => self.on_welcome(&msg),
            MessageType::PeerJoined => self.on_peer_joined(&msg),
            MessageType::PeerLeft => self.on_peer_left(msg.peer_id),
            MessageType::SyncStep1 => self.on_sync_step1(&msg),
            MessageType::SyncStep2 => self.on_sync_step2(&msg),
            MessageType::Operations => self.on_operations(&msg),
            MessageType::Ack => {
                let frontier = msg.ack_frontier()?;
                self.replica.ack(&frontier);
                self.record_frontier(msg.peer_id, &frontier);
                Ok(())
            }
            MessageType::Awareness => {
                let payload = msg.awareness_state()?;
                log::trace!("{} awareness from {} @{}", self.id(), msg.peer_id, msg.clock);
                if self
                    .awareness
                    .apply_remote(msg.peer_id, msg.clock, payload, Instant::now())
                {
                    self.events.push_back(SessionEvent::AwarenessChanged(msg.peer_id));
                }
                Ok(())
            }
            MessageType::Ping => {
                let pong = SyncMessage::pong(self.id(), self.config.doc_id).addressed_to(msg.peer_id);
                self.queue(pong)
            }
            MessageType::Pong => Ok(()),
        }
    }

    fn on_welcome(&mut self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let peers = msg.welcome_peers()?;
        log::info!("{} joined room {} with {} peers", self.id(), self.config.doc_id, peers.len());
        for info in peers {
            if info.peer_id == self.id() {
                continue;
            }
            self.add_peer(info);
        }
        if self.awareness.local().is_some() {
            self.send_awareness(self.awareness.local_clock(), None)?;
        }
        if self.peers.is_empty() {
            self.set_state(SessionState::Synced);
        } else {
            self.awaiting = self.peers.keys().copied().collect();
            self.set_state(SessionState::Syncing);
        }
        Ok(())
    }

    fn on_peer_joined(&mut self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let info = msg.peer_info()?;
        log::info!("{} sees {} ({}) join", self.id(), info.peer_id, info.name);
        self.add_peer(info);
        if self.awareness.local().is_some() {
            self.send_awareness(self.awareness.local_clock(), Some(msg.peer_id))?;
        }
        Ok(())
    }

    fn add_peer(&mut self, info: PeerInfo) {
        let id = info.peer_id;
        self.peers.insert(
            id,
            PeerState {
                info: info.clone(),
                frontier: VectorClock::new(),
            },
        );
        self.events.push_back(SessionEvent::PeerJoined(info));
    }

    fn on_peer_left(&mut self, peer: ReplicaId) -> Result<(), ProtocolError> {
        if self.peers.remove(&peer).is_none() {
            return Ok(());
        }
        log::info!("{} sees {} leave", self.id(), peer);
        self.awaiting.remove(&peer);
        if self.awareness.remove(&peer) {
            self.events.push_back(SessionEvent::AwarenessChanged(peer));
        }
        self.events.push_back(SessionEvent::PeerLeft(peer));
        self.check_complete()
    }

    fn on_sync_step1(&mut self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let request = msg.sync_request()?;
        let ops = if request.full {
            self.replica.history()
        } else {
            self.replica.missing_for(&request.frontier)
        };
        if !self.replica.log().can_serve(&request.frontier) {
            log::debug!(
                "{} cannot fully serve {}: history was compacted",
                self.id(),
                msg.peer_id
            );
        }
        self.record_frontier(msg.peer_id, &request.frontier);

        let reply = SyncReply {
            ops,
            frontier: self.replica.frontier().clone(),
        };
        let step2 = SyncMessage::sync_step2(self.id(), self.config.doc_id, &reply)?;
        self.queue(step2.addressed_to(msg.peer_id))
    }

    fn on_sync_step2(&mut self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let reply = msg.sync_reply()?;
        let applied = self.replica.receive_all(reply.ops);
        log::debug!("{} applied {} operations from {}", self.id(), applied, msg.peer_id);

        self.replica.ack(&reply.frontier);
        self.record_frontier(msg.peer_id, &reply.frontier);
        self.target.merge(&reply.frontier);

        let lacking = self.replica.missing_for(&reply.frontier);
        if !lacking.is_empty() {
            self.send_operations(&lacking, Some(msg.peer_id))?;
        }
        if applied > 0 {
            self.send_ack(msg.peer_id)?;
        }

        self.awaiting.remove(&msg.peer_id);
        self.check_complete()
    }

    fn on_operations(&mut self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let ops = msg.operations_payload()?;
        let applied = self.replica.receive_all(ops);
        log::debug!("{} applied {} operations from {}", self.id(), applied, msg.peer_id);
        self.send_ack(msg.peer_id)?;
        self.check_complete()
    }

    fn record_frontier(&mut self, peer: ReplicaId, frontier: &VectorClock) {
        if let Some(state) = self.peers.get_mut(&peer) {
            state.frontier.merge(frontier);
        }
    }

    /// Causal gaps left after every awaited peer answered.
    fn gaps(&self) -> VectorClock {
        let mut missing = self.replica.missing_dependencies();
        missing.merge(&self.replica.frontier().missing(&self.target));
        missing
    }

    fn check_complete(&mut self) -> Result<(), ProtocolError> {
        if self.state != SessionState::Syncing || !self.awaiting.is_empty() {
            return Ok(());
        }
        let missing = self.gaps();
        if missing.is_empty() {
            self.set_state(SessionState::Synced);
            return Ok(());
        }

        if !self.full_requested && !self.peers.is_empty() {
            self.full_requested = true;
            log::info!("{} still missing {:?}, requesting full history", self.id(), missing);
            self.awaiting = self.peers.keys().copied().collect();
            let request = SyncRequest {
                frontier: self.replica.frontier().clone(),
                full: true,
            };
            let step1 = SyncMessage::sync_step1(self.id(), self.config.doc_id, &request)?;
            return self.queue(step1);
        }

        if !self.stalled_reported {
            self.stalled_reported = true;
            log::warn!("{} sync stalled, missing {:?}", self.id(), missing);
            self.events.push_back(SessionEvent::Stalled { missing });
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // Outbound frames
    // ─────────────────────────────────────────────────────────────────

    fn queue(&mut self, msg: SyncMessage) -> Result<(), ProtocolError> {
        self.outbox.push_back(msg.encode()?);
        Ok(())
    }

    fn send_operations(&mut self, ops: &[Operation], to: Option<ReplicaId>) -> Result<(), ProtocolError> {
        let lamport = self.replica.log().lamport();
        let mut msg = SyncMessage::operations(self.id(), self.config.doc_id, lamport, ops)?;
        if let Some(to) = to {
            msg = msg.addressed_to(to);
        }
        self.queue(msg)
    }

    fn send_ack(&mut self, to: ReplicaId) -> Result<(), ProtocolError> {
        let ack = SyncMessage::ack(self.id(), self.config.doc_id, self.replica.frontier())?;
        self.queue(ack.addressed_to(to))
    }

    fn send_awareness(&mut self, clock: u64, to: Option<ReplicaId>) -> Result<(), ProtocolError> {
        let mut msg =
            SyncMessage::awareness(self.id(), self.config.doc_id, clock, self.awareness.local())?;
        if let Some(to) = to {
            msg = msg.addressed_to(to);
        }
        self.queue(msg)
    }
}
