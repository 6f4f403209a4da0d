//! A replica: one document, its operation log, its applied frontier and a
//! causal buffer for operations that arrived before their dependencies.
//!
//! Local edits are applied immediately and returned for broadcast. Remote
//! operations are applied exactly once, and only after everything they
//! depend on.

use std::collections::BTreeMap;
use std::fmt;

use crate::clock::VectorClock;
use crate::document::{Document, Node, NodeKind};
use crate::error::EditError;
use crate::id::{NodeKey, OperationId, ReplicaId};
use crate::merge::{self, ChangeKind, Outcome};
use crate::oplog::OperationLog;
use crate::operation::{EditIntent, NewNode, NodeSeed, OpBody, Operation};
use crate::snapshot::DocumentSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// Notification delivered to subscribers for every visible change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    pub op: OperationId,
    pub origin: Origin,
    pub kind: ChangeKind,
}

/// What `receive` did with an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// Applied, possibly releasing buffered operations too.
    Applied,
    /// Already applied or already buffered.
    Duplicate,
    /// Dependencies missing; held until they arrive.
    Buffered,
    /// Malformed; dropped (its id still counts as delivered).
    Discarded,
}

type Subscriber = Box<dyn FnMut(&Change) + Send>;

pub struct Replica {
    id: ReplicaId,
    document: Document,
    log: OperationLog,
    frontier: VectorClock,
    buffer: BTreeMap<OperationId, Operation>,
    subscribers: Vec<Subscriber>,
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.id)
            .field("frontier", &self.frontier)
            .field("buffered", &self.buffer.len())
            .field("pending", &self.log.pending_len())
            .finish()
    }
}

impl Replica {
    pub fn new(id: ReplicaId) -> Self {
        Self {
            id,
            document: Document::new(),
            log: OperationLog::new(id),
            frontier: VectorClock::new(),
            buffer: BTreeMap::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        self.document.snapshot()
    }

    /// Highest contiguous sequence applied per replica.
    pub fn frontier(&self) -> &VectorClock {
        &self.frontier
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    /// Register a callback for every visible change, local or remote.
    pub fn subscribe(&mut self, callback: impl FnMut(&Change) + Send + 'static) {
        self.subscribers.push(Box::new(callback));
    }

    // ─────────────────────────────────────────────────────────────────
    // Local edits
    // ─────────────────────────────────────────────────────────────────

    /// Resolve `intent` against the current document, apply it and return
    /// the operation to broadcast.
    pub fn submit(&mut self, intent: EditIntent) -> Result<Operation, EditError> {
        let id = self.log.next_id();
        let body = self.resolve(intent, id)?;
        let op = Operation {
            id,
            lamport: self.log.next_lamport(),
            deps: self.frontier.without(&self.id),
            body,
        };

        let outcome = merge::apply(&mut self.document, &op)?;
        self.log.append(op.clone());
        self.frontier.observe(id.replica, id.seq);
        log::debug!("{} submitted {} {}", self.id, op.body.name(), op.id);

        if let Outcome::Applied(kind) = outcome {
            self.notify(Change {
                op: id,
                origin: Origin::Local,
                kind,
            });
        }
        Ok(op)
    }

    fn resolve(&self, intent: EditIntent, id: OperationId) -> Result<OpBody, EditError> {
        match intent {
            EditIntent::InsertChild {
                parent,
                index,
                node,
            } => {
                let parent_node = self.live_node(parent)?;
                let siblings = parent_node
                    .child_sequence()
                    .ok_or(EditError::NotContainer(parent))?;
                let (kind, tag, text) = match node {
                    NewNode::Element { tag } => (NodeKind::Element, Some(tag), String::new()),
                    NewNode::Text { text } => (NodeKind::Text, None, text),
                };
                Ok(OpBody::InsertChild {
                    parent,
                    anchor: siblings.anchor_at(index),
                    node: NodeSeed {
                        key: NodeKey(id),
                        kind,
                        tag,
                        text,
                    },
                })
            }
            EditIntent::RemoveNode { key } => {
                if key.is_root() {
                    return Err(EditError::RootRemoval);
                }
                self.live_node(key)?;
                Ok(OpBody::RemoveNode { key })
            }
            EditIntent::SpliceText {
                key,
                offset,
                delete_count,
                insert_text,
            } => {
                let chars = self
                    .live_node(key)?
                    .text_sequence()
                    .ok_or(EditError::NotText(key))?;
                let offset = offset.min(chars.visible_len());
                let removed = chars.visible_range(offset, delete_count);
                if removed.is_empty() && insert_text.is_empty() {
                    return Err(EditError::EmptySplice(key));
                }
                Ok(OpBody::SpliceText {
                    key,
                    anchor: chars.anchor_at(offset),
                    removed,
                    text: insert_text,
                })
            }
        }
    }

    fn live_node(&self, key: NodeKey) -> Result<&Node, EditError> {
        let node = self
            .document
            .node(&key)
            .ok_or(EditError::UnknownNode(key))?;
        if node.is_removed() {
            return Err(EditError::Tombstoned(key));
        }
        Ok(node)
    }

    // ─────────────────────────────────────────────────────────────────
    // Remote operations
    // ─────────────────────────────────────────────────────────────────

    /// Deliver a remote operation. Safe to call with duplicates and in any
    /// order.
    pub fn receive(&mut self, op: Operation) -> Receipt {
        if op.id.seq == 0 || op.id.replica == ReplicaId::NIL {
            log::warn!("{} discarding operation with reserved id {}", self.id, op.id);
            return Receipt::Discarded;
        }
        if self.frontier.contains(&op.id) || self.buffer.contains_key(&op.id) {
            return Receipt::Duplicate;
        }
        if !self.is_ready(&op) {
            log::trace!("{} buffering {} until its dependencies arrive", self.id, op.id);
            self.buffer.insert(op.id, op);
            return Receipt::Buffered;
        }

        let receipt = self.apply_remote(op);
        self.drain_buffer();
        receipt
    }

    /// Deliver a batch. Returns how many operations were applied, including
    /// ones released from the buffer.
    pub fn receive_all(&mut self, ops: impl IntoIterator<Item = Operation>) -> usize {
        let before = self.applied_count();
        for op in ops {
            self.receive(op);
        }
        self.applied_count().saturating_sub(before)
    }

    fn applied_count(&self) -> usize {
        self.frontier
            .iter()
            .map(|(_, seq)| usize::try_from(*seq).unwrap_or(usize::MAX))
            .fold(0, usize::saturating_add)
    }

    fn is_ready(&self, op: &Operation) -> bool {
        self.frontier.get(&op.id.replica) == op.id.seq - 1 && self.frontier.dominates(&op.deps)
    }

    fn apply_remote(&mut self, op: Operation) -> Receipt {
        self.log.observe(&op);
        self.frontier.observe(op.id.replica, op.id.seq);

        match merge::apply(&mut self.document, &op) {
            Ok(Outcome::Applied(kind)) => {
                self.notify(Change {
                    op: op.id,
                    origin: Origin::Remote,
                    kind,
                });
                Receipt::Applied
            }
            Ok(Outcome::Suppressed) => {
                log::debug!("{} suppressed {}: target was removed", self.id, op.id);
                Receipt::Applied
            }
            Ok(Outcome::Redundant) => Receipt::Applied,
            Err(e) => {
                log::warn!("{} discarding malformed operation {}: {}", self.id, op.id, e);
                Receipt::Discarded
            }
        }
    }

    fn drain_buffer(&mut self) {
        loop {
            let ready = self
                .buffer
                .values()
                .find(|op| self.is_ready(op))
                .map(|op| op.id);
            let Some(id) = ready else { break };
            if let Some(op) = self.buffer.remove(&id) {
                self.apply_remote(op);
            }
        }
    }

    fn notify(&mut self, change: Change) {
        for subscriber in &mut self.subscribers {
            subscriber(&change);
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Sync support
    // ─────────────────────────────────────────────────────────────────

    /// Operations a peer at `remote` has not applied yet.
    pub fn missing_for(&self, remote: &VectorClock) -> Vec<Operation> {
        self.log.missing_for(remote)
    }

    pub fn history(&self) -> Vec<Operation> {
        self.log.history()
    }

    /// Local operations not yet acknowledged by any peer.
    pub fn pending(&self) -> Vec<Operation> {
        self.log.pending().cloned().collect()
    }

    /// A peer reports it has applied everything up to `frontier`.
    pub fn ack(&mut self, frontier: &VectorClock) -> usize {
        self.log.ack(frontier)
    }

    /// Operations held back waiting for dependencies.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Frontier entries the buffered operations need that have not arrived.
    pub fn missing_dependencies(&self) -> VectorClock {
        let mut required = VectorClock::new();
        for op in self.buffer.values() {
            required.merge(&op.requires());
        }
        self.frontier.missing(&required)
    }

    /// No operation is waiting on a dependency.
    pub fn is_causally_complete(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop history every peer is known to have applied. `stable` is capped
    /// by the local frontier.
    pub fn compact(&mut self, stable: &VectorClock) -> usize {
        let stable = self.frontier.meet(stable);
        let dropped = self.log.compact(&stable);
        if dropped > 0 {
            log::info!("{} compacted {} operations from history", self.id, dropped);
        }
        dropped
    }
}
