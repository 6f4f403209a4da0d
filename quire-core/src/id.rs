//! Identity types shared by every layer of the sync core.
//!
//! Nothing in the document is addressed by integer position. Nodes,
//! characters and operations all carry identities that survive concurrent
//! edits, and `Stamp` gives those identities a total order for tie-breaks.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one replica (one client session) of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub Uuid);

impl ReplicaId {
    /// Reserved id that owns the root node. Never assigned to a session.
    pub const NIL: ReplicaId = ReplicaId(Uuid::nil());

    /// Fresh random id, assigned once per session.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create with an explicit value (for testing).
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 hex digits are enough to tell replicas apart in logs.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// `(replica, seq)`: unique id of an operation.
///
/// `seq` is contiguous per replica starting at 1, so a vector clock entry
/// of `n` means "operations 1..=n of this replica have been applied".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId {
    pub replica: ReplicaId,
    pub seq: u64,
}

impl OperationId {
    pub const fn new(replica: ReplicaId, seq: u64) -> Self {
        Self { replica, seq }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.replica, self.seq)
    }
}

/// Stable identity of a document node: the id of the insert that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey(pub OperationId);

impl NodeKey {
    /// The document root. Exists on every replica from the start.
    pub const ROOT: NodeKey = NodeKey(OperationId::new(ReplicaId::NIL, 0));

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }

    pub fn op(&self) -> OperationId {
        self.0
    }
}

impl From<OperationId> for NodeKey {
    fn from(id: OperationId) -> Self {
        NodeKey(id)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("root")
        } else {
            write!(f, "node:{}", self.0)
        }
    }
}

/// Identity of a single character: the splice that inserted it plus its
/// offset within that splice's inserted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CharId {
    pub op: OperationId,
    pub offset: u32,
}

impl CharId {
    pub const fn new(op: OperationId, offset: u32) -> Self {
        Self { op, offset }
    }
}

impl fmt::Display for CharId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.op, self.offset)
    }
}

/// Total order over concurrent insertions: Lamport time, then replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub lamport: u64,
    pub replica: ReplicaId,
}

impl Stamp {
    pub const fn new(lamport: u64, replica: ReplicaId) -> Self {
        Self { lamport, replica }
    }
}

/// Position identity within an ordered sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Anchor<K> {
    /// Before every existing item.
    Start,
    /// Immediately after the item with this identity.
    After(K),
}
