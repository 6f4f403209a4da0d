//! Operations (replicated, identity-based) and edit intents (local,
//! index-based).
//!
//! The rendering layer speaks in indices and offsets because that is what
//! it sees on screen. Before an intent leaves the replica it is resolved
//! against the local document into identities, which is what makes the
//! resulting operation meaningful on every other replica.

use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::document::NodeKind;
use crate::id::{Anchor, CharId, NodeKey, OperationId, Stamp};

/// Everything needed to create a node on any replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSeed {
    pub key: NodeKey,
    pub kind: NodeKind,
    /// Element type as understood by the rendering layer.
    pub tag: Option<String>,
    /// Initial content of a Text node. Empty for elements.
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpBody {
    InsertChild {
        parent: NodeKey,
        anchor: Anchor<NodeKey>,
        node: NodeSeed,
    },
    RemoveNode {
        key: NodeKey,
    },
    /// Identity-resolved text splice: delete `removed`, then insert `text`
    /// right after `anchor`.
    SpliceText {
        key: NodeKey,
        anchor: Anchor<CharId>,
        removed: Vec<CharId>,
        text: String,
    },
}

impl OpBody {
    /// Node this operation targets (the parent, for inserts).
    pub fn target(&self) -> NodeKey {
        match self {
            OpBody::InsertChild { parent, .. } => *parent,
            OpBody::RemoveNode { key } | OpBody::SpliceText { key, .. } => *key,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpBody::InsertChild { .. } => "insert_child",
            OpBody::RemoveNode { .. } => "remove_node",
            OpBody::SpliceText { .. } => "splice_text",
        }
    }
}

/// An atomic, replayable, immutable edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub lamport: u64,
    /// Author's applied frontier when the operation was created, minus the
    /// author's own entry (implied by `id.seq`).
    pub deps: VectorClock,
    pub body: OpBody,
}

impl Operation {
    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.lamport, self.id.replica)
    }

    /// Frontier that must be applied before this operation is.
    pub fn requires(&self) -> VectorClock {
        let mut required = self.deps.clone();
        if self.id.seq > 1 {
            required.observe(self.id.replica, self.id.seq - 1);
        }
        required
    }
}

/// Content of a node the rendering layer wants to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NewNode {
    Element { tag: String },
    Text { text: String },
}

impl NewNode {
    pub fn element(tag: impl Into<String>) -> Self {
        NewNode::Element { tag: tag.into() }
    }

    pub fn text(text: impl Into<String>) -> Self {
        NewNode::Text { text: text.into() }
    }
}

/// A user edit expressed against the currently visible document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditIntent {
    InsertChild {
        parent: NodeKey,
        index: usize,
        node: NewNode,
    },
    RemoveNode {
        key: NodeKey,
    },
    SpliceText {
        key: NodeKey,
        offset: usize,
        delete_count: usize,
        insert_text: String,
    },
}

impl EditIntent {
    pub fn insert_element(parent: NodeKey, index: usize, tag: impl Into<String>) -> Self {
        EditIntent::InsertChild {
            parent,
            index,
            node: NewNode::element(tag),
        }
    }

    pub fn insert_text(parent: NodeKey, index: usize, text: impl Into<String>) -> Self {
        EditIntent::InsertChild {
            parent,
            index,
            node: NewNode::text(text),
        }
    }

    pub fn remove(key: NodeKey) -> Self {
        EditIntent::RemoveNode { key }
    }

    pub fn splice(key: NodeKey, offset: usize, delete_count: usize, insert_text: impl Into<String>) -> Self {
        EditIntent::SpliceText {
            key,
            offset,
            delete_count,
            insert_text: insert_text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ReplicaId;

    #[test]
    fn test_requires_includes_previous_own_op() {
        let a = ReplicaId::from_u128(1);
        let b = ReplicaId::from_u128(2);
        let op = Operation {
            id: OperationId::new(a, 3),
            lamport: 7,
            deps: [(b, 4)].into_iter().collect(),
            body: OpBody::RemoveNode {
                key: NodeKey(OperationId::new(b, 1)),
            },
        };
        let required = op.requires();
        assert_eq!(required.get(&a), 2);
        assert_eq!(required.get(&b), 4);
        assert_eq!(op.stamp(), Stamp::new(7, a));
    }

    #[test]
    fn test_first_op_requires_only_deps() {
        let a = ReplicaId::from_u128(1);
        let op = Operation {
            id: OperationId::new(a, 1),
            lamport: 1,
            deps: VectorClock::new(),
            body: OpBody::RemoveNode { key: NodeKey::ROOT },
        };
        assert!(op.requires().is_empty());
        assert_eq!(op.body.target(), NodeKey::ROOT);
        assert_eq!(op.body.name(), "remove_node");
    }
}
