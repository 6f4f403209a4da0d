//! Applying one operation to a document.
//!
//! Deletion dominance: an edit whose target lies inside a removed subtree
//! is integrated (so the tree stays identical on every replica) but has no
//! visible effect. Operations that cannot be resolved at all are returned
//! as errors and leave the document untouched.

use crate::document::{Document, Effect};
use crate::error::DocumentError;
use crate::id::NodeKey;
use crate::operation::{OpBody, Operation};

/// Visible change produced by an applied operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    NodeInserted { parent: NodeKey, key: NodeKey },
    NodeRemoved { key: NodeKey },
    TextChanged { key: NodeKey },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied(ChangeKind),
    /// Integrated, but invisible because its target was removed.
    Suppressed,
    /// Integrated with no visible effect (e.g. removing a removed node).
    Redundant,
}

pub fn apply(doc: &mut Document, op: &Operation) -> Result<Outcome, DocumentError> {
    let stamp = op.stamp();
    match &op.body {
        OpBody::InsertChild {
            parent,
            anchor,
            node,
        } => {
            if node.key != NodeKey(op.id) {
                return Err(DocumentError::InvalidSeed(node.key));
            }
            let effect = doc.apply_insert(*parent, *anchor, node, stamp)?;
            Ok(outcome(
                effect,
                ChangeKind::NodeInserted {
                    parent: *parent,
                    key: node.key,
                },
            ))
        }
        OpBody::RemoveNode { key } => {
            let effect = doc.apply_remove(*key)?;
            Ok(outcome(effect, ChangeKind::NodeRemoved { key: *key }))
        }
        OpBody::SpliceText {
            key,
            anchor,
            removed,
            text,
        } => {
            let effect = doc.apply_splice(*key, *anchor, removed, op.id, text, stamp)?;
            Ok(outcome(effect, ChangeKind::TextChanged { key: *key }))
        }
    }
}

fn outcome(effect: Effect, kind: ChangeKind) -> Outcome {
    match effect {
        Effect::Changed => Outcome::Applied(kind),
        Effect::Unchanged => Outcome::Redundant,
        Effect::Suppressed => Outcome::Suppressed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::document::NodeKind;
    use crate::id::{Anchor, CharId, OperationId, ReplicaId};
    use crate::operation::NodeSeed;

    const A: ReplicaId = ReplicaId::from_u128(1);
    const B: ReplicaId = ReplicaId::from_u128(2);

    fn insert_text(replica: ReplicaId, seq: u64, lamport: u64, parent: NodeKey, text: &str) -> Operation {
        let id = OperationId::new(replica, seq);
        Operation {
            id,
            lamport,
            deps: VectorClock::new(),
            body: OpBody::InsertChild {
                parent,
                anchor: Anchor::Start,
                node: NodeSeed {
                    key: NodeKey(id),
                    kind: NodeKind::Text,
                    tag: None,
                    text: text.to_string(),
                },
            },
        }
    }

    fn remove(replica: ReplicaId, seq: u64, lamport: u64, key: NodeKey) -> Operation {
        Operation {
            id: OperationId::new(replica, seq),
            lamport,
            deps: VectorClock::new(),
            body: OpBody::RemoveNode { key },
        }
    }

    #[test]
    fn test_insert_reports_change() {
        let mut doc = Document::new();
        let op = insert_text(A, 1, 1, NodeKey::ROOT, "a");
        assert_eq!(
            apply(&mut doc, &op),
            Ok(Outcome::Applied(ChangeKind::NodeInserted {
                parent: NodeKey::ROOT,
                key: NodeKey(op.id)
            }))
        );
    }

    #[test]
    fn test_seed_key_must_match_op_id() {
        let mut doc = Document::new();
        let mut op = insert_text(A, 1, 1, NodeKey::ROOT, "a");
        op.id.seq = 2;
        assert!(matches!(apply(&mut doc, &op), Err(DocumentError::InvalidSeed(_))));
        assert!(doc.is_empty());
    }

    #[test]
    fn test_remove_twice_is_redundant() {
        let mut doc = Document::new();
        let ins = insert_text(A, 1, 1, NodeKey::ROOT, "a");
        apply(&mut doc, &ins).unwrap();
        let key = NodeKey(ins.id);
        assert_eq!(
            apply(&mut doc, &remove(A, 2, 2, key)),
            Ok(Outcome::Applied(ChangeKind::NodeRemoved { key }))
        );
        assert_eq!(apply(&mut doc, &remove(B, 1, 2, key)), Ok(Outcome::Redundant));
    }

    #[test]
    fn test_splice_after_concurrent_remove_is_suppressed() {
        let mut doc = Document::new();
        let ins = insert_text(A, 1, 1, NodeKey::ROOT, "ab");
        apply(&mut doc, &ins).unwrap();
        let key = NodeKey(ins.id);
        apply(&mut doc, &remove(A, 2, 2, key)).unwrap();

        let splice = Operation {
            id: OperationId::new(B, 1),
            lamport: 2,
            deps: [(A, 1)].into_iter().collect(),
            body: OpBody::SpliceText {
                key,
                anchor: Anchor::After(CharId::new(ins.id, 0)),
                removed: vec![],
                text: "X".into(),
            },
        };
        assert_eq!(apply(&mut doc, &splice), Ok(Outcome::Suppressed));
        assert_eq!(doc.snapshot().text(), "");
    }

    #[test]
    fn test_root_removal_is_structural() {
        let mut doc = Document::new();
        let err = apply(&mut doc, &remove(A, 1, 1, NodeKey::ROOT)).unwrap_err();
        assert!(err.is_structural());
    }
}
