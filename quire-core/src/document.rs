//! The replicated document tree.
//!
//! Nodes live in a flat arena keyed by `NodeKey`; parent/child links are
//! keys, never references. Children and text are both RGA sequences, so a
//! node or character that was ever inserted stays addressable after it is
//! removed. The root exists on every replica from the start and is never
//! removed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::DocumentError;
use crate::id::{Anchor, CharId, NodeKey, OperationId, Stamp};
use crate::operation::NodeSeed;
use crate::sequence::Sequence;
use crate::snapshot::{DocumentSnapshot, SnapshotNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Root,
    Element,
    Text,
}

impl NodeKind {
    pub fn is_container(&self) -> bool {
        matches!(self, NodeKind::Root | NodeKind::Element)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Content {
    Children(Sequence<NodeKey, ()>),
    Text(Sequence<CharId, char>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    key: NodeKey,
    kind: NodeKind,
    tag: Option<String>,
    parent: Option<NodeKey>,
    content: Content,
    removed: bool,
}

impl Node {
    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// `None` only for the root.
    pub fn parent(&self) -> Option<NodeKey> {
        self.parent
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Visible children in order. Empty for text nodes.
    pub fn children(&self) -> Vec<NodeKey> {
        match &self.content {
            Content::Children(seq) => seq.visible_ids(),
            Content::Text(_) => Vec::new(),
        }
    }

    /// Visible text. `None` for containers.
    pub fn text(&self) -> Option<String> {
        match &self.content {
            Content::Text(seq) => Some(seq.visible().map(|(_, c)| *c).collect()),
            Content::Children(_) => None,
        }
    }

    pub(crate) fn child_sequence(&self) -> Option<&Sequence<NodeKey, ()>> {
        match &self.content {
            Content::Children(seq) => Some(seq),
            Content::Text(_) => None,
        }
    }

    pub(crate) fn text_sequence(&self) -> Option<&Sequence<CharId, char>> {
        match &self.content {
            Content::Text(seq) => Some(seq),
            Content::Children(_) => None,
        }
    }
}

/// A node whose live children are still being materialized.
struct Frame<'a> {
    key: NodeKey,
    node: Option<&'a Node>,
    pending: std::vec::IntoIter<NodeKey>,
    children: Vec<SnapshotNode>,
}

impl Frame<'_> {
    fn finish(self) -> SnapshotNode {
        let Some(node) = self.node else {
            return SnapshotNode::missing(self.key);
        };
        SnapshotNode {
            key: node.key,
            kind: node.kind,
            tag: node.tag.clone(),
            text: node.text(),
            children: self.children,
        }
    }
}

/// What applying a mutation did to the visible document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    Changed,
    /// Already applied, or nothing visible changed.
    Unchanged,
    /// Integrated into a removed subtree; invisible by deletion dominance.
    Suppressed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    nodes: HashMap<NodeKey, Node>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        let root = Node {
            key: NodeKey::ROOT,
            kind: NodeKind::Root,
            tag: None,
            parent: None,
            content: Content::Children(Sequence::new()),
            removed: false,
        };
        let mut nodes = HashMap::new();
        nodes.insert(NodeKey::ROOT, root);
        Self { nodes }
    }

    pub fn node(&self, key: &NodeKey) -> Option<&Node> {
        self.nodes.get(key)
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    /// Known and not removed.
    pub fn is_live(&self, key: &NodeKey) -> bool {
        self.nodes.get(key).is_some_and(|node| !node.removed)
    }

    pub fn children(&self, key: &NodeKey) -> Option<Vec<NodeKey>> {
        self.nodes.get(key).map(Node::children)
    }

    pub fn text(&self, key: &NodeKey) -> Option<String> {
        self.nodes.get(key).and_then(Node::text)
    }

    /// Every node ever created, tombstones and root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn live_count(&self) -> usize {
        self.nodes.values().filter(|node| !node.removed).count()
    }

    /// Whether `ancestor` is `key` or one of its ancestors.
    pub fn is_ancestor_or_self(&self, ancestor: &NodeKey, key: &NodeKey) -> bool {
        let mut current = Some(*key);
        while let Some(k) = current {
            if k == *ancestor {
                return true;
            }
            current = self.nodes.get(&k).and_then(|node| node.parent);
        }
        false
    }

    /// Materialize the live tree. Built bottom-up with an explicit stack,
    /// since peers can nest elements arbitrarily deep.
    pub fn snapshot(&self) -> DocumentSnapshot {
        let mut stack = vec![self.frame(NodeKey::ROOT)];
        while let Some(top) = stack.last_mut() {
            if let Some(child) = top.pending.next() {
                let frame = self.frame(child);
                stack.push(frame);
                continue;
            }
            let Some(done) = stack.pop() else { break };
            let node = done.finish();
            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None => return DocumentSnapshot { root: node },
            }
        }
        DocumentSnapshot {
            root: SnapshotNode::missing(NodeKey::ROOT),
        }
    }

    fn frame(&self, key: NodeKey) -> Frame<'_> {
        let node = self.nodes.get(&key);
        let pending: Vec<NodeKey> = node
            .map(Node::children)
            .unwrap_or_default()
            .into_iter()
            .filter(|child| self.is_live(child))
            .collect();
        Frame {
            key,
            node,
            children: Vec::with_capacity(pending.len()),
            pending: pending.into_iter(),
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Mutation. Every check happens before the first write, so an error
    // leaves the tree untouched.
    // ─────────────────────────────────────────────────────────────────

    pub(crate) fn apply_insert(
        &mut self,
        parent: NodeKey,
        anchor: Anchor<NodeKey>,
        seed: &NodeSeed,
        stamp: Stamp,
    ) -> Result<Effect, DocumentError> {
        let content = match seed.kind {
            NodeKind::Root => return Err(DocumentError::InvalidSeed(seed.key)),
            NodeKind::Element if !seed.text.is_empty() => {
                return Err(DocumentError::InvalidSeed(seed.key))
            }
            NodeKind::Element => Content::Children(Sequence::new()),
            NodeKind::Text => {
                let mut text = Sequence::new();
                let chars = seed
                    .text
                    .chars()
                    .enumerate()
                    .map(|(i, c)| (CharId::new(seed.key.op(), i as u32), c));
                // A fresh sequence has no anchors to miss.
                let _ = text.integrate_run(Anchor::Start, chars, stamp);
                Content::Text(text)
            }
        };

        if self.nodes.contains_key(&seed.key) {
            if self.is_ancestor_or_self(&seed.key, &parent) {
                return Err(DocumentError::Cycle {
                    key: seed.key,
                    parent,
                });
            }
            return Err(DocumentError::DuplicateKey(seed.key));
        }

        let parent_node = self
            .nodes
            .get_mut(&parent)
            .ok_or(DocumentError::OrphanReference(parent))?;
        let born_removed = parent_node.removed;
        let Content::Children(siblings) = &mut parent_node.content else {
            return Err(DocumentError::NotContainer(parent));
        };
        siblings
            .integrate(anchor, seed.key, stamp, ())
            .map_err(|missing| DocumentError::OrphanReference(missing.0))?;

        self.nodes.insert(
            seed.key,
            Node {
                key: seed.key,
                kind: seed.kind,
                tag: seed.tag.clone(),
                parent: Some(parent),
                content,
                removed: born_removed,
            },
        );

        Ok(if born_removed {
            Effect::Suppressed
        } else {
            Effect::Changed
        })
    }

    /// Tombstone `key` and its whole subtree.
    pub(crate) fn apply_remove(&mut self, key: NodeKey) -> Result<Effect, DocumentError> {
        if key.is_root() {
            return Err(DocumentError::RootRemoval);
        }
        let node = self
            .nodes
            .get(&key)
            .ok_or(DocumentError::OrphanReference(key))?;
        let was_live = !node.removed;
        let parent = node.parent.ok_or(DocumentError::RootRemoval)?;
        if !self.nodes.contains_key(&parent) {
            return Err(DocumentError::OrphanReference(parent));
        }

        if let Some(Node {
            content: Content::Children(siblings),
            ..
        }) = self.nodes.get_mut(&parent)
        {
            siblings.remove(&key);
        }

        let mut stack = vec![key];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&current) else {
                continue;
            };
            node.removed = true;
            if let Content::Children(children) = &node.content {
                stack.extend(children.ids().copied());
            }
        }

        Ok(if was_live {
            Effect::Changed
        } else {
            Effect::Unchanged
        })
    }

    /// Remove `removed` characters, then insert `text` after `anchor`.
    /// New characters are identified by `(op, offset)`.
    pub(crate) fn apply_splice(
        &mut self,
        key: NodeKey,
        anchor: Anchor<CharId>,
        removed: &[CharId],
        op: OperationId,
        text: &str,
        stamp: Stamp,
    ) -> Result<Effect, DocumentError> {
        let node = self
            .nodes
            .get_mut(&key)
            .ok_or(DocumentError::OrphanReference(key))?;
        if node.removed {
            return Ok(Effect::Suppressed);
        }
        let Content::Text(chars) = &mut node.content else {
            return Err(DocumentError::NotText(key));
        };

        if let Anchor::After(id) = anchor {
            if !chars.contains(&id) {
                return Err(DocumentError::MissingChar(id));
            }
        }
        if let Some(id) = removed.iter().find(|id| !chars.contains(id)) {
            return Err(DocumentError::MissingChar(*id));
        }

        let mut changed = false;
        for id in removed {
            changed |= chars.remove(id).unwrap_or(false);
        }
        let run = text
            .chars()
            .enumerate()
            .map(|(i, c)| (CharId::new(op, i as u32), c));
        let inserted = chars
            .integrate_run(anchor, run, stamp)
            .map_err(|missing| DocumentError::MissingChar(missing.0))?;

        Ok(if changed || inserted > 0 {
            Effect::Changed
        } else {
            Effect::Unchanged
        })
    }
}
