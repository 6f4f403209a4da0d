//! Read-only view of the visible document.
//!
//! Two replicas that applied the same set of operations produce equal
//! snapshots; that equality is what convergence tests compare.

use serde::{Deserialize, Serialize};

use crate::document::NodeKind;
use crate::id::NodeKey;

/// One visible node. Trees can be arbitrarily deep, so every walk over
/// them (including clone, equality and drop) uses an explicit stack.
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub key: NodeKey,
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub children: Vec<SnapshotNode>,
}

impl SnapshotNode {
    pub(crate) fn missing(key: NodeKey) -> Self {
        Self {
            key,
            kind: NodeKind::Element,
            tag: None,
            text: None,
            children: Vec::new(),
        }
    }

    /// Same node without its children.
    fn shallow(&self, children: Vec<SnapshotNode>) -> Self {
        Self {
            key: self.key,
            kind: self.kind,
            tag: self.tag.clone(),
            text: self.text.clone(),
            children,
        }
    }

    /// Pre-order walk.
    fn descendants(&self) -> impl Iterator<Item = &SnapshotNode> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.children.iter().rev());
            Some(node)
        })
    }
}

impl Clone for SnapshotNode {
    fn clone(&self) -> Self {
        struct Frame<'a> {
            source: &'a SnapshotNode,
            children: Vec<SnapshotNode>,
        }

        fn frame(source: &SnapshotNode) -> Frame<'_> {
            Frame {
                source,
                children: Vec::with_capacity(source.children.len()),
            }
        }

        let mut stack = vec![frame(self)];
        while let Some(top) = stack.last_mut() {
            let source = top.source;
            if let Some(child) = source.children.get(top.children.len()) {
                stack.push(frame(child));
                continue;
            }
            let Some(done) = stack.pop() else { break };
            let node = done.source.shallow(done.children);
            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None => return node,
            }
        }
        self.shallow(Vec::new())
    }
}

impl PartialEq for SnapshotNode {
    fn eq(&self, other: &Self) -> bool {
        let mut stack = vec![(self, other)];
        while let Some((a, b)) = stack.pop() {
            if a.key != b.key
                || a.kind != b.kind
                || a.tag != b.tag
                || a.text != b.text
                || a.children.len() != b.children.len()
            {
                return false;
            }
            stack.extend(a.children.iter().zip(&b.children));
        }
        true
    }
}

impl Eq for SnapshotNode {}

impl Drop for SnapshotNode {
    fn drop(&mut self) {
        let mut stack = std::mem::take(&mut self.children);
        while let Some(mut node) = stack.pop() {
            stack.append(&mut node.children);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub root: SnapshotNode,
}

impl DocumentSnapshot {
    /// All visible text in document order.
    pub fn text(&self) -> String {
        self.root
            .descendants()
            .filter_map(|node| node.text.as_deref())
            .collect()
    }

    /// Visible nodes, root included.
    pub fn node_count(&self) -> usize {
        self.root.descendants().count()
    }

    pub fn find(&self, key: &NodeKey) -> Option<&SnapshotNode> {
        self.root.descendants().find(|node| node.key == *key)
    }

    /// Compact JSON in the same shape as the serde form, written without
    /// recursion.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        enum Step<'a> {
            Node(&'a SnapshotNode),
            Raw(&'static str),
        }

        let mut out = String::new();
        let mut steps = vec![Step::Node(&self.root)];
        while let Some(step) = steps.pop() {
            let node = match step {
                Step::Raw(raw) => {
                    out.push_str(raw);
                    continue;
                }
                Step::Node(node) => node,
            };
            out.push_str("{\"key\":");
            out.push_str(&serde_json::to_string(&node.key)?);
            out.push_str(",\"kind\":");
            out.push_str(&serde_json::to_string(&node.kind)?);
            if let Some(tag) = &node.tag {
                out.push_str(",\"tag\":");
                out.push_str(&serde_json::to_string(tag)?);
            }
            if let Some(text) = &node.text {
                out.push_str(",\"text\":");
                out.push_str(&serde_json::to_string(text)?);
            }
            if node.children.is_empty() {
                out.push('}');
                continue;
            }
            out.push_str(",\"children\":[");
            steps.push(Step::Raw("]}"));
            for (i, child) in node.children.iter().enumerate().rev() {
                steps.push(Step::Node(child));
                if i > 0 {
                    steps.push(Step::Raw(","));
                }
            }
        }
        Ok(format!("{{\"root\":{out}}}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{OperationId, ReplicaId};

    fn node(seq: u64, text: Option<&str>, children: Vec<SnapshotNode>) -> SnapshotNode {
        SnapshotNode {
            key: NodeKey(OperationId::new(ReplicaId::from_u128(1), seq)),
            kind: if text.is_some() {
                NodeKind::Text
            } else {
                NodeKind::Element
            },
            tag: None,
            text: text.map(str::to_string),
            children,
        }
    }

    #[test]
    fn test_text_concatenates_in_order() {
        let snapshot = DocumentSnapshot {
            root: SnapshotNode {
                key: NodeKey::ROOT,
                kind: NodeKind::Root,
                tag: None,
                text: None,
                children: vec![
                    node(1, None, vec![node(2, Some("Hello "), vec![])]),
                    node(3, Some("world"), vec![]),
                ],
            },
        };
        assert_eq!(snapshot.text(), "Hello world");
        assert_eq!(snapshot.node_count(), 4);
        assert!(snapshot.find(&node(2, None, vec![]).key).is_some());
    }

    #[test]
    fn test_json_export() {
        let snapshot = DocumentSnapshot {
            root: SnapshotNode {
                key: NodeKey::ROOT,
                kind: NodeKind::Root,
                tag: None,
                text: None,
                children: vec![],
            },
        };
        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"Root\""));
        let back: DocumentSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);

        let mut tagged = node(1, None, vec![node(2, Some("a \"b\""), vec![])]);
        tagged.tag = Some("p".to_string());
        let nested = DocumentSnapshot {
            root: SnapshotNode {
                key: NodeKey::ROOT,
                kind: NodeKind::Root,
                tag: None,
                text: None,
                children: vec![tagged, node(3, Some("c"), vec![])],
            },
        };
        let json = nested.to_json().unwrap();
        assert_eq!(json, serde_json::to_string(&nested).unwrap());
        let back: DocumentSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, nested);
    }

    #[test]
    fn test_deep_tree_is_walked_without_recursion() {
        let depth = 50_000u64;
        let mut chain = node(depth + 1, Some("leaf"), vec![]);
        for seq in (1..=depth).rev() {
            chain = node(seq, None, vec![chain]);
        }
        let snapshot = DocumentSnapshot {
            root: SnapshotNode {
                key: NodeKey::ROOT,
                kind: NodeKind::Root,
                tag: None,
                text: None,
                children: vec![chain],
            },
        };

        assert_eq!(snapshot.text(), "leaf");
        assert_eq!(snapshot.node_count(), depth as usize + 2);
        assert!(snapshot.find(&node(depth + 1, None, vec![]).key).is_some());

        let json = snapshot.to_json().unwrap();
        assert!(json.ends_with("}]}]}}"));

        let copy = snapshot.clone();
        assert!(copy == snapshot);
        drop(copy);
        drop(snapshot);
    }
}
