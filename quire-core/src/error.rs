use thiserror::Error;

use crate::id::{CharId, NodeKey};

/// Failure to apply an operation to the document tree.
///
/// With causal delivery in place these only arise from malformed
/// operations; the tree is never partially mutated when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("orphan reference: {0} is not resolvable")]
    OrphanReference(NodeKey),
    #[error("orphan reference: character {0} is not resolvable")]
    MissingChar(CharId),
    #[error("inserting {key} under {parent} would create a cycle")]
    Cycle { key: NodeKey, parent: NodeKey },
    #[error("node key {0} already exists")]
    DuplicateKey(NodeKey),
    #[error("{0} cannot hold children")]
    NotContainer(NodeKey),
    #[error("{0} is not a text node")]
    NotText(NodeKey),
    #[error("the root node cannot be removed")]
    RootRemoval,
    #[error("invalid node seed for {0}")]
    InvalidSeed(NodeKey),
}

impl DocumentError {
    /// Structural violations: the operation would break a tree invariant.
    pub fn is_structural(&self) -> bool {
        matches!(self, DocumentError::Cycle { .. } | DocumentError::RootRemoval)
    }
}

/// A local edit intent that cannot be turned into an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditError {
    #[error("unknown node {0}")]
    UnknownNode(NodeKey),
    #[error("node {0} has been removed")]
    Tombstoned(NodeKey),
    #[error("{0} cannot hold children")]
    NotContainer(NodeKey),
    #[error("{0} is not a text node")]
    NotText(NodeKey),
    #[error("the root node cannot be removed")]
    RootRemoval,
    #[error("splice on {0} neither deletes nor inserts")]
    EmptySplice(NodeKey),
    #[error("local operation rejected: {0}")]
    Rejected(#[from] DocumentError),
}
