//! Replicated document core: identity types, the RGA-backed document
//! tree, the operation log and the replica that ties them together.
//!
//! This crate does no I/O. Transport, sessions and presence live in
//! `quire-collab`.

pub mod clock;
pub mod document;
pub mod error;
pub mod id;
pub mod merge;
pub mod operation;
pub mod oplog;
pub mod replica;
pub mod sequence;
pub mod snapshot;

pub use clock::VectorClock;
pub use document::{Document, Node, NodeKind};
pub use error::{DocumentError, EditError};
pub use id::{Anchor, CharId, NodeKey, OperationId, ReplicaId, Stamp};
pub use merge::{ChangeKind, Outcome};
pub use operation::{EditIntent, NewNode, NodeSeed, OpBody, Operation};
pub use oplog::OperationLog;
pub use replica::{Change, Origin, Receipt, Replica};
pub use snapshot::{DocumentSnapshot, SnapshotNode};
