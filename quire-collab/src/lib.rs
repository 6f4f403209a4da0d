//! # quire-collab: Sync sessions, presence and transport for Quire
//!
//! Moves operations between replicas of a `quire-core` document.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   commands    ┌──────────────┐   Link (bytes)   ┌─────────────┐
//! │ReplicaHandle │ ────────────► │ replica task │ ◄──────────────► │ LocalHub or │
//! │ (cloneable)  │ ◄──────────── │ SyncSession  │                  │ RelayServer │
//! └──────────────┘    events     └──────┬───────┘                  └──────┬──────┘
//!                                       │                                 │
//!                                       ▼                                 ▼
//!                                ┌──────────────┐                 ┌──────────────┐
//!                                │ Replica      │                 │ Room         │
//!                                │ (quire-core) │                 │ per document │
//!                                └──────────────┘                 └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`session`]: Sans-IO sync state machine
//! - [`awareness`]: Ephemeral presence, last-write-wins per replica
//! - [`actor`]: Tokio task owning a session, and the `Connector` seam
//! - [`broadcast`]: Document rooms and pre-routed frame fan-out
//! - [`relay`]: WebSocket relay and the shared routing loop
//! - [`hub`]: In-process relay for tests and embedding
//! - [`client`]: WebSocket connector

pub mod actor;
pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod hub;
pub mod protocol;
pub mod relay;
pub mod session;

// Re-exports for convenience
pub use actor::{spawn, Connector, Link, ReplicaHandle, SyncError};
pub use awareness::{AwarenessChannel, Caret, CursorColor, Presence};
pub use broadcast::{Membership, Room, RoomStats, Rooms, RoutedFrame};
pub use client::WsConnector;
pub use hub::LocalHub;
pub use protocol::{
    MessageType, PeerInfo, ProtocolError, SyncMessage, SyncReply, SyncRequest,
};
pub use relay::{serve_peer, RelayConfig, RelayServer, RelayStats};
pub use session::{SessionConfig, SessionEvent, SessionState, SyncSession};
