//! In-process relay: every replica in the same process shares one set of
//! rooms, routed by the same loop the WebSocket relay uses.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::actor::{Connector, Link};
use crate::broadcast::Rooms;
use crate::protocol::ProtocolError;
use crate::relay::{serve_peer, RelayConfig};

#[derive(Clone)]
pub struct LocalHub {
    rooms: Arc<Rooms>,
    max_peers: usize,
    link_capacity: usize,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::with_config(&RelayConfig::default())
    }

    pub fn with_config(config: &RelayConfig) -> Self {
        Self {
            rooms: Arc::new(Rooms::new(config.broadcast_capacity)),
            max_peers: config.max_peers_per_room,
            link_capacity: config.link_capacity,
        }
    }

    pub fn rooms(&self) -> &Arc<Rooms> {
        &self.rooms
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for LocalHub {
    fn connect(&self, doc_id: Uuid) -> BoxFuture<'static, Result<Link, ProtocolError>> {
        let rooms = self.rooms.clone();
        let max_peers = self.max_peers;
        let capacity = self.link_capacity;

        Box::pin(async move {
            let (to_hub, from_peer) = mpsc::channel(capacity);
            let (to_peer, from_hub) = mpsc::channel(capacity);
            tokio::spawn(async move {
                if let Err(e) = serve_peer(rooms, max_peers, from_peer, to_peer).await {
                    log::warn!("Local peer for doc {doc_id} rejected: {e}");
                }
            });
            Ok(Link {
                outbound: to_hub,
                inbound: from_hub,
            })
        })
    }
}
