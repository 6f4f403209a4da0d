//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌──► Client A
//!             ├── Room (doc_id) ────┼──► Client B
//! Client B ──┘    broadcast::Room   └──► Client C
//! ```
//!
//! The relay holds no document state. It answers a peer's hello with a
//! `Welcome` listing who is already in the room, fans every other frame
//! out to the room, and announces `PeerLeft` when a connection ends.
//! Addressed frames reach every connection but only their recipient
//! keeps them.
//!
//! [`serve_peer`] is transport-agnostic (a pair of byte channels), so the
//! in-process hub and the WebSocket listener share one routing loop.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{Membership, Rooms, RoutedFrame};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Per-connection frame buffer between socket and room
    pub link_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            link_capacity: 256,
        }
    }
}

impl RelayConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_room: 8,
            broadcast_capacity: 64,
            link_capacity: 64,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
}

/// Route one peer's frames through its document room until either side
/// closes.
///
/// The first `PeerJoined` frame on `inbound` is the hello; frames before
/// it are dropped. Fails with [`ProtocolError::RoomFull`] if the room
/// already holds `max_peers` other replicas.
///
/// Reading `inbound` never waits on `outbound`. While the peer is slow to
/// drain `outbound`, room frames queue in its broadcast receiver; once that
/// overflows the link is closed.
pub async fn serve_peer(
    rooms: Arc<Rooms>,
    max_peers: usize,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
) -> Result<(), ProtocolError> {
    let (info, doc_id, hello) = loop {
        let Some(bytes) = inbound.recv().await else {
            return Ok(());
        };
        match SyncMessage::decode(&bytes) {
            Ok(msg) if msg.msg_type == MessageType::PeerJoined => {
                let info = msg.peer_info()?;
                break (info, msg.doc_id, RoutedFrame::new(&msg, bytes));
            }
            Ok(msg) => log::debug!("Dropping {:?} received before hello", msg.msg_type),
            Err(e) => log::warn!("Failed to decode frame before hello: {e}"),
        }
    };
    let me = info.peer_id;

    let (room, membership) = match rooms.join(doc_id, info.clone(), max_peers).await {
        Ok(joined) => joined,
        Err(e) => {
            log::warn!("Room {doc_id} refused {me}: {e}");
            return Err(e);
        }
    };
    let Membership {
        existing,
        receiver: mut room_rx,
    } = membership;

    let welcomed = match SyncMessage::welcome(doc_id, me, &existing).and_then(|msg| msg.encode()) {
        Ok(welcome) => outbound
            .send(welcome)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed),
        Err(e) => Err(e),
    };
    if let Err(e) = welcomed {
        rooms.leave(&room, &me).await;
        return Err(e);
    }
    room.publish(hello);
    log::info!("Peer {} ({}) joined doc {}", info.name, me, doc_id);

    // Next frame for the peer, held while `outbound` is full.
    let mut pending: Option<Arc<RoutedFrame>> = None;
    loop {
        tokio::select! {
            frame = inbound.recv() => {
                let Some(bytes) = frame else { break };
                match SyncMessage::decode(&bytes) {
                    Ok(msg) if msg.peer_id == me && msg.doc_id == doc_id => {
                        room.publish(RoutedFrame::new(&msg, bytes));
                    }
                    Ok(msg) => {
                        log::warn!("Dropping {:?} from {me} with foreign header", msg.msg_type);
                    }
                    Err(e) => log::warn!("Failed to decode frame from {me}: {e}"),
                }
            }

            frame = room_rx.recv(), if pending.is_none() => match frame {
                Ok(frame) => {
                    if frame.is_for(me) {
                        pending = Some(frame);
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    // Skipped frames are only recovered by a fresh sync.
                    log::warn!("Peer {me} lagged by {n} frames, closing its link");
                    break;
                }
                Err(RecvError::Closed) => break,
            },

            permit = outbound.reserve(), if pending.is_some() => match permit {
                Ok(permit) => {
                    if let Some(frame) = pending.take() {
                        permit.send(frame.bytes.clone());
                    }
                }
                Err(_) => break,
            },
        }
    }

    if rooms.leave(&room, &me).await.is_some() {
        match RoutedFrame::encode(&SyncMessage::peer_left(me, doc_id)) {
            Ok(frame) => {
                room.publish(frame);
            }
            Err(e) => log::warn!("Failed to announce {me} leaving: {e}"),
        }
        log::info!("Peer {} ({}) left doc {}", info.name, me, doc_id);
    } else {
        log::debug!("Stale connection of {me} closed; a newer one is still in doc {doc_id}");
    }
    Ok(())
}

/// Pongs queued by the reader; dropped if the writer falls this far behind.
const CONTROL_CAPACITY: usize = 8;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Write room frames and control replies to the socket until either
/// source closes.
async fn write_socket(
    mut sink: WsSink,
    mut frames: mpsc::Receiver<Vec<u8>>,
    mut control: mpsc::Receiver<Message>,
) {
    loop {
        let msg = tokio::select! {
            frame = frames.recv() => match frame {
                Some(bytes) => Message::Binary(bytes.into()),
                None => break,
            },
            msg = control.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        if let Err(e) = sink.send(msg).await {
            log::debug!("Socket write failed: {e}");
            return;
        }
    }
    let _ = sink.close().await;
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<Rooms>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(Rooms::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Bridge one WebSocket to [`serve_peer`]. Socket writes run on their
    /// own task so a slow reader on the far side never stops us reading.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<Rooms>,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(config.link_capacity);
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(config.link_capacity);
        let (control_tx, control_rx) = mpsc::channel::<Message>(CONTROL_CAPACITY);
        let peer = tokio::spawn(serve_peer(rooms, config.max_peers_per_room, in_rx, out_tx));
        let mut writer = tokio::spawn(write_socket(ws_sender, out_rx, control_rx));

        let reading = async {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        {
                            let mut s = stats.write().await;
                            s.total_frames += 1;
                            s.total_bytes += bytes.len() as u64;
                        }
                        if in_tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        if control_tx.try_send(Message::Pong(data)).is_err() {
                            log::debug!("Dropping pong to {addr}");
                        }
                    }
                    Ok(Message::Close(_)) => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = reading => {}
            _ = &mut writer => log::debug!("Socket to {addr} stopped accepting writes"),
        }

        drop(in_tx);
        drop(control_tx);
        match peer.await {
            Ok(Err(e)) => log::warn!("Peer from {addr} rejected: {e}"),
            Err(e) => log::error!("Peer task from {addr} failed: {e}"),
            Ok(Ok(())) => {}
        }

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        Ok(())
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<Rooms> {
        &self.rooms
    }
}
