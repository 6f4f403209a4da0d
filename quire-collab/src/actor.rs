//! Replica actor: one tokio task owns a [`SyncSession`] and everything
//! else talks to it through a cloneable [`ReplicaHandle`].
//!
//! Commands, inbound frames and the awareness sweep timer are all
//! serialized onto that task, so no two operations ever apply to the same
//! replica concurrently. The session's outbox drains to the link one
//! frame per turn whenever the link has room; reading the link never
//! waits on writing to it.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use quire_core::{Change, DocumentSnapshot, EditError, EditIntent, OperationId, ReplicaId};

use crate::protocol::ProtocolError;
use crate::session::{SessionConfig, SessionEvent, SessionState, SyncSession};

/// A bidirectional byte pipe to the room: frames written to `outbound`
/// go to the relay, frames from peers arrive on `inbound`.
///
/// The link is considered failed once `inbound` closes.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<Vec<u8>>,
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

/// Opens links to a document room.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, doc_id: Uuid) -> BoxFuture<'static, Result<Link, ProtocolError>>;
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("replica task stopped")]
    Stopped,
    #[error(transparent)]
    Edit(#[from] EditError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

type Callback = Box<dyn FnMut(&Change) + Send>;

enum Command {
    Submit {
        intent: EditIntent,
        reply: oneshot::Sender<Result<OperationId, EditError>>,
    },
    Subscribe {
        callback: Callback,
        reply: oneshot::Sender<()>,
    },
    Connect {
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<DocumentSnapshot>,
    },
    SetAwareness {
        payload: Option<Vec<u8>>,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    GetAwareness {
        replica: ReplicaId,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    State {
        reply: oneshot::Sender<SessionState>,
    },
    Compact {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle to a running replica task. The task stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct ReplicaHandle {
    id: ReplicaId,
    commands: mpsc::Sender<Command>,
    events: Arc<Mutex<Option<mpsc::Receiver<SessionEvent>>>>,
}

impl std::fmt::Debug for ReplicaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaHandle").field("id", &self.id).finish()
    }
}

/// Start a replica task. Must be called from within a tokio runtime.
pub fn spawn(id: ReplicaId, config: SessionConfig, connector: Arc<dyn Connector>) -> ReplicaHandle {
    let capacity = config.channel_capacity;
    let (command_tx, command_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::channel(capacity);

    let actor = ReplicaActor {
        session: SyncSession::new(id, config),
        connector,
        inbound: None,
        outbound: None,
        events: event_tx,
    };
    tokio::spawn(actor.run(command_rx));

    ReplicaHandle {
        id,
        commands: command_tx,
        events: Arc::new(Mutex::new(Some(event_rx))),
    }
}

impl ReplicaHandle {
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Take the session event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.lock().ok().and_then(|mut slot| slot.take())
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SyncError::Stopped)?;
        rx.await.map_err(|_| SyncError::Stopped)
    }

    pub async fn submit_edit_intent(&self, intent: EditIntent) -> Result<OperationId, SyncError> {
        Ok(self
            .request(|reply| Command::Submit { intent, reply })
            .await??)
    }

    pub async fn subscribe(
        &self,
        callback: impl FnMut(&Change) + Send + 'static,
    ) -> Result<(), SyncError> {
        let callback: Callback = Box::new(callback);
        self.request(|reply| Command::Subscribe { callback, reply })
            .await
    }

    pub async fn connect(&self) -> Result<(), SyncError> {
        Ok(self.request(|reply| Command::Connect { reply }).await??)
    }

    pub async fn disconnect(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    pub async fn get_document_snapshot(&self) -> Result<DocumentSnapshot, SyncError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn set_local_awareness(&self, payload: Vec<u8>) -> Result<(), SyncError> {
        Ok(self
            .request(|reply| Command::SetAwareness {
                payload: Some(payload),
                reply,
            })
            .await??)
    }

    pub async fn clear_local_awareness(&self) -> Result<(), SyncError> {
        Ok(self
            .request(|reply| Command::SetAwareness {
                payload: None,
                reply,
            })
            .await??)
    }

    pub async fn get_awareness(&self, replica: ReplicaId) -> Result<Option<Vec<u8>>, SyncError> {
        self.request(|reply| Command::GetAwareness { replica, reply })
            .await
    }

    pub async fn state(&self) -> Result<SessionState, SyncError> {
        self.request(|reply| Command::State { reply }).await
    }

    pub async fn compact_history(&self) -> Result<usize, SyncError> {
        self.request(|reply| Command::Compact { reply }).await
    }
}

struct ReplicaActor {
    session: SyncSession,
    connector: Arc<dyn Connector>,
    /// Halves of the current link, if any.
    inbound: Option<mpsc::Receiver<Vec<u8>>>,
    outbound: Option<mpsc::Sender<Vec<u8>>>,
    events: mpsc::Sender<SessionEvent>,
}

async fn next_frame(inbound: &mut Option<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn reserve_slot(
    outbound: &Option<mpsc::Sender<Vec<u8>>>,
) -> Result<mpsc::Permit<'_, Vec<u8>>, mpsc::error::SendError<()>> {
    match outbound {
        Some(tx) => tx.reserve().await,
        None => std::future::pending().await,
    }
}

impl ReplicaActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut sweep = tokio::time::interval(self.session.config().awareness_sweep);
        log::debug!("Replica task {} started", self.session.id());

        loop {
            let sending = self.outbound.is_some() && self.session.has_transmit();
            let outbound = self.outbound.clone();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                frame = next_frame(&mut self.inbound) => match frame {
                    Some(bytes) => {
                        if let Err(e) = self.session.handle_frame(&bytes) {
                            log::warn!("{} dropped inbound frame: {}", self.session.id(), e);
                        }
                    }
                    None => {
                        log::warn!("{} link closed, disconnecting", self.session.id());
                        self.drop_link();
                    }
                },

                // One frame per turn, so a full link never stops the
                // arms above.
                permit = reserve_slot(&outbound), if sending => match permit {
                    Ok(permit) => {
                        if let Some(frame) = self.session.poll_transmit() {
                            permit.send(frame);
                        }
                    }
                    Err(_) => {
                        log::warn!("{} link refused a frame, disconnecting", self.session.id());
                        self.drop_link();
                    }
                },

                _ = sweep.tick() => {
                    let now = Instant::now();
                    self.session.expire_idle(now);
                    if let Err(e) = self.session.refresh_awareness(now) {
                        log::warn!("{} failed to renew awareness: {}", self.session.id(), e);
                    }
                }
            }
            self.flush_events();
        }

        log::debug!("Replica task {} stopped", self.session.id());
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { intent, reply } => {
                let _ = reply.send(self.session.submit_edit_intent(intent));
            }
            Command::Subscribe { callback, reply } => {
                self.session.subscribe(callback);
                let _ = reply.send(());
            }
            Command::Connect { reply } => {
                let _ = reply.send(self.connect().await);
            }
            Command::Disconnect { reply } => {
                self.drop_link();
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.session.get_document_snapshot());
            }
            Command::SetAwareness { payload, reply } => {
                let result = match payload {
                    Some(payload) => self.session.set_local_awareness(payload),
                    None => self.session.clear_local_awareness(),
                };
                let _ = reply.send(result);
            }
            Command::GetAwareness { replica, reply } => {
                let _ = reply.send(self.session.get_awareness(&replica).map(<[u8]>::to_vec));
            }
            Command::State { reply } => {
                let _ = reply.send(self.session.state());
            }
            Command::Compact { reply } => {
                let _ = reply.send(self.session.compact_history());
            }
        }
    }

    async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.outbound.is_some() {
            return Ok(());
        }
        let Link { outbound, inbound } = self.connector.connect(self.session.config().doc_id).await?;
        self.outbound = Some(outbound);
        self.inbound = Some(inbound);
        if let Err(e) = self.session.connect() {
            self.drop_link();
            return Err(e);
        }
        Ok(())
    }

    /// Forget the link. Dropping it closes the channels, which the relay
    /// reports to the room as `PeerLeft`.
    fn drop_link(&mut self) {
        self.inbound = None;
        self.outbound = None;
        self.session.disconnect();
    }

    fn flush_events(&mut self) {
        while let Some(event) = self.session.poll_event() {
            if self.events.try_send(event).is_err() {
                log::trace!("{} event channel full or closed", self.session.id());
            }
        }
    }
}
