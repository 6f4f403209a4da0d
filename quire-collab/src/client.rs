//! WebSocket connector for the relay.
//!
//! Connects to `{url}/{doc_id}` and bridges the socket to a [`Link`]:
//! a writer task drains the outgoing channel into the socket and a reader
//! task forwards binary frames to the incoming channel. Either side
//! closing ends both tasks, which the replica sees as a closed link.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::actor::{Connector, Link};
use crate::protocol::ProtocolError;

#[derive(Debug, Clone)]
pub struct WsConnector {
    server_url: String,
    capacity: usize,
}

impl WsConnector {
    /// `server_url` like `ws://127.0.0.1:9090`.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            capacity: 256,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl Connector for WsConnector {
    fn connect(&self, doc_id: Uuid) -> BoxFuture<'static, Result<Link, ProtocolError>> {
        let url = format!("{}/{}", self.server_url, doc_id);
        let capacity = self.capacity;

        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| ProtocolError::Transport(e.to_string()))?;
            log::info!("Connected to {url}");
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(capacity);
            let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(capacity);

            // Writer task: forward outgoing channel to WebSocket
            tokio::spawn(async move {
                while let Some(data) = out_rx.recv().await {
                    if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            // Reader task: forward binary frames until the socket closes
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            let bytes: Vec<u8> = data.into();
                            if in_tx.send(bytes).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            log::warn!("WebSocket read error: {e}");
                            break;
                        }
                    }
                }
                log::debug!("WebSocket reader finished");
            });

            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}
