//! WebSocket client for the relay.
//!
//! Thin by design: connect, post, and observe what the server sends back.
//! Integration tests drive it against a real server; it also backs small
//! command-line tooling. There is no offline queue — a post made while
//! disconnected is simply an error.

use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::{ClientFrame, Message, ProtocolError, ServerFrame};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the relay client.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Connection established
    Connected,
    /// A message from the server: history replay first, then live
    /// broadcasts, in the order the server sent them
    Message(Message),
    /// Connection lost or closed
    Disconnected,
}

/// The relay client.
pub struct RelayClient {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,
    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<RelayEvent>>,
    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<RelayEvent>,
}

impl RelayClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RelayEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading and writing WebSocket frames.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::debug!("connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing posts to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(payload) = out_rx.recv().await {
                if ws_writer.send(WsMessage::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(WsMessage::Close(None)).await;
        });

        // Connected goes out before the reader task starts, so history
        // replay can never arrive ahead of it on the event channel.
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(RelayEvent::Connected).await;

        // Reader task: decode server frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(WsMessage::Text(raw)) => match ServerFrame::decode(raw.as_str()) {
                        Ok(ServerFrame::Message(msg)) => {
                            if event_tx.send(RelayEvent::Message(msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::warn!("undecodable server frame: {e}");
                        }
                    },
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(RelayEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Submit a post. The server never acknowledges individual posts;
    /// an accepted one comes back as a broadcast [`RelayEvent::Message`].
    pub async fn post(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        let payload = ClientFrame::post(text).encode()?;
        tx.send(payload)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Send a raw frame verbatim (tests use this to exercise the server's
    /// handling of malformed input).
    pub async fn send_raw(&self, payload: impl Into<String>) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(payload.into())
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        // Dropping the writer channel ends the writer task, which sends
        // the close frame on its way out.
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
