use std::fmt;
use std::pin::Pin;
use futures::{Sink, SinkExt};
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::WebSocketError;

/// Write half of a peer connection.
pub type MessageSink = Pin<Box<dyn Sink<Message, Error = WebSocketError> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// A live peer. The session that accepted it is the only one that changes
/// its state; everyone else just sends through it.
pub struct Connection {
    id: Uuid,
    peer_addr: String,
    user_name: Option<String>,
    state: RwLock<ConnectionState>,
    sink: Mutex<Option<MessageSink>>,
}

impl Connection {
    pub fn new(peer_addr: String, user_name: Option<String>, sink: MessageSink) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_addr,
            user_name,
            state: RwLock::new(ConnectionState::Connecting),
            sink: Mutex::new(Some(sink)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_open(&self) -> bool {
        self.state().await == ConnectionState::Open
    }

    pub async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    /// Writes one frame. Fails with [`WebSocketError::Closed`] once the
    /// connection has left the `Open` state.
    pub async fn send(&self, msg: Message) -> Result<(), WebSocketError> {
        if !self.is_open().await {
            return Err(WebSocketError::Closed);
        }
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => sink.send(msg).await,
            None => Err(WebSocketError::Closed),
        }
    }

    /// Moves to `Closing` and answers with a close frame.
    pub async fn close(&self, frame: Option<CloseFrame<'static>>) -> Result<(), WebSocketError> {
        self.set_state(ConnectionState::Closing).await;
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => sink.send(Message::Close(frame)).await,
            None => Err(WebSocketError::Closed),
        }
    }

    /// Drops the write half without further I/O. Idempotent.
    pub async fn dispose(&self) {
        self.set_state(ConnectionState::Closed).await;
        self.sink.lock().await.take();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("user_name", &self.user_name)
            .finish_non_exhaustive()
    }
}
