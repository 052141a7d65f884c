use std::sync::Arc;
use std::time::Duration;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::WebSocketError;
use crate::websocket::broadcast::Broadcaster;
use crate::websocket::connection::{Connection, ConnectionState, MessageSink};
use crate::websocket::message::{Envelope, PresenceNotice};

fn away(reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::Away,
        reason: reason.into(),
    }
}

enum Inbound {
    Frame(Message),
    Ended,
    TimedOut,
    Shutdown,
    Failed(WebSocketError),
}

/// Drives one accepted connection from registration to teardown.
pub struct Session<S> {
    conn: Arc<Connection>,
    stream: SplitStream<WebSocketStream<S>>,
    broadcaster: Arc<Broadcaster>,
    config: Arc<RelayConfig>,
    shutdown: watch::Receiver<bool>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        ws: WebSocketStream<S>,
        peer_addr: String,
        user_name: Option<String>,
        broadcaster: Arc<Broadcaster>,
        config: Arc<RelayConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (sink, stream) = ws.split();
        let sink: MessageSink = Box::pin(sink.sink_map_err(WebSocketError::from));
        Self {
            conn: Arc::new(Connection::new(peer_addr, user_name, sink)),
            stream,
            broadcaster,
            config,
            shutdown,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Runs the session to completion. Teardown happens on every exit path;
    /// only unexpected transport faults come back as `Err`.
    pub async fn run(mut self) -> Result<(), WebSocketError> {
        self.open().await;
        let result = self.receive_loop().await;
        self.teardown().await;
        result
    }

    async fn open(&self) {
        self.conn.set_state(ConnectionState::Open).await;
        let registration = self
            .broadcaster
            .registry()
            .register(self.conn.clone(), self.config.catch_up_peer)
            .await;
        info!("WebSocket connected from {}", self.conn.peer_addr());

        let notice = PresenceNotice::new(
            self.conn.user_name().map(str::to_owned),
            registration.snapshot.clone(),
        );
        self.announce(Envelope::join(&notice), Some(&self.conn)).await;

        if let Some(peer) = registration.catch_up_peer {
            if let Err(e) = self
                .broadcaster
                .send_to(&peer, &Envelope::request_current_status())
                .await
            {
                debug!("Catch-up request to {} failed: {}", peer.peer_addr(), e);
            }
        }

        if self.config.replay_last_status_on_join {
            if let Some(last) = registration.snapshot.last_status_received {
                if let Err(e) = self
                    .broadcaster
                    .send_to(&self.conn, &Envelope::status_update(last))
                    .await
                {
                    debug!("Status replay to {} failed: {}", self.conn.peer_addr(), e);
                }
            }
        }
    }

    async fn receive_loop(&mut self) -> Result<(), WebSocketError> {
        loop {
            match self.next_inbound().await {
                Inbound::Frame(Message::Text(text)) => self.on_status(text).await,
                Inbound::Frame(Message::Binary(bytes)) => {
                    self.on_status(String::from_utf8_lossy(&bytes).into_owned()).await
                }
                Inbound::Frame(Message::Close(_)) => {
                    // Reply is the transport's echo of the peer's frame, queued
                    // when the frame was read. Writing here only flushes it.
                    self.close_quietly(None).await;
                    return Ok(());
                }
                // Ping and pong are answered by the transport
                Inbound::Frame(_) => {}
                Inbound::Ended => return Ok(()),
                Inbound::TimedOut => {
                    info!("Receive timeout for {}", self.conn.peer_addr());
                    self.close_quietly(Some(away("Receive timeout"))).await;
                    return Ok(());
                }
                Inbound::Shutdown => {
                    self.close_quietly(Some(away("Server shutting down"))).await;
                    return Ok(());
                }
                Inbound::Failed(e) if e.is_closed() => return Ok(()),
                Inbound::Failed(e) => {
                    warn!("Error receiving WebSocket message from {}: {}", self.conn.peer_addr(), e);
                    return Err(e);
                }
            }
        }
    }

    async fn next_inbound(&mut self) -> Inbound {
        let Session { stream, shutdown, config, .. } = self;
        let timeout = match config.receive_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let next = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, stream.next()).await.ok(),
                None => Some(stream.next().await),
            }
        };

        tokio::select! {
            _ = shutdown.wait_for(|stopping| *stopping) => Inbound::Shutdown,
            next = next => match next {
                None => Inbound::TimedOut,
                Some(None) => Inbound::Ended,
                Some(Some(Ok(msg))) => Inbound::Frame(msg),
                Some(Some(Err(e))) => Inbound::Failed(e.into()),
            },
        }
    }

    async fn on_status(&self, payload: String) {
        self.broadcaster
            .registry()
            .set_last_status(payload.clone())
            .await;
        info!("Message received from {}: {}", self.conn.peer_addr(), payload);
        self.announce(Ok(Envelope::status_update(payload)), Some(&self.conn))
            .await;
    }

    async fn close_quietly(&self, frame: Option<CloseFrame<'static>>) {
        if let Err(e) = self.conn.close(frame).await {
            debug!("Close handshake with {} failed: {}", self.conn.peer_addr(), e);
        }
    }

    async fn teardown(&self) {
        let registry = self.broadcaster.registry();
        let remaining = registry.remove(&self.conn).await;
        self.conn.dispose().await;

        let notice = PresenceNotice::new(
            self.conn.user_name().map(str::to_owned),
            registry.snapshot().await,
        );
        self.announce(Envelope::leave(&notice), None).await;
        info!("Disconnected from {} ({} remaining)", self.conn.peer_addr(), remaining);
    }

    async fn announce(
        &self,
        envelope: Result<Envelope, WebSocketError>,
        exclude: Option<&Arc<Connection>>,
    ) {
        let result = match envelope {
            Ok(envelope) => self.broadcaster.broadcast(&envelope, exclude).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Failed to broadcast for {}: {}", self.conn.peer_addr(), e);
        }
    }
}
