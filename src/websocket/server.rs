use std::net::SocketAddr;
use std::sync::Arc;
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::WebSocketError;
use crate::websocket::broadcast::Broadcaster;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::session::Session;

const SYNC_PATH: &str = "sync";

/// What the upgrade request told us about the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRoute {
    pub user_name: Option<String>,
    pub forwarded_for: Option<String>,
}

impl SyncRoute {
    /// Accepts the bare `/sync` endpoint and `/{userName}`.
    ///
    /// Exactly one path segment is allowed. The literal `sync` wins over a
    /// user of the same name, so that caller joins anonymously.
    pub fn from_request(req: &Request, trust_forwarded_headers: bool) -> Option<Self> {
        let mut segments = req.uri().path().split('/').filter(|s| !s.is_empty());
        let segment = segments.next()?;
        if segments.next().is_some() {
            return None;
        }
        let user_name = if segment.eq_ignore_ascii_case(SYNC_PATH) {
            None
        } else {
            Some(percent_decode_str(segment).decode_utf8_lossy().into_owned())
        };

        let forwarded_for = if trust_forwarded_headers {
            req.headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        } else {
            None
        };

        Some(Self { user_name, forwarded_for })
    }
}

fn not_found(path: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!("No sync endpoint at {}", path)));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// Accepts relay connections and hands each one to its own [`Session`].
pub struct RelayServer {
    config: Arc<RelayConfig>,
    broadcaster: Arc<Broadcaster>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.clear_status_when_empty));
        let broadcaster = Arc::new(Broadcaster::new(
            registry,
            config.fanout_limit,
            config.fanout_scope,
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            broadcaster,
            shutdown,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.broadcaster.registry()
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind((self.config.host.as_str(), self.config.port)).await
    }

    /// Accept loop. Returns once [`RelayServer::shutdown`] is called.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        if let Ok(addr) = listener.local_addr() {
            info!("Relay accepting connections at ws://{}/{}", addr, SYNC_PATH);
        }

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stopping| *stopping) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream, addr).await;
                        });
                    }
                    Err(e) => error!("Error accepting relay connection: {}", e),
                },
            }
        }

        info!("Relay listener stopped");
    }

    pub async fn handle_connection(self: Arc<Self>, raw_stream: TcpStream, addr: SocketAddr) {
        debug!("New WebSocket connection request from: {}", addr);

        let trust = self.config.trust_forwarded_headers;
        let mut route = None;
        let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match SyncRoute::from_request(req, trust) {
                Some(r) => {
                    route = Some(r);
                    Ok(response)
                }
                None => {
                    warn!("Rejected upgrade from {} for {}", addr, req.uri().path());
                    Err(not_found(req.uri().path()))
                }
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(raw_stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("Error during WebSocket handshake with {}: {}", addr, e);
                return;
            }
        };
        let Some(route) = route else {
            return;
        };

        let peer_addr = route.forwarded_for.unwrap_or_else(|| addr.to_string());
        if let Err(e) = self.run_session(ws_stream, peer_addr.clone(), route.user_name).await {
            error!("Session with {} ended with error: {}", peer_addr, e);
        }
    }

    /// Runs a session over an already upgraded stream.
    pub async fn run_session<S>(
        &self,
        ws: WebSocketStream<S>,
        peer_addr: String,
        user_name: Option<String>,
    ) -> Result<(), WebSocketError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Session::new(
            ws,
            peer_addr,
            user_name,
            self.broadcaster.clone(),
            self.config.clone(),
            self.shutdown.subscribe(),
        )
        .run()
        .await
    }

    /// Stops the accept loop and asks every session to close.
    pub fn shutdown(&self) {
        info!("Relay shutting down");
        self.shutdown.send_replace(true);
    }
}
