use std::sync::Arc;
use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::CatchUpPeer;
use crate::websocket::connection::Connection;
use crate::websocket::message::StatusSnapshot;

#[derive(Debug, Default)]
struct RegistryState {
    // Registration order; "first open peer" means the oldest one.
    connections: Vec<Arc<Connection>>,
    last_status: Option<String>,
}

impl RegistryState {
    fn position(&self, conn: &Arc<Connection>) -> Option<usize> {
        self.connections.iter().position(|c| Arc::ptr_eq(c, conn))
    }

    fn summary(&self) -> StatusSnapshot {
        StatusSnapshot {
            last_status_received: self.last_status.clone(),
            total_connected_clients: self.connections.len(),
        }
    }
}

/// Result of registering a new connection.
#[derive(Debug)]
pub struct Registration {
    pub count: usize,
    /// Existing peer to ask for its current state, if any was open.
    pub catch_up_peer: Option<Arc<Connection>>,
    pub snapshot: StatusSnapshot,
}

/// Set of live connections plus the last status any of them reported.
///
/// Every operation takes the one lock for the length of a collection
/// operation only; nothing here writes to a socket.
#[derive(Debug)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
    clear_status_when_empty: bool,
}

impl ConnectionRegistry {
    pub fn new(clear_status_when_empty: bool) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            clear_status_when_empty,
        }
    }

    /// Inserts `conn` and returns the new total. Adding the same handle
    /// twice leaves the set unchanged.
    pub async fn add(&self, conn: Arc<Connection>) -> usize {
        let mut state = self.state.write().await;
        if state.position(&conn).is_none() {
            debug!("Added connection {} to registry", conn.id());
            state.connections.push(conn);
        }
        state.connections.len()
    }

    /// Picks a catch-up peer among the already open connections and inserts
    /// `conn`, both under the same lock.
    pub async fn register(&self, conn: Arc<Connection>, policy: CatchUpPeer) -> Registration {
        let mut state = self.state.write().await;

        let mut open = Vec::with_capacity(state.connections.len());
        for c in state.connections.iter() {
            if !Arc::ptr_eq(c, &conn) && c.is_open().await {
                open.push(c.clone());
            }
        }
        let catch_up_peer = match policy {
            CatchUpPeer::First => open.into_iter().next(),
            CatchUpPeer::Random => open.choose(&mut rand::thread_rng()).cloned(),
        };

        if state.position(&conn).is_none() {
            debug!("Added connection {} to registry", conn.id());
            state.connections.push(conn);
        }

        Registration {
            count: state.connections.len(),
            catch_up_peer,
            snapshot: state.summary(),
        }
    }

    /// Deletes `conn` and returns the new total. No-op when absent.
    pub async fn remove(&self, conn: &Arc<Connection>) -> usize {
        let mut state = self.state.write().await;
        if let Some(idx) = state.position(conn) {
            state.connections.remove(idx);
            debug!("Removed connection {} from registry", conn.id());
            if state.connections.is_empty() && self.clear_status_when_empty {
                state.last_status = None;
            }
        }
        state.connections.len()
    }

    /// Independent copy of every connection currently open.
    pub async fn snapshot_open(&self) -> Vec<Arc<Connection>> {
        let state = self.state.read().await;
        let mut open = Vec::with_capacity(state.connections.len());
        for c in state.connections.iter() {
            if c.is_open().await {
                open.push(c.clone());
            }
        }
        open
    }

    pub async fn set_last_status(&self, payload: String) {
        self.state.write().await.last_status = Some(payload);
    }

    pub async fn last_status(&self) -> Option<String> {
        self.state.read().await.last_status.clone()
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Last status and count read together.
    pub async fn snapshot(&self) -> StatusSnapshot {
        self.state.read().await.summary()
    }
}
