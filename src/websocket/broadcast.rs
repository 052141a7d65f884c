use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::FanoutScope;
use crate::error::WebSocketError;
use crate::websocket::connection::Connection;
use crate::websocket::message::Envelope;
use crate::websocket::registry::ConnectionRegistry;

/// Counts from one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub attempted: usize,
    pub delivered: usize,
}

/// Fans envelopes out to every open connection in the registry.
///
/// At most `limit` sends are in flight at once. With [`FanoutScope::Shared`]
/// that bound covers all concurrent broadcasts together; with
/// [`FanoutScope::PerBroadcast`] each call gets its own.
#[derive(Debug)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    limit: usize,
    shared: Option<Arc<Semaphore>>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, limit: usize, scope: FanoutScope) -> Self {
        let limit = limit.max(1);
        let shared = match scope {
            FanoutScope::Shared => Some(Arc::new(Semaphore::new(limit))),
            FanoutScope::PerBroadcast => None,
        };
        Self { registry, limit, shared }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Sends `envelope` to every open connection except `exclude` and waits
    /// for all sends to finish. A failed send only affects its recipient.
    pub async fn broadcast(
        &self,
        envelope: &Envelope,
        exclude: Option<&Arc<Connection>>,
    ) -> Result<BroadcastOutcome, WebSocketError> {
        let msg = envelope.to_message()?;
        let targets: Vec<_> = self
            .registry
            .snapshot_open()
            .await
            .into_iter()
            .filter(|c| exclude.map_or(true, |ex| !Arc::ptr_eq(c, ex)))
            .collect();

        let semaphore = match &self.shared {
            Some(shared) => shared.clone(),
            None => Arc::new(Semaphore::new(self.limit)),
        };

        let mut outcome = BroadcastOutcome::default();
        let mut sends = JoinSet::new();
        for conn in targets {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            outcome.attempted += 1;
            let msg = msg.clone();
            sends.spawn(async move {
                let _permit = permit;
                match conn.send(msg).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("Skipped broadcast to {}: {}", conn.peer_addr(), e);
                        false
                    }
                }
            });
        }

        while let Some(res) = sends.join_next().await {
            match res {
                Ok(true) => outcome.delivered += 1,
                Ok(false) => {}
                Err(e) => warn!("Broadcast send task failed: {}", e),
            }
        }

        Ok(outcome)
    }

    /// Sends `envelope` to a single connection.
    pub async fn send_to(&self, conn: &Connection, envelope: &Envelope) -> Result<(), WebSocketError> {
        conn.send(envelope.to_message()?).await
    }
}
