//! WebSocket relay for playback sync
//!
//! This module tracks live connections, fans status updates out to
//! every other peer and runs one session per connected client.

mod broadcast;
mod connection;
mod message;
mod registry;
mod server;
mod session;

pub use broadcast::{BroadcastOutcome, Broadcaster};
pub use connection::{Connection, ConnectionState, MessageSink};
pub use message::{Envelope, MessageKind, PresenceNotice, StatusSnapshot};
pub use registry::{ConnectionRegistry, Registration};
pub use server::{RelayServer, SyncRoute};
pub use session::Session;
