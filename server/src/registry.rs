//! Live connection tracking for the relay
//!
//! This module holds the server-side view of every open participant
//! channel, including:
//! - The outbound frame queue feeding the connection's writer task
//! - The (sessionId, playerId, role) identity claimed by its messages
//! - Lookup of the connections a given player currently holds
//!
//! The transport owns each connection's lifetime. The registry only keeps
//! the sending half of the outbox, so a connection whose writer task has
//! gone away reads as "not open" and is skipped by fan-out.

use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Opaque handle identifying one transport connection
pub type ConnectionId = u64;

/// A serialized outbound frame, shared between all recipients of a broadcast
pub type Frame = Arc<str>;

/// Sending half of a connection's outbound queue
pub type Outbox = mpsc::UnboundedSender<Frame>;

/// One live participant channel and the identity it has claimed
#[derive(Debug)]
pub struct Connection {
    /// Identifier assigned by the transport
    pub id: ConnectionId,
    /// Peer address, when the transport knows it
    pub addr: Option<SocketAddr>,
    /// Session this connection is currently bound to
    pub session_id: Option<String>,
    /// Player identifier taken from the connection's messages
    pub player_id: Option<String>,
    /// Role claimed at registration
    pub role: Option<String>,
    connected_at: Instant,
    outbox: Outbox,
}

impl Connection {
    pub fn new(id: ConnectionId, outbox: Outbox, addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            addr,
            session_id: None,
            player_id: None,
            role: None,
            connected_at: Instant::now(),
            outbox,
        }
    }

    /// True while the transport side is still draining the outbox
    pub fn is_open(&self) -> bool {
        !self.outbox.is_closed()
    }

    /// Queues a frame for delivery. Returns false if the connection is closed.
    pub fn send(&self, frame: &Frame) -> bool {
        self.is_open() && self.outbox.send(Arc::clone(frame)).is_ok()
    }

    /// Time since the transport accepted this connection
    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Label used in log lines
    pub fn label(&self) -> &str {
        self.player_id.as_deref().unwrap_or("Unknown")
    }
}

/// All connections currently known to the relay, indexed by their handle
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a freshly opened connection
    pub fn insert(&mut self, connection: Connection) {
        info!(
            "Connection {} opened from {}",
            connection.id,
            connection
                .addr
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "unknown address".into())
        );
        self.connections.insert(connection.id, connection);
    }

    /// Stops tracking a connection. Returns it if it was still known.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Binds a connection to `session_id`.
    ///
    /// Returns the session it was previously bound to, if that differs.
    /// Unknown connection handles are ignored.
    pub fn bind_session(&mut self, id: ConnectionId, session_id: &str) -> Option<String> {
        let connection = self.connections.get_mut(&id)?;
        match connection.session_id.as_deref() {
            Some(current) if current == session_id => None,
            _ => connection.session_id.replace(session_id.to_owned()),
        }
    }

    /// Records the player identity a connection speaks for
    pub fn identify(&mut self, id: ConnectionId, player_id: &str, role: Option<&str>) {
        if let Some(connection) = self.connections.get_mut(&id) {
            if connection.player_id.as_deref() != Some(player_id) {
                connection.player_id = Some(player_id.to_owned());
            }
            if let Some(role) = role {
                connection.role = Some(role.to_owned());
            }
        }
    }

    /// Connections in `session_id` that speak for `player_id`
    pub fn find_by_player(&self, session_id: &str, player_id: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| {
                c.session_id.as_deref() == Some(session_id)
                    && c.player_id.as_deref() == Some(player_id)
            })
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
