//! Connection Registry
//!
//! Live mapping from username to connection. Registration is
//! last-connect-wins; a replaced connection is marked dead so stale read
//! loops and cached session references can tell.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::network::channel::{ChannelError, MessageSink};
use crate::network::protocol::{Envelope, ServerMessage};

/// Monotonic connection identifier.
pub type ConnectionId = u64;

/// A registered connection.
///
/// Wraps the sink in a mutex so concurrent senders never interleave frames.
pub struct Connection {
    id: ConnectionId,
    username: String,
    sink: Mutex<Box<dyn MessageSink>>,
    live: AtomicBool,
}

impl Connection {
    /// Wrap a sink.
    pub fn new(id: ConnectionId, username: impl Into<String>, sink: Box<dyn MessageSink>) -> Self {
        Self {
            id,
            username: username.into(),
            sink: Mutex::new(sink),
            live: AtomicBool::new(true),
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Username bound to this connection.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Whether the connection is still the live one for its user.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Mark the connection dead. Returns true on the first call.
    pub fn mark_dead(&self) -> bool {
        self.live.swap(false, Ordering::AcqRel)
    }

    /// Send a raw envelope.
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        if !self.is_live() {
            return Err(ChannelError::Closed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(envelope).await
    }

    /// Encode and send a server message.
    pub async fn send(&self, message: &ServerMessage) -> Result<(), ChannelError> {
        let envelope = message
            .to_envelope()
            .map_err(|e| ChannelError::Encode(e.to_string()))?;
        self.send_envelope(&envelope).await
    }

    /// Close the underlying sink.
    pub async fn close(&self) {
        self.mark_dead();
        let mut sink = self.sink.lock().await;
        sink.close().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Username to connection mapping.
pub struct ConnectionRegistry {
    connections: RwLock<BTreeMap<String, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a sink for a user, replacing any prior entry.
    ///
    /// The replaced connection is marked dead and returned alongside the new
    /// one so the caller can close it outside the lock.
    pub async fn register(
        &self,
        username: &str,
        sink: Box<dyn MessageSink>,
    ) -> (Arc<Connection>, Option<Arc<Connection>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, username, sink));

        let replaced = {
            let mut connections = self.connections.write().await;
            connections.insert(username.to_string(), conn.clone())
        };

        if let Some(old) = &replaced {
            old.mark_dead();
            info!("Connection {} for {} replaced by {}", old.id(), username, id);
        } else {
            debug!("Registered {} as connection {}", username, id);
        }

        (conn, replaced)
    }

    /// Remove whatever connection is registered for `username`.
    pub async fn unregister(&self, username: &str) -> Option<Arc<Connection>> {
        let removed = {
            let mut connections = self.connections.write().await;
            connections.remove(username)
        };
        if let Some(conn) = &removed {
            conn.mark_dead();
        }
        removed
    }

    /// Remove `conn` only if it is still the registered connection for its
    /// user. Returns false when a newer connection has taken over.
    pub async fn unregister_connection(&self, conn: &Connection) -> bool {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(conn.username()) {
                Some(current) if current.id() == conn.id() => {
                    connections.remove(conn.username());
                    true
                }
                _ => false,
            }
        };
        conn.mark_dead();
        removed
    }

    /// Look up a user's connection.
    pub async fn lookup(&self, username: &str) -> Option<Arc<Connection>> {
        let connections = self.connections.read().await;
        connections.get(username).cloned()
    }

    /// Whether a user is connected.
    pub async fn is_online(&self, username: &str) -> bool {
        self.connections.read().await.contains_key(username)
    }

    /// Copy of the table, taken before any I/O.
    pub async fn snapshot(&self) -> BTreeMap<String, Arc<Connection>> {
        self.connections.read().await.clone()
    }

    /// Number of registered connections.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Whether no one is connected.
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
