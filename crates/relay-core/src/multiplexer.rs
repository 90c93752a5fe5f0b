//! Connection multiplexer.
//!
//! Every live transport connection owns a bounded outbound queue. The
//! multiplexer maps connection IDs to those queues and to the identity the
//! connection announced, and offers broadcast and unicast delivery.
//!
//! Delivery is fire-and-forget: a connection whose queue is full or whose
//! writer has gone away simply misses the event.

use dashmap::DashMap;
use relay_protocol::{Identity, OutboundEvent};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

/// Default outbound queue capacity per connection.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

/// Atomic counter backing connection IDs.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let n = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{n:x}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Receiving half of a connection's outbound queue.
pub type Outbox = mpsc::Receiver<Arc<OutboundEvent>>;

/// Multiplexer errors.
#[derive(Debug, Error)]
pub enum MultiplexerError {
    /// No open connection with this ID.
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// The connection's queue is full; the event was dropped.
    #[error("Outbound queue full for connection {0}")]
    QueueFull(ConnectionId),

    /// The connection's writer is gone.
    #[error("Connection closed: {0}")]
    ConnectionClosed(ConnectionId),
}

struct ConnectionEntry {
    identity: Option<Identity>,
    sender: mpsc::Sender<Arc<OutboundEvent>>,
}

/// Maps live connections to their outbound queues and identities.
pub struct Multiplexer {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    outbox_capacity: usize,
}

impl Multiplexer {
    /// Create a multiplexer with the default queue capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OUTBOX_CAPACITY)
    }

    /// Create a multiplexer with a specific per-connection queue capacity.
    #[must_use]
    pub fn with_capacity(outbox_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            outbox_capacity: outbox_capacity.max(1),
        }
    }

    /// Open a new anonymous connection.
    ///
    /// Returns the connection ID and the queue the transport should drain.
    pub fn open(&self) -> (ConnectionId, Outbox) {
        let id = ConnectionId::generate();
        let (sender, outbox) = mpsc::channel(self.outbox_capacity);
        self.connections.insert(
            id.clone(),
            ConnectionEntry {
                identity: None,
                sender,
            },
        );
        debug!(connection = %id, "Connection opened");
        (id, outbox)
    }

    /// Associate an identity with a connection.
    ///
    /// A later announcement replaces the earlier identity.
    /// Returns `false` if the connection is not open.
    pub fn identify(&self, connection_id: &ConnectionId, identity: &str) -> bool {
        match self.connections.get_mut(connection_id) {
            Some(mut entry) => {
                if entry.identity.as_deref() != Some(identity) {
                    debug!(
                        connection = %connection_id,
                        identity = %identity,
                        "Connection identified"
                    );
                    entry.identity = Some(identity.to_string());
                }
                true
            }
            None => false,
        }
    }

    /// Get the identity announced on a connection, if any.
    #[must_use]
    pub fn identity(&self, connection_id: &ConnectionId) -> Option<Identity> {
        self.connections
            .get(connection_id)
            .and_then(|entry| entry.identity.clone())
    }

    /// Close a connection, returning the identity it had announced.
    pub fn close(&self, connection_id: &ConnectionId) -> Option<Identity> {
        let (_, entry) = self.connections.remove(connection_id)?;
        debug!(connection = %connection_id, "Connection closed");
        entry.identity
    }

    /// Number of open connections that announced `identity`.
    #[must_use]
    pub fn connections_for(&self, identity: &str) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.identity.as_deref() == Some(identity))
            .count()
    }

    /// Check if a connection is open.
    #[must_use]
    pub fn is_open(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Deliver an event to every open connection, the originator included.
    ///
    /// Returns the number of connections the event was queued for.
    pub fn broadcast_all(&self, event: OutboundEvent) -> usize {
        self.fan_out(event, None)
    }

    /// Deliver an event to every open connection except `excluded`.
    ///
    /// Returns the number of connections the event was queued for.
    pub fn broadcast_except(&self, excluded: &ConnectionId, event: OutboundEvent) -> usize {
        self.fan_out(event, Some(excluded))
    }

    fn fan_out(&self, event: OutboundEvent, excluded: Option<&ConnectionId>) -> usize {
        let name = event.name();
        let event = Arc::new(event);
        let mut delivered = 0;

        for entry in self.connections.iter() {
            if Some(entry.key()) == excluded {
                continue;
            }
            match entry.sender.try_send(Arc::clone(&event)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        connection = %entry.key(),
                        event = %name,
                        "Outbound queue full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    trace!(connection = %entry.key(), event = %name, "Skipping closed connection");
                }
            }
        }

        trace!(event = %name, recipients = delivered, "Broadcast");
        delivered
    }

    /// Queue an event for one connection, waiting for room in its queue.
    ///
    /// Unlike [`Multiplexer::send_to`] this never drops the event on a full
    /// queue; the caller must not be the task draining that queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or its writer is gone.
    pub async fn deliver(
        &self,
        connection_id: &ConnectionId,
        event: OutboundEvent,
    ) -> Result<(), MultiplexerError> {
        // Clone the sender so no map guard is held across the await.
        let sender = self
            .connections
            .get(connection_id)
            .map(|entry| entry.sender.clone())
            .ok_or_else(|| MultiplexerError::ConnectionNotFound(connection_id.clone()))?;

        sender
            .send(Arc::new(event))
            .await
            .map_err(|_| MultiplexerError::ConnectionClosed(connection_id.clone()))
    }

    /// Deliver an event to exactly one connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown, closed, or its queue is full.
    pub fn send_to(
        &self,
        connection_id: &ConnectionId,
        event: OutboundEvent,
    ) -> Result<(), MultiplexerError> {
        let entry = self
            .connections
            .get(connection_id)
            .ok_or_else(|| MultiplexerError::ConnectionNotFound(connection_id.clone()))?;

        entry
            .sender
            .try_send(Arc::new(event))
            .map_err(|e| match e {
                TrySendError::Full(_) => MultiplexerError::QueueFull(connection_id.clone()),
                TrySendError::Closed(_) => {
                    MultiplexerError::ConnectionClosed(connection_id.clone())
                }
            })
    }

    /// Get multiplexer statistics.
    #[must_use]
    pub fn stats(&self) -> MultiplexerStats {
        let identified = self
            .connections
            .iter()
            .filter(|entry| entry.identity.is_some())
            .count();
        MultiplexerStats {
            open_connections: self.connections.len(),
            identified_connections: identified,
        }
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

/// Multiplexer statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiplexerStats {
    /// Number of open connections.
    pub open_connections: usize,
    /// Number of connections that announced an identity.
    pub identified_connections: usize,
}
