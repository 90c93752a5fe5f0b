//! Relay core: inbound event dispatch.
//!
//! The relay validates events coming off a connection, calls the store,
//! updates presence, and fans results out through the multiplexer.
//!
//! Store failures never reach clients. They are logged and published on a
//! failure channel (see [`Relay::subscribe_failures`]) and the handler
//! carries on.

use crate::multiplexer::{ConnectionId, Multiplexer};
use crate::presence::{PresenceRegistry, PresenceSet};
use crate::store::{MessageStore, StoreError};
use relay_protocol::{ChatMessage, Identity, InboundEvent, OutboundEvent, ProtocolError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The event was well-formed JSON but unusable.
    #[error("Protocol misuse: {0}")]
    ProtocolMisuse(#[from] ProtocolError),

    /// A store call failed.
    #[error("Persistence failure in {operation}: {source}")]
    Persistence {
        /// Store operation that failed.
        operation: &'static str,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },
}

/// Report of a store failure, published for operators.
#[derive(Debug, Clone)]
pub struct PersistenceFailure {
    /// Connection whose event triggered the call.
    pub connection: ConnectionId,
    /// Store operation that failed.
    pub operation: &'static str,
    /// Underlying store error.
    pub error: StoreError,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Remove an identity from presence when its last connection closes
    /// without sending `userDisconnected`.
    pub remove_presence_on_close: bool,
    /// Capacity of the failure report channel.
    pub failure_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            remove_presence_on_close: false,
            failure_capacity: 256,
        }
    }
}

/// The relay core.
pub struct Relay {
    presence: Arc<PresenceRegistry>,
    multiplexer: Arc<Multiplexer>,
    store: Arc<dyn MessageStore>,
    failures: broadcast::Sender<PersistenceFailure>,
    config: RelayConfig,
}

impl Relay {
    /// Create a relay over the given registry, multiplexer and store.
    #[must_use]
    pub fn new(
        presence: Arc<PresenceRegistry>,
        multiplexer: Arc<Multiplexer>,
        store: Arc<dyn MessageStore>,
        config: RelayConfig,
    ) -> Self {
        info!("Creating relay with config: {:?}", config);
        let (failures, _) = broadcast::channel(config.failure_capacity.max(1));
        Self {
            presence,
            multiplexer,
            store,
            failures,
            config,
        }
    }

    /// The presence registry.
    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    /// The connection multiplexer.
    #[must_use]
    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.multiplexer
    }

    /// The persistence gateway.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Subscribe to store failure reports.
    #[must_use]
    pub fn subscribe_failures(&self) -> broadcast::Receiver<PersistenceFailure> {
        self.failures.subscribe()
    }

    /// Entry point for the transport.
    ///
    /// `sendMessage` and `getStoredMessages` run on their own task so the
    /// connection can keep reading and draining its queue; their handle is
    /// returned. Presence events are handled before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ProtocolMisuse`] if the event fails validation.
    pub async fn dispatch(
        self: &Arc<Self>,
        connection_id: &ConnectionId,
        event: InboundEvent,
    ) -> Result<Option<JoinHandle<()>>, RelayError> {
        event.validate()?;

        if matches!(
            event,
            InboundEvent::SendMessage(_) | InboundEvent::GetStoredMessages(..)
        ) {
            let relay = Arc::clone(self);
            let connection_id = connection_id.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = relay.handle(&connection_id, event).await {
                    warn!(connection = %connection_id, error = %e, "Relay task failed");
                }
            });
            return Ok(Some(handle));
        }

        self.handle(connection_id, event).await?;
        Ok(None)
    }

    /// Handle one inbound event to completion.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ProtocolMisuse`] if the event fails validation.
    /// Store failures are reported, not returned.
    pub async fn handle(
        &self,
        connection_id: &ConnectionId,
        event: InboundEvent,
    ) -> Result<(), RelayError> {
        event.validate()?;
        trace!(connection = %connection_id, event = %event.name(), "Handling event");

        let outcome = match event {
            InboundEvent::SendMessage(message) => self.send_message(&message).await,
            InboundEvent::GetStoredMessages(selected, requesting) => {
                self.get_stored_messages(connection_id, &selected, &requesting)
                    .await
            }
            InboundEvent::UserConnected(identity) => {
                self.user_connected(connection_id, &identity).await;
                Ok(())
            }
            InboundEvent::UserDisconnected(identity) => {
                self.user_disconnected(&identity).await;
                Ok(())
            }
        };

        if let Err(e) = outcome {
            self.report_failure(connection_id, e);
        }
        Ok(())
    }

    /// Persist a message and broadcast the stored record to everyone.
    async fn send_message(&self, message: &ChatMessage) -> Result<(), RelayError> {
        let stored = self
            .store
            .save_message(&message.de, &message.para, &message.mensaje)
            .await
            .map_err(|source| RelayError::Persistence {
                operation: "save_message",
                source,
            })?;

        debug!(id = stored.id, from = %stored.de, to = %stored.para, "Message persisted");
        self.multiplexer.broadcast_all(OutboundEvent::NewMessage(stored));
        Ok(())
    }

    /// Reply with the history between two identities, then rebroadcast
    /// each record as `newMessage`.
    ///
    /// The requester's copies wait for room in its queue so a long history
    /// is never truncated; everyone else gets the usual fire-and-forget
    /// broadcast.
    async fn get_stored_messages(
        &self,
        connection_id: &ConnectionId,
        selected: &str,
        requesting: &str,
    ) -> Result<(), RelayError> {
        let history = self
            .store
            .query_history(selected, requesting)
            .await
            .map_err(|source| RelayError::Persistence {
                operation: "query_history",
                source,
            })?;

        debug!(
            connection = %connection_id,
            selected = %selected,
            requesting = %requesting,
            count = history.len(),
            "History retrieved"
        );

        let mut requester_open = match self
            .multiplexer
            .deliver(connection_id, OutboundEvent::StoredMessages(history.clone()))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "History reply not delivered");
                false
            }
        };

        for message in history {
            let event = OutboundEvent::NewMessage(message);
            self.multiplexer.broadcast_except(connection_id, event.clone());
            if requester_open {
                if let Err(e) = self.multiplexer.deliver(connection_id, event).await {
                    debug!(connection = %connection_id, error = %e, "Requester gone during replay");
                    requester_open = false;
                }
            }
        }
        Ok(())
    }

    async fn user_connected(&self, connection_id: &ConnectionId, identity: &str) {
        // Outside the presence lock: the store may be slow.
        match self.store.messages_for(identity).await {
            Ok(pending) => {
                debug!(
                    identity = %identity,
                    pending = pending.len(),
                    "Messages addressed to identity"
                );
            }
            Err(source) => self.report_failure(
                connection_id,
                RelayError::Persistence {
                    operation: "messages_for",
                    source,
                },
            ),
        }

        // Identify under the guard so a concurrent close sees this connection.
        let mut presence = self.presence.lock().await;
        self.multiplexer.identify(connection_id, identity);
        info!(connection = %connection_id, identity = %identity, "User connected");

        presence.connect(identity);
        let others = presence.list_others(identity);
        self.multiplexer.broadcast_all(OutboundEvent::UserConnected(others));
    }

    async fn user_disconnected(&self, identity: &str) {
        let mut presence = self.presence.lock().await;
        self.withdraw(&mut presence, identity);
    }

    fn withdraw(&self, presence: &mut PresenceSet, identity: &str) {
        info!(identity = %identity, "User disconnected");
        presence.disconnect(identity);
        let others = presence.list_others(identity);
        self.multiplexer.broadcast_all(OutboundEvent::UserConnected(others));
    }

    /// Release a connection after its transport closed.
    ///
    /// Presence is left untouched unless
    /// [`RelayConfig::remove_presence_on_close`] is set and no other open
    /// connection carries the same identity.
    pub async fn connection_closed(&self, connection_id: &ConnectionId) -> Option<Identity> {
        if !self.config.remove_presence_on_close {
            let identity = self.multiplexer.close(connection_id);
            log_close(connection_id, identity.as_deref());
            return identity;
        }

        // Close and count under the guard; announcements identify under it too.
        let mut presence = self.presence.lock().await;
        let identity = self.multiplexer.close(connection_id);
        log_close(connection_id, identity.as_deref());

        if let Some(identity) = identity.as_deref() {
            if self.multiplexer.connections_for(identity) == 0 {
                self.withdraw(&mut presence, identity);
            }
        }

        identity
    }

    fn report_failure(&self, connection_id: &ConnectionId, err: RelayError) {
        match err {
            RelayError::Persistence { operation, source } => {
                error!(
                    connection = %connection_id,
                    operation,
                    error = %source,
                    "Persistence failure"
                );
                // No subscribers is fine; the log line above is the sink of last resort.
                let _ = self.failures.send(PersistenceFailure {
                    connection: connection_id.clone(),
                    operation,
                    error: source,
                });
            }
            other => warn!(connection = %connection_id, error = %other, "Event rejected"),
        }
    }
}

fn log_close(connection_id: &ConnectionId, identity: Option<&str>) {
    info!(
        connection = %connection_id,
        identity = identity.unwrap_or("-"),
        "Transport closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn relay(config: RelayConfig) -> Arc<Relay> {
        Arc::new(Relay::new(
            Arc::new(PresenceRegistry::new()),
            Arc::new(Multiplexer::new()),
            Arc::new(MemoryStore::new()),
            config,
        ))
    }

    #[tokio::test]
    async fn test_dispatch_rejects_misuse() {
        let relay = relay(RelayConfig::default());
        let (conn, mut outbox) = relay.multiplexer().open();

        let result = relay
            .dispatch(&conn, InboundEvent::UserConnected(String::new()))
            .await;

        assert!(matches!(result, Err(RelayError::ProtocolMisuse(_))));
        assert!(relay.presence().snapshot().await.is_empty());
        assert!(outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_spawns_send_message() {
        let relay = relay(RelayConfig::default());
        let (conn, mut outbox) = relay.multiplexer().open();

        let handle = relay
            .dispatch(
                &conn,
                InboundEvent::SendMessage(ChatMessage::new("alice", "bob", "hi")),
            )
            .await
            .unwrap()
            .expect("sendMessage runs on its own task");
        handle.await.unwrap();

        match outbox.try_recv().unwrap().as_ref() {
            OutboundEvent::NewMessage(m) => assert_eq!(m.mensaje, "hi"),
            other => panic!("Expected newMessage, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_user_connected_identifies_connection() {
        let relay = relay(RelayConfig::default());
        let (conn, _outbox) = relay.multiplexer().open();

        relay
            .handle(&conn, InboundEvent::UserConnected("alice".into()))
            .await
            .unwrap();

        assert_eq!(
            relay.multiplexer().identity(&conn),
            Some("alice".to_string())
        );
        assert!(relay.presence().contains("alice").await);
    }

    #[tokio::test]
    async fn test_close_keeps_presence_by_default() {
        let relay = relay(RelayConfig::default());
        let (conn, _outbox) = relay.multiplexer().open();
        relay
            .handle(&conn, InboundEvent::UserConnected("alice".into()))
            .await
            .unwrap();

        assert_eq!(relay.connection_closed(&conn).await, Some("alice".into()));
        assert!(relay.presence().contains("alice").await);
        assert!(!relay.multiplexer().is_open(&conn));
    }

    #[tokio::test]
    async fn test_close_removes_presence_when_configured() {
        let relay = relay(RelayConfig {
            remove_presence_on_close: true,
            ..Default::default()
        });
        let (first, _rx1) = relay.multiplexer().open();
        let (second, _rx2) = relay.multiplexer().open();
        let (watcher, mut watcher_rx) = relay.multiplexer().open();

        for conn in [&first, &second] {
            relay
                .handle(conn, InboundEvent::UserConnected("alice".into()))
                .await
                .unwrap();
        }
        while watcher_rx.try_recv().is_ok() {}

        // Another connection still carries the identity
        relay.connection_closed(&first).await;
        assert!(relay.presence().contains("alice").await);

        relay.connection_closed(&second).await;
        assert!(!relay.presence().contains("alice").await);
        assert_eq!(
            *watcher_rx.try_recv().unwrap(),
            OutboundEvent::UserConnected(Vec::new())
        );
        assert!(relay.multiplexer().is_open(&watcher));
    }
}
