//! Persistence gateway.
//!
//! The relay only ever talks to storage through [`MessageStore`]. The store
//! never calls back into the relay.

use async_trait::async_trait;
use relay_protocol::{StoredMessage, User};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Store errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A statement was rejected by the store.
    #[error("Query failed: {0}")]
    Query(String),
}

/// Outcome of a registration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// The username was already registered; nothing changed.
    Existing(User),
    /// A new user was created.
    Created(User),
}

impl Registration {
    /// The user, whether new or existing.
    #[must_use]
    pub fn user(&self) -> &User {
        match self {
            Registration::Existing(user) | Registration::Created(user) => user,
        }
    }
}

/// Durable storage for users and messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message from `from` to `to`.
    async fn save_message(
        &self,
        from: &str,
        to: &str,
        body: &str,
    ) -> Result<StoredMessage, StoreError>;

    /// All messages exchanged between `a` and `b` in either direction,
    /// oldest first.
    async fn query_history(&self, a: &str, b: &str) -> Result<Vec<StoredMessage>, StoreError>;

    /// All messages addressed to `recipient`, oldest first.
    async fn messages_for(&self, recipient: &str) -> Result<Vec<StoredMessage>, StoreError>;

    /// Register a user unless the username is already taken.
    async fn register_user(&self, name: &str, display_name: &str)
        -> Result<Registration, StoreError>;

    /// All registered users.
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// In-process store.
///
/// Records live for the lifetime of the process. Ids start at 1 and grow
/// monotonically; messages are kept in insertion order.
#[derive(Debug)]
pub struct MemoryStore {
    messages: RwLock<Vec<StoredMessage>>,
    users: RwLock<Vec<User>>,
    next_message_id: AtomicU64,
    next_user_id: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            users: RwLock::new(Vec::new()),
            next_message_id: AtomicU64::new(1),
            next_user_id: AtomicU64::new(1),
        }
    }

    /// Number of stored messages.
    pub async fn message_count(&self) -> usize {
        self.messages.read().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save_message(
        &self,
        from: &str,
        to: &str,
        body: &str,
    ) -> Result<StoredMessage, StoreError> {
        let mut messages = self.messages.write().await;
        let message = StoredMessage {
            id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            de: from.to_string(),
            para: to.to_string(),
            mensaje: body.to_string(),
            created_at: now_millis(),
        };
        messages.push(message.clone());
        debug!(id = message.id, from = %from, to = %to, "Message stored");
        Ok(message)
    }

    async fn query_history(&self, a: &str, b: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| (m.de == a && m.para == b) || (m.de == b && m.para == a))
            .cloned()
            .collect())
    }

    async fn messages_for(&self, recipient: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| m.para == recipient)
            .cloned()
            .collect())
    }

    async fn register_user(
        &self,
        name: &str,
        display_name: &str,
    ) -> Result<Registration, StoreError> {
        let mut users = self.users.write().await;
        if let Some(existing) = users.iter().find(|u| u.user_name == name) {
            return Ok(Registration::Existing(existing.clone()));
        }

        let user = User {
            id: self.next_user_id.fetch_add(1, Ordering::Relaxed),
            user_name: name.to_string(),
            name: display_name.to_string(),
        };
        users.push(user.clone());
        debug!(id = user.id, user = %name, "User registered");
        Ok(Registration::Created(user))
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.users.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_assigns_increasing_ids() {
        let store = MemoryStore::new();
        let first = store.save_message("alice", "bob", "hi").await.unwrap();
        let second = store.save_message("bob", "alice", "hey").await.unwrap();

        assert_eq!(first.de, "alice");
        assert_eq!(first.para, "bob");
        assert_eq!(first.mensaje, "hi");
        assert!(second.id > first.id);
        assert!(second.created_at >= first.created_at);
        assert_eq!(store.message_count().await, 2);
    }

    #[tokio::test]
    async fn test_history_is_symmetric_and_ordered() {
        let store = MemoryStore::new();
        store.save_message("alice", "bob", "1").await.unwrap();
        store.save_message("carol", "bob", "x").await.unwrap();
        store.save_message("bob", "alice", "2").await.unwrap();

        let forward = store.query_history("alice", "bob").await.unwrap();
        let backward = store.query_history("bob", "alice").await.unwrap();

        let bodies: Vec<_> = forward.iter().map(|m| m.mensaje.as_str()).collect();
        assert_eq!(bodies, vec!["1", "2"]);
        assert_eq!(forward, backward);
    }

    #[tokio::test]
    async fn test_messages_for_recipient() {
        let store = MemoryStore::new();
        store.save_message("alice", "bob", "1").await.unwrap();
        store.save_message("bob", "alice", "2").await.unwrap();
        store.save_message("carol", "bob", "3").await.unwrap();

        let inbox = store.messages_for("bob").await.unwrap();
        assert_eq!(inbox.len(), 2);
        assert!(inbox.iter().all(|m| m.para == "bob"));
    }

    #[tokio::test]
    async fn test_register_existing_user() {
        let store = MemoryStore::new();

        let created = store.register_user("alice", "Alice A.").await.unwrap();
        assert!(matches!(created, Registration::Created(_)));

        let again = store.register_user("alice", "Someone Else").await.unwrap();
        match again {
            Registration::Existing(user) => assert_eq!(user.name, "Alice A."),
            other => panic!("Expected Existing, got {:?}", other),
        }

        assert_eq!(store.list_users().await.unwrap().len(), 1);
    }
}
