//! Presence tracking for the relay.
//!
//! The registry records which identities are currently online. Membership
//! changes and the broadcasts that announce them must happen under the same
//! lock, so [`PresenceRegistry::lock`] hands out the guard instead of
//! offering one-shot mutators.

use relay_protocol::Identity;
use std::collections::HashSet;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// The set of connected identities.
///
/// An identity appears at most once no matter how often it connects.
#[derive(Debug, Default)]
pub struct PresenceSet {
    members: HashSet<Identity>,
}

impl PresenceSet {
    /// Create an empty presence set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity.
    ///
    /// Returns `true` if the identity was not already present.
    pub fn connect(&mut self, identity: &str) -> bool {
        let is_new = self.members.insert(identity.to_string());
        if is_new {
            debug!(identity = %identity, "Presence: identity connected");
        }
        is_new
    }

    /// Remove an identity.
    ///
    /// Returns `true` if the identity was present.
    pub fn disconnect(&mut self, identity: &str) -> bool {
        let removed = self.members.remove(identity);
        if removed {
            debug!(identity = %identity, "Presence: identity disconnected");
        }
        removed
    }

    /// All members except `excluding`, in no particular order.
    #[must_use]
    pub fn list_others(&self, excluding: &str) -> Vec<Identity> {
        self.members
            .iter()
            .filter(|member| member.as_str() != excluding)
            .cloned()
            .collect()
    }

    /// Check if an identity is present.
    #[must_use]
    pub fn contains(&self, identity: &str) -> bool {
        self.members.contains(identity)
    }

    /// Get all members.
    #[must_use]
    pub fn members(&self) -> Vec<Identity> {
        self.members.iter().cloned().collect()
    }

    /// Get the number of present identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if nobody is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Shared, lock-guarded presence state.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    inner: Mutex<PresenceSet>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the registry.
    ///
    /// Hold the guard across a mutation and the broadcast describing it.
    /// Never hold it across a store call.
    pub async fn lock(&self) -> MutexGuard<'_, PresenceSet> {
        self.inner.lock().await
    }

    /// Copy of the current members.
    pub async fn snapshot(&self) -> Vec<Identity> {
        self.inner.lock().await.members()
    }

    /// Check if an identity is present.
    pub async fn contains(&self, identity: &str) -> bool {
        self.inner.lock().await.contains(identity)
    }
}
