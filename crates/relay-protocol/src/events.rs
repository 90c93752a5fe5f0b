//! Event types for the relay protocol.
//!
//! The event names are the wire contract shared with existing clients and
//! must not change. Payload field names (`de`, `para`, `mensaje`) are kept
//! for the same reason.

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// An opaque username identifying a chat participant.
pub type Identity = String;

/// Event name identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    #[serde(rename = "sendMessage")]
    SendMessage,
    #[serde(rename = "getStoredMessages")]
    GetStoredMessages,
    #[serde(rename = "userConnected")]
    UserConnected,
    #[serde(rename = "userDisconnected")]
    UserDisconnected,
    #[serde(rename = "newMessage")]
    NewMessage,
    #[serde(rename = "storedMessages")]
    StoredMessages,
}

impl EventName {
    /// The name as it appears on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EventName::SendMessage => "sendMessage",
            EventName::GetStoredMessages => "getStoredMessages",
            EventName::UserConnected => "userConnected",
            EventName::UserDisconnected => "userDisconnected",
            EventName::NewMessage => "newMessage",
            EventName::StoredMessages => "storedMessages",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat message as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender.
    pub de: Identity,
    /// Recipient.
    pub para: Identity,
    /// Message body.
    pub mensaje: String,
}

impl ChatMessage {
    /// Create a new chat message.
    #[must_use]
    pub fn new(
        from: impl Into<Identity>,
        to: impl Into<Identity>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            de: from.into(),
            para: to.into(),
            mensaje: body.into(),
        }
    }
}

/// A message as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Store-assigned identifier.
    pub id: u64,
    /// Sender.
    pub de: Identity,
    /// Recipient.
    pub para: Identity,
    /// Message body.
    pub mensaje: String,
    /// Insertion time in milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Store-assigned identifier.
    pub id: u64,
    /// Unique username.
    pub user_name: Identity,
    /// Display name.
    pub name: String,
}

/// An event sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum InboundEvent {
    /// Persist a message and relay it.
    #[serde(rename = "sendMessage")]
    SendMessage(ChatMessage),

    /// Fetch history between `(selected_user, requesting_user)`.
    #[serde(rename = "getStoredMessages")]
    GetStoredMessages(Identity, Identity),

    /// Announce an identity on this connection.
    #[serde(rename = "userConnected")]
    UserConnected(Identity),

    /// Withdraw an identity from presence.
    #[serde(rename = "userDisconnected")]
    UserDisconnected(Identity),
}

impl InboundEvent {
    /// Get the event name.
    #[must_use]
    pub fn name(&self) -> EventName {
        match self {
            InboundEvent::SendMessage(_) => EventName::SendMessage,
            InboundEvent::GetStoredMessages(..) => EventName::GetStoredMessages,
            InboundEvent::UserConnected(_) => EventName::UserConnected,
            InboundEvent::UserDisconnected(_) => EventName::UserDisconnected,
        }
    }

    /// Check that every identity carried by the event is present.
    ///
    /// Message bodies may be empty; identities may not.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Misuse`] naming the offending field.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            InboundEvent::SendMessage(message) => {
                require_identity("de", &message.de)?;
                require_identity("para", &message.para)
            }
            InboundEvent::GetStoredMessages(selected, requesting) => {
                require_identity("selectedUser", selected)?;
                require_identity("username", requesting)
            }
            InboundEvent::UserConnected(identity) | InboundEvent::UserDisconnected(identity) => {
                require_identity("username", identity)
            }
        }
    }
}

fn require_identity(field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if value.trim().is_empty() {
        return Err(ProtocolError::Misuse(format!("{field} must not be empty")));
    }
    Ok(())
}

/// An event sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    /// A message to display.
    #[serde(rename = "newMessage")]
    NewMessage(StoredMessage),

    /// History reply for a `getStoredMessages` request.
    #[serde(rename = "storedMessages")]
    StoredMessages(Vec<StoredMessage>),

    /// Connected identities, excluding the one that triggered the update.
    #[serde(rename = "userConnected")]
    UserConnected(Vec<Identity>),
}

impl OutboundEvent {
    /// Get the event name.
    #[must_use]
    pub fn name(&self) -> EventName {
        match self {
            OutboundEvent::NewMessage(_) => EventName::NewMessage,
            OutboundEvent::StoredMessages(_) => EventName::StoredMessages,
            OutboundEvent::UserConnected(_) => EventName::UserConnected,
        }
    }
}
