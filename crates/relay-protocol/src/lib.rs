//! # relay-protocol
//!
//! Wire events for the chat relay.
//!
//! Clients and the server exchange named events. Each event is a JSON
//! object of the form `{"event": "<name>", "data": <payload>}` carried in
//! a WebSocket text frame, or the same structure MessagePack-encoded with
//! a length prefix in a binary frame.
//!
//! ## Events
//!
//! - Inbound: `sendMessage`, `getStoredMessages`, `userConnected`, `userDisconnected`
//! - Outbound: `newMessage`, `storedMessages`, `userConnected`
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, InboundEvent};
//!
//! let event = codec::decode_text(r#"{"event":"userConnected","data":"alice"}"#).unwrap();
//! assert_eq!(event, InboundEvent::UserConnected("alice".into()));
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, decode_text, encode, encode_text, ProtocolError};
pub use events::{
    ChatMessage, EventName, Identity, InboundEvent, OutboundEvent, StoredMessage, User,
};
