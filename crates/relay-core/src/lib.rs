//! # relay-core
//!
//! Presence tracking and message relay for the chat server.
//!
//! This crate provides the stateful pieces of the relay:
//!
//! - **Presence** - Which identities are currently online
//! - **Multiplexer** - Live connections with broadcast and unicast delivery
//! - **Store** - The persistence gateway trait and an in-memory store
//! - **Relay** - Inbound event dispatch
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Connection  │────▶│    Relay    │────▶│    Store    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        │                   ▼
//! ┌─────────────┐     ┌─────────────┐
//! │ Multiplexer │◀────│  Presence   │
//! └─────────────┘     └─────────────┘
//! ```

pub mod multiplexer;
pub mod presence;
pub mod relay;
pub mod store;

pub use multiplexer::{ConnectionId, Multiplexer, MultiplexerError, MultiplexerStats, Outbox};
pub use presence::{PresenceRegistry, PresenceSet};
pub use relay::{PersistenceFailure, Relay, RelayConfig, RelayError};
pub use store::{MemoryStore, MessageStore, Registration, StoreError};
