//! # Relay Server
//!
//! WebSocket and HTTP front end for the direct-messaging relay.

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod users;

pub use config::Config;
pub use handlers::{router, run_server, serve, AppState};
