//! QUIC-based chat relay with a durable message log
//!
//! This library provides a real-time chat relay where every message is
//! recorded exactly once in an append-only SQLite log, and reconnecting
//! clients are replayed exactly the messages they missed, keyed by the
//! log's offsets.

pub mod client;
pub mod error;
pub mod loopback;
pub mod protocol;
pub mod server;
pub mod store;

pub use client::{ClientConfig, ClientEvent, RelayClient};
pub use error::{RelayError, Result};
pub use server::{RelayConfig, RelayServer};
pub use store::{AppendOutcome, MessageLog, StoredMessage};

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a unique client token for a message
pub fn generate_token() -> String {
    Uuid::new_v4().to_string()
}

/// Get current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
