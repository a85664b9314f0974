//! Server side of the chat relay
//!
//! This module provides:
//! - The relay server: endpoint setup, accept loop, broadcast routing
//! - Per-connection session handling and delivery
//! - Presence tracking
//! - Reconnection recovery (resumption cache and replay planning)

pub mod presence;
pub mod recovery;
pub mod relay;
pub mod session;

pub use presence::PresenceTracker;
pub use recovery::{RecoveryPlan, ResumeCache, plan_recovery};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use session::{SessionCommand, SessionEvent, SessionHandler};
