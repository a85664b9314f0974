//! Reconnection recovery for the chat relay
//!
//! Two pieces decide what a (re)connecting client needs:
//!
//! - [`ResumeCache`] remembers recently-disconnected sessions (identity and
//!   delivery watermark) for a grace period, so a quick reconnect can pick
//!   up server-side delivery state instead of trusting its own claim.
//! - [`plan_recovery`] turns the cache entry, the client's claimed offset,
//!   and the current log head into a recovery plan: a verified resumption
//!   (nothing was missed, no replay) or a replay from the most credible
//!   watermark.
//!
//! The replay itself is driven by the session writer, which pages through
//! the log from the chosen watermark.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

use crate::protocol::Offset;

/// Delivery state parked for a disconnected session
#[derive(Debug, Clone)]
pub struct ResumeEntry {
    /// Identity the session was registered under
    pub identity: String,
    /// Highest offset delivered to that session
    pub delivered: Offset,
    /// When the session disconnected
    pub disconnected_at: Instant,
}

/// What a connecting session should do about history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPlan {
    /// Prior delivery state survived intact; start live from this watermark
    Resumed { from: Offset },
    /// Replay everything after this watermark, then go live
    Replay { from: Offset },
}

impl RecoveryPlan {
    /// Watermark the session writer starts from
    pub fn from_offset(&self) -> Offset {
        match self {
            RecoveryPlan::Resumed { from } | RecoveryPlan::Replay { from } => *from,
        }
    }

    /// Whether the plan is a verified resumption
    pub fn is_resumed(&self) -> bool {
        matches!(self, RecoveryPlan::Resumed { .. })
    }
}

/// Recently-disconnected sessions kept around for a grace period
pub struct ResumeCache {
    grace: Duration,
    entries: RwLock<HashMap<String, ResumeEntry>>,
}

impl ResumeCache {
    /// Create a cache that honors resume tokens for `grace` after disconnect
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Park a disconnected session's delivery state
    pub async fn remember(&self, session_id: &str, identity: &str, delivered: Offset) {
        let mut entries = self.entries.write().await;

        // Opportunistically drop entries that can no longer be claimed
        let grace = self.grace;
        entries.retain(|_, e| e.disconnected_at.elapsed() < grace);

        entries.insert(
            session_id.to_string(),
            ResumeEntry {
                identity: identity.to_string(),
                delivered,
                disconnected_at: Instant::now(),
            },
        );

        debug!(session_id = %session_id, delivered, "Parked session for resumption");
    }

    /// Claim a parked session by id.
    ///
    /// The entry is consumed either way; None means unknown or expired.
    pub async fn claim(&self, session_id: &str) -> Option<ResumeEntry> {
        let entry = self.entries.write().await.remove(session_id)?;
        if entry.disconnected_at.elapsed() < self.grace {
            Some(entry)
        } else {
            debug!(session_id = %session_id, "Resume token expired");
            None
        }
    }

    /// Number of parked sessions (expired entries included until pruned)
    pub async fn parked(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Decide between verified resumption and replay.
///
/// Resumption holds only when the transport-level state survived (a cache
/// entry within grace) *and* nothing was appended past its watermark —
/// otherwise messages were missed and the gap must be replayed. Without a
/// usable entry the client's own claim is all there is; with a stale entry
/// the larger of the two watermarks wins.
pub fn plan_recovery(
    entry: Option<&ResumeEntry>,
    claimed_offset: Offset,
    head_offset: Offset,
) -> RecoveryPlan {
    match entry {
        Some(entry) if entry.delivered >= head_offset => RecoveryPlan::Resumed {
            from: entry.delivered,
        },
        Some(entry) => RecoveryPlan::Replay {
            from: entry.delivered.max(claimed_offset),
        },
        None => RecoveryPlan::Replay {
            from: claimed_offset,
        },
    }
}
