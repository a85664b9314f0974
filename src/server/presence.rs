//! Presence tracking for the chat relay
//!
//! Tracks which identities currently have at least one open session. An
//! identity appears once in the online set however many sessions it has;
//! counting sessions per identity keeps one disconnect of a shared display
//! name from clearing presence for the other connection.

use std::collections::HashMap;

use tokio::sync::RwLock;

/// Identity -> open-session count
pub struct PresenceTracker {
    counts: RwLock<HashMap<String, usize>>,
}

impl PresenceTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self {
            counts: RwLock::new(HashMap::new()),
        }
    }

    /// Record a session opening for this identity.
    ///
    /// Returns true when the identity was previously offline, i.e. the
    /// online set changed.
    pub async fn connect(&self, identity: &str) -> bool {
        let mut counts = self.counts.write().await;
        let count = counts.entry(identity.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Record a session closing for this identity.
    ///
    /// Returns true when this was the identity's last session, i.e. the
    /// online set changed.
    pub async fn disconnect(&self, identity: &str) -> bool {
        let mut counts = self.counts.write().await;
        match counts.get_mut(identity) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                counts.remove(identity);
                true
            }
            None => false,
        }
    }

    /// Check whether an identity has at least one open session
    pub async fn is_online(&self, identity: &str) -> bool {
        self.counts.read().await.contains_key(identity)
    }

    /// Number of distinct online identities
    pub async fn online_count(&self) -> usize {
        self.counts.read().await.len()
    }

    /// Snapshot of all online identities, sorted for stable output
    pub async fn snapshot(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.counts.read().await.keys().cloned().collect();
        identities.sort();
        identities
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_disconnect() {
        let presence = PresenceTracker::new();

        assert!(presence.connect("alice").await);
        assert!(presence.is_online("alice").await);
        assert_eq!(presence.online_count().await, 1);

        assert!(presence.disconnect("alice").await);
        assert!(!presence.is_online("alice").await);
        assert_eq!(presence.online_count().await, 0);
    }

    #[tokio::test]
    async fn test_shared_identity_counts_sessions() {
        let presence = PresenceTracker::new();

        // First connection changes the online set, the second does not
        assert!(presence.connect("alice").await);
        assert!(!presence.connect("alice").await);

        // Closing one of the two sessions leaves alice online
        assert!(!presence.disconnect("alice").await);
        assert!(presence.is_online("alice").await);

        // Closing the last one takes her offline
        assert!(presence.disconnect("alice").await);
        assert!(!presence.is_online("alice").await);
    }

    #[tokio::test]
    async fn test_snapshot_is_sorted() {
        let presence = PresenceTracker::new();

        presence.connect("carol").await;
        presence.connect("alice").await;
        presence.connect("bob").await;

        assert_eq!(presence.snapshot().await, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_disconnect_unknown_identity_is_noop() {
        let presence = PresenceTracker::new();
        assert!(!presence.disconnect("ghost").await);
        assert_eq!(presence.online_count().await, 0);
    }

    #[tokio::test]
    async fn test_snapshot_matches_open_sessions() {
        let presence = PresenceTracker::new();

        presence.connect("alice").await;
        presence.connect("bob").await;
        presence.connect("bob").await;
        presence.disconnect("alice").await;

        assert_eq!(presence.snapshot().await, vec!["bob"]);
    }
}
