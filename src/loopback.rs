//! In-process loopback exercises for the relay
//!
//! Spins up a real relay on an ephemeral port and drives real clients
//! against it, covering the delivery contract end to end: exactly-once
//! recording under retries, offset replay on reconnect, resumption, and
//! presence.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::client::{ClientConfig, RelayClient};
use crate::error::Result;
use crate::server::{RelayConfig, RelayServer};

/// Start a relay on an ephemeral port and serve it in the background.
///
/// Returns the server handle and the address clients should dial.
pub async fn spawn_relay(config: RelayConfig) -> Result<(Arc<RelayServer>, SocketAddr)> {
    let mut server = RelayServer::new(config)?;
    let addr = server.bind()?;

    let server = Arc::new(server);
    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });

    Ok((server, addr))
}

/// Build a client aimed at the given relay address
pub fn client_for(server_addr: SocketAddr) -> RelayClient {
    RelayClient::new(ClientConfig {
        server_addr,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientEvent;
    use crate::protocol::Offset;
    use crate::store::MessageLog;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(300);

    fn ephemeral_config(dir: &tempfile::TempDir) -> RelayConfig {
        RelayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            db_path: dir.path().join("relay.db"),
            ..Default::default()
        }
    }

    /// Wait for the next event matching the predicate, skipping others
    async fn next_matching<F>(
        rx: &mut UnboundedReceiver<ClientEvent>,
        mut pred: F,
    ) -> Option<ClientEvent>
    where
        F: FnMut(&ClientEvent) -> bool,
    {
        timeout(WAIT, async {
            loop {
                match rx.recv().await {
                    Some(event) if pred(&event) => return Some(event),
                    Some(_) => continue,
                    None => return None,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Assert that no matching event arrives within a quiet window
    async fn assert_quiet<F>(rx: &mut UnboundedReceiver<ClientEvent>, mut pred: F)
    where
        F: FnMut(&ClientEvent) -> bool,
    {
        let got = timeout(QUIET, async {
            loop {
                match rx.recv().await {
                    Some(event) if pred(&event) => return Some(event),
                    Some(_) => continue,
                    None => return None,
                }
            }
        })
        .await;

        match got {
            Err(_) => {}                 // window elapsed quietly
            Ok(None) => {}               // channel closed, also quiet
            Ok(Some(event)) => panic!("Expected quiet, got {:?}", event),
        }
    }

    async fn next_message(rx: &mut UnboundedReceiver<ClientEvent>) -> (Offset, String, String) {
        match next_matching(rx, |e| matches!(e, ClientEvent::Message(_))).await {
            Some(ClientEvent::Message(msg)) => (msg.offset, msg.sender, msg.content),
            other => panic!("Expected a chat message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exactly_once_delivery_under_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (_server, addr) = spawn_relay(ephemeral_config(&dir)).await.unwrap();

        let mut alice = client_for(addr);
        let mut alice_rx = alice.connect("alice").await.unwrap();
        let mut bob = client_for(addr);
        let mut bob_rx = bob.connect("bob").await.unwrap();

        // First send is recorded under offset 1 and broadcast to everyone
        alice.send_message_with_token("hi", "abc").await.unwrap();

        let (offset, sender, content) = next_message(&mut bob_rx).await;
        assert_eq!((offset, sender.as_str(), content.as_str()), (1, "alice", "hi"));

        // The sender is acked first, then hears the broadcast with the
        // assigned offset
        let acked = next_matching(&mut alice_rx, |e| matches!(e, ClientEvent::Acked(_))).await;
        match acked {
            Some(ClientEvent::Acked(ack)) => {
                assert_eq!(ack.token, "abc");
                assert_eq!(ack.offset, 1);
            }
            other => panic!("Expected ack, got {:?}", other),
        }

        let (offset, _, _) = next_message(&mut alice_rx).await;
        assert_eq!(offset, 1);

        // Retrying the same token is acked with the original offset and
        // never broadcast a second time
        alice.send_message_with_token("hi", "abc").await.unwrap();

        let acked = next_matching(&mut alice_rx, |e| matches!(e, ClientEvent::Acked(_))).await;
        match acked {
            Some(ClientEvent::Acked(ack)) => assert_eq!(ack.offset, 1),
            other => panic!("Expected ack, got {:?}", other),
        }

        assert_quiet(&mut bob_rx, |e| matches!(e, ClientEvent::Message(_))).await;
        assert_quiet(&mut alice_rx, |e| matches!(e, ClientEvent::Message(_))).await;
    }

    #[tokio::test]
    async fn test_replay_of_missed_messages() {
        let dir = tempfile::tempdir().unwrap();
        let config = ephemeral_config(&dir);

        // Seed the log before the relay comes up
        {
            let log = MessageLog::open(&config.db_path, false).unwrap();
            log.append("carol", "one", "t1").unwrap();
            log.append("carol", "two", "t2").unwrap();
            log.append("carol", "three", "t3").unwrap();
        }

        let (_server, addr) = spawn_relay(config).await.unwrap();

        // A fresh client claiming offset 0 gets the whole backlog in order
        let mut xavier = client_for(addr);
        let mut xavier_rx = xavier.connect("xavier").await.unwrap();

        let connected =
            next_matching(&mut xavier_rx, |e| matches!(e, ClientEvent::Connected { .. })).await;
        match connected {
            Some(ClientEvent::Connected {
                resumed,
                head_offset,
            }) => {
                assert!(!resumed);
                assert_eq!(head_offset, 3);
            }
            other => panic!("Expected Connected, got {:?}", other),
        }

        for (expected_offset, expected_content) in [(1, "one"), (2, "two"), (3, "three")] {
            let (offset, sender, content) = next_message(&mut xavier_rx).await;
            assert_eq!(offset, expected_offset);
            assert_eq!(sender, "carol");
            assert_eq!(content, expected_content);
        }

        // Live traffic continues after the replayed backlog
        let mut yvonne = client_for(addr);
        let _yvonne_rx = yvonne.connect("yvonne").await.unwrap();
        yvonne.send_message("fresh").await.unwrap();

        let (offset, _, content) = next_message(&mut xavier_rx).await;
        assert_eq!(offset, 4);
        assert_eq!(content, "fresh");
    }

    #[tokio::test]
    async fn test_resumption_and_gap_replay() {
        let dir = tempfile::tempdir().unwrap();
        let (_server, addr) = spawn_relay(ephemeral_config(&dir)).await.unwrap();

        let mut bob = client_for(addr);
        let mut bob_rx = bob.connect("bob").await.unwrap();

        let mut alice = client_for(addr);
        let mut alice_rx = alice.connect("alice").await.unwrap();

        // Alice sees message 1, then drops
        bob.send_message("first").await.unwrap();
        let (offset, _, _) = next_message(&mut alice_rx).await;
        assert_eq!(offset, 1);
        assert_eq!(alice.last_seen_offset(), 1);

        alice.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Nothing was sent meanwhile: reconnect resumes without replay
        let mut alice_rx = alice.connect("alice").await.unwrap();
        let connected =
            next_matching(&mut alice_rx, |e| matches!(e, ClientEvent::Connected { .. })).await;
        match connected {
            Some(ClientEvent::Connected { resumed, .. }) => assert!(resumed),
            other => panic!("Expected Connected, got {:?}", other),
        }
        assert_quiet(&mut alice_rx, |e| matches!(e, ClientEvent::Message(_))).await;

        // Drop again, miss one message, reconnect: only the gap is replayed
        alice.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Wait for bob's ack so the append is committed before alice returns
        let token = bob.send_message("second").await.unwrap();
        let acked = next_matching(&mut bob_rx, |e| {
            matches!(e, ClientEvent::Acked(a) if a.token == token)
        })
        .await;
        assert!(acked.is_some());

        let mut alice_rx = alice.connect("alice").await.unwrap();
        let connected =
            next_matching(&mut alice_rx, |e| matches!(e, ClientEvent::Connected { .. })).await;
        match connected {
            Some(ClientEvent::Connected { resumed, .. }) => assert!(!resumed),
            other => panic!("Expected Connected, got {:?}", other),
        }

        let (offset, _, content) = next_message(&mut alice_rx).await;
        assert_eq!(offset, 2);
        assert_eq!(content, "second");

        // And nothing before the gap is repeated
        assert_quiet(&mut alice_rx, |e| {
            matches!(e, ClientEvent::Message(m) if m.offset < 2)
        })
        .await;
    }

    #[tokio::test]
    async fn test_presence_follows_connections() {
        let dir = tempfile::tempdir().unwrap();
        let (_server, addr) = spawn_relay(ephemeral_config(&dir)).await.unwrap();

        let mut xavier = client_for(addr);
        let mut xavier_rx = xavier.connect("xavier").await.unwrap();

        let mut yvonne = client_for(addr);
        let mut yvonne_rx = yvonne.connect("yvonne").await.unwrap();

        // Each sees the other appear
        let joined = next_matching(&mut xavier_rx, |e| matches!(e, ClientEvent::Joined(_))).await;
        match joined {
            Some(ClientEvent::Joined(identity)) => assert_eq!(identity, "yvonne"),
            other => panic!("Expected Joined, got {:?}", other),
        }

        let online = next_matching(&mut yvonne_rx, |e| matches!(e, ClientEvent::Online(_))).await;
        match online {
            Some(ClientEvent::Online(identities)) => {
                assert_eq!(identities, vec!["xavier", "yvonne"]);
            }
            other => panic!("Expected Online, got {:?}", other),
        }

        // Xavier leaving shows up in Yvonne's next snapshot
        xavier.disconnect().await.unwrap();

        let left = next_matching(&mut yvonne_rx, |e| matches!(e, ClientEvent::Left(_))).await;
        match left {
            Some(ClientEvent::Left(identity)) => assert_eq!(identity, "xavier"),
            other => panic!("Expected Left, got {:?}", other),
        }

        let online = next_matching(&mut yvonne_rx, |e| matches!(e, ClientEvent::Online(_))).await;
        match online {
            Some(ClientEvent::Online(identities)) => {
                assert_eq!(identities, vec!["yvonne"]);
            }
            other => panic!("Expected Online, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_typing_indicators_reach_others_only() {
        let dir = tempfile::tempdir().unwrap();
        let (_server, addr) = spawn_relay(ephemeral_config(&dir)).await.unwrap();

        let mut alice = client_for(addr);
        let mut alice_rx = alice.connect("alice").await.unwrap();

        let mut bob = client_for(addr);
        let mut bob_rx = bob.connect("bob").await.unwrap();

        // Both sides settled
        let _ = next_matching(&mut alice_rx, |e| matches!(e, ClientEvent::Joined(_))).await;

        alice.typing().unwrap();

        let typing = next_matching(&mut bob_rx, |e| matches!(e, ClientEvent::Typing(_))).await;
        match typing {
            Some(ClientEvent::Typing(identity)) => assert_eq!(identity, "alice"),
            other => panic!("Expected Typing, got {:?}", other),
        }

        // The originator does not hear itself typing
        assert_quiet(&mut alice_rx, |e| matches!(e, ClientEvent::Typing(_))).await;
    }
}
