//! Basic Usage Example for the Relais Chat Relay
//!
//! This example demonstrates the durable message log, the presence
//! tracker, and how to configure and start the relay.
//!
//! Run with: cargo run --example basic_usage

use relais::server::{PresenceTracker, RelayConfig, RelayServer};
use relais::store::{AppendOutcome, MessageLog};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Relais Chat Relay - Basic Usage Example");
    info!("=======================================");

    // Example 1: the exactly-once message log
    example_message_log()?;

    // Example 2: presence tracking
    example_presence().await;

    // Example 3: server configuration
    example_config().await?;

    info!("Examples completed!");
    Ok(())
}

/// Example 1: appends, duplicate detection, and replay reads
fn example_message_log() -> Result<(), Box<dyn std::error::Error>> {
    info!("\n--- Example 1: Durable Message Log ---");

    let log = MessageLog::open_in_memory()?;

    // Each append gets the next offset
    let first = log.append("alice", "hello", "token-1")?;
    let second = log.append("bob", "hi alice", "token-2")?;
    info!("First append:  {:?}", first);
    info!("Second append: {:?}", second);

    // Retrying a token changes nothing; the original offset comes back
    let retry = log.append("alice", "hello", "token-1")?;
    match retry {
        AppendOutcome::Duplicate(offset) => {
            info!("Retry detected, already recorded at offset {}", offset);
        }
        AppendOutcome::Stored(_) => unreachable!("retries never create rows"),
    }

    // A reconnecting client that saw offset 1 replays everything after it
    let missed = log.read_after(1, 100)?;
    info!("Messages after offset 1:");
    for msg in &missed {
        info!("  [{}] {}: {}", msg.offset, msg.sender, msg.content);
    }

    info!("Head offset: {}", log.head_offset()?);
    Ok(())
}

/// Example 2: presence with per-identity session counting
async fn example_presence() {
    info!("\n--- Example 2: Presence Tracking ---");

    let presence = PresenceTracker::new();

    presence.connect("alice").await;
    presence.connect("bob").await;

    // A second session under the same name does not change the set
    let changed = presence.connect("alice").await;
    info!("Second 'alice' session changed the set: {}", changed);

    info!("Online: {:?}", presence.snapshot().await);

    // Closing one of alice's sessions keeps her online
    presence.disconnect("alice").await;
    info!(
        "After one disconnect, alice online: {}",
        presence.is_online("alice").await
    );

    presence.disconnect("alice").await;
    presence.disconnect("bob").await;
    info!("After all disconnects: {:?}", presence.snapshot().await);
}

/// Example 3: configuring and creating the relay
async fn example_config() -> Result<(), Box<dyn std::error::Error>> {
    info!("\n--- Example 3: Server Configuration ---");

    let config = RelayConfig {
        bind_addr: "127.0.0.1:0".parse()?,
        db_path: std::env::temp_dir().join("relais-example.db"),
        reset_log: true,
        max_connections: 100,
        ..Default::default()
    };

    info!("Configuration:");
    info!("  Bind address: {}", config.bind_addr);
    info!("  Message log: {}", config.db_path.display());
    info!("  Reset log: {}", config.reset_log);
    info!("  Max connections: {}", config.max_connections);
    info!("  Resume grace: {:?}", config.resume_grace);

    // Create the relay (but don't start serving in this example)
    let server = RelayServer::new(config)?;
    let stats = server.get_stats().await;

    info!("Relay created:");
    info!("  Total connections: {}", stats.total_connections);
    info!("  Recorded messages: {}", stats.recorded_messages);

    Ok(())
}

/// To actually run the relay, use this function
#[allow(dead_code)]
async fn run_relay() -> Result<(), Box<dyn std::error::Error>> {
    let config = RelayConfig::default();
    let mut server = RelayServer::new(config)?;

    info!("Starting relay...");
    info!("Press Ctrl+C to stop");

    let shutdown = tokio::signal::ctrl_c();

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                warn!("Relay error: {}", e);
            }
        }
        _ = shutdown => {
            info!("Shutdown signal received");
            server.shutdown().await?;
        }
    }

    Ok(())
}
