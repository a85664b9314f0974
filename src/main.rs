//! Relais - durable QUIC chat relay
//!
//! Clients connect over QUIC, send messages, and receive the live
//! broadcast. Every message is recorded exactly once; reconnecting
//! clients are replayed exactly what they missed.
//!
//! Usage:
//!   cargo run -- server                    # Run the relay
//!   cargo run -- server --port 4433        # Run on a specific port

use std::env;
use std::path::PathBuf;

use relais::RelayConfig;
use relais::RelayServer;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "server" => {
            run_server(&args).await?;
        }
        "help" | "--help" | "-h" => {
            print_usage();
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage();
            return Ok(());
        }
    }

    Ok(())
}

fn print_usage() {
    println!("Relais - Durable QUIC Chat Relay");
    println!();
    println!("USAGE:");
    println!("    cargo run -- server [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    server              Start the chat relay");
    println!("    help                Show this help message");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>       Port to listen on (default: 4433)");
    println!("    --db <PATH>         Message log location (default: relay.db)");
    println!("    --reset             Erase prior message history on startup");
    println!("    --max-conn <NUM>    Maximum connections (default: 1024)");
    println!();
    println!("DELIVERY GUARANTEES:");
    println!("    Every message carries a client-generated token; the relay records");
    println!("    each token exactly once, so client retries never duplicate a");
    println!("    message. A reconnecting client presents the highest offset it has");
    println!("    seen and is replayed exactly the messages after it, in order.");
    println!();
    println!("EXAMPLES:");
    println!("    cargo run -- server");
    println!("    cargo run -- server --port 5000 --db /var/lib/relais/relay.db");
    println!("    RUST_LOG=debug cargo run -- server --reset");
}

fn parse_port(args: &[String]) -> u16 {
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            if let Ok(port) = args[i + 1].parse() {
                return port;
            }
        }
    }
    4433 // default port
}

fn parse_db_path(args: &[String]) -> PathBuf {
    for i in 0..args.len() {
        if args[i] == "--db" && i + 1 < args.len() {
            return PathBuf::from(&args[i + 1]);
        }
    }
    PathBuf::from("relay.db")
}

fn parse_max_connections(args: &[String]) -> usize {
    for i in 0..args.len() {
        if args[i] == "--max-conn" && i + 1 < args.len() {
            if let Ok(max) = args[i + 1].parse() {
                return max;
            }
        }
    }
    1024 // default
}

async fn run_server(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let config = RelayConfig {
        bind_addr: format!("0.0.0.0:{}", parse_port(args)).parse()?,
        db_path: parse_db_path(args),
        reset_log: args.iter().any(|a| a == "--reset"),
        max_connections: parse_max_connections(args),
        ..Default::default()
    };

    info!("Configuration:");
    info!("  - Bind address: {}", config.bind_addr);
    info!("  - Message log: {}", config.db_path.display());
    info!("  - Reset log: {}", config.reset_log);
    info!("  - Max connections: {}", config.max_connections);

    // A store that cannot be opened prevents startup entirely
    let mut server = RelayServer::new(config)?;

    let shutdown = tokio::signal::ctrl_c();

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                return Err(e.into());
            }
        }
        _ = shutdown => {
            info!("Shutdown signal received");
            server.shutdown().await?;
        }
    }

    Ok(())
}
