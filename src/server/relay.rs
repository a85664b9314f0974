//! Chat relay server
//!
//! This module provides the main server that accepts connections, routes
//! session events through the durable log and presence tracker, and fans
//! accepted messages out to every connected session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use quinn::Endpoint;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};

use crate::current_timestamp;
use crate::error::{RelayError, Result};
use crate::protocol::messages::*;
use crate::server::presence::PresenceTracker;
use crate::server::recovery::ResumeCache;
use crate::server::session::{SessionCommand, SessionEvent, SessionHandler};
use crate::store::{AppendOutcome, MessageLog};

/// Server configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Durable log location
    pub db_path: PathBuf,
    /// Erase prior message history on startup (off by default)
    pub reset_log: bool,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Connection idle timeout
    pub idle_timeout: Duration,
    /// How long a disconnected session stays eligible for resumption
    pub resume_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4433".parse().unwrap(),
            db_path: PathBuf::from("relay.db"),
            reset_log: false,
            max_connections: 1024,
            idle_timeout: Duration::from_secs(300),
            resume_grace: Duration::from_secs(120),
        }
    }
}

/// Active session tracking
struct ActiveSession {
    /// Identity (set once the handshake completes)
    identity: Option<String>,
    /// Command channel to this session's writer
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    /// Remote address
    remote_addr: SocketAddr,
    /// Connection time
    connected_at: u64,
}

/// Chat relay server
pub struct RelayServer {
    /// Server configuration
    config: RelayConfig,
    /// QUIC endpoint
    endpoint: Option<Endpoint>,
    /// Durable message log
    log: Arc<MessageLog>,
    /// Online identities
    presence: Arc<PresenceTracker>,
    /// Parked sessions eligible for resumption
    resumes: Arc<ResumeCache>,
    /// Active sessions by session id
    sessions: Arc<RwLock<HashMap<String, ActiveSession>>>,
}

impl RelayServer {
    /// Create a new relay server.
    ///
    /// Opens the durable log; failure here is fatal and prevents startup.
    pub fn new(config: RelayConfig) -> Result<Self> {
        let log = Arc::new(MessageLog::open(&config.db_path, config.reset_log)?);
        let resumes = Arc::new(ResumeCache::new(config.resume_grace));

        Ok(Self {
            config,
            endpoint: None,
            log,
            presence: Arc::new(PresenceTracker::new()),
            resumes,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Get the durable log handle
    pub fn log(&self) -> Arc<MessageLog> {
        Arc::clone(&self.log)
    }

    /// Get the presence tracker
    pub fn presence(&self) -> Arc<PresenceTracker> {
        Arc::clone(&self.presence)
    }

    /// Address the endpoint is bound to (after `bind`)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().and_then(|e| e.local_addr().ok())
    }

    /// Bind the QUIC endpoint and return the local address.
    pub fn bind(&mut self) -> Result<SocketAddr> {
        info!("Starting relay server on {}", self.config.bind_addr);

        // Generate self-signed certificate for development
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| RelayError::config(format!("Failed to generate certificate: {}", e)))?;

        let cert_der = CertificateDer::from(cert.serialize_der().map_err(|e| {
            RelayError::config(format!("Failed to serialize certificate: {}", e))
        })?);
        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));

        // Configure rustls
        let mut server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| RelayError::config(format!("Failed to configure TLS: {}", e)))?;

        server_config.alpn_protocols = vec![b"relais".to_vec()];
        server_config.max_early_data_size = 0;

        // Configure QUIC
        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_concurrent_bidi_streams(8u32.into());
        transport_config.max_idle_timeout(Some(
            self.config
                .idle_timeout
                .try_into()
                .map_err(|_| RelayError::config("Idle timeout out of range"))?,
        ));
        transport_config.datagram_receive_buffer_size(Some(65536));

        let mut quic_server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_config)
                .map_err(|e| RelayError::config(format!("Failed to create QUIC config: {}", e)))?,
        ));
        quic_server_config.transport_config(Arc::new(transport_config));

        // Create endpoint
        let endpoint = Endpoint::server(quic_server_config, self.config.bind_addr)
            .map_err(|e| RelayError::network(format!("Failed to create endpoint: {}", e)))?;

        let local_addr = endpoint.local_addr()?;
        info!("Relay listening on {}", local_addr);

        self.endpoint = Some(endpoint);
        Ok(local_addr)
    }

    /// Accept connections until the endpoint closes. Call after `bind`.
    pub async fn serve(&self) -> Result<()> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| RelayError::internal("serve() called before bind()"))?;

        loop {
            match endpoint.accept().await {
                Some(incoming) => {
                    // Check connection limit
                    {
                        let sessions = self.sessions.read().await;
                        if sessions.len() >= self.config.max_connections {
                            warn!("Connection limit reached, rejecting connection");
                            incoming.refuse();
                            continue;
                        }
                    }

                    let server = self.clone_ref();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_incoming(incoming).await {
                            error!("Connection handling failed: {}", e);
                        }
                    });
                }
                None => {
                    warn!("Endpoint stopped accepting connections");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Bind and serve in one step
    pub async fn run(&mut self) -> Result<()> {
        self.bind()?;
        self.serve().await
    }

    /// Handle an incoming connection
    async fn handle_incoming(&self, incoming: quinn::Incoming) -> Result<()> {
        let connection = incoming.await?;
        let remote_addr = connection.remote_address();
        let session_id = uuid::Uuid::new_v4().to_string();

        debug!("New connection {} from {}", session_id, remote_addr);

        // Channels for this session
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        // Register before the handshake so broadcasts can reach the
        // session as soon as it becomes ready
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(
                session_id.clone(),
                ActiveSession {
                    identity: None,
                    command_tx: command_tx.clone(),
                    remote_addr,
                    connected_at: current_timestamp(),
                },
            );
        }

        let handler = Arc::new(SessionHandler::new(
            connection,
            session_id.clone(),
            Arc::clone(&self.log),
            Arc::clone(&self.resumes),
            event_tx,
            command_tx,
            command_rx,
        ));

        // Session task
        let handler_task = {
            let h = Arc::clone(&handler);
            tokio::spawn(async move { h.run().await })
        };

        // Event processor task
        let event_task = {
            let server = self.clone_ref();
            let sid = session_id.clone();
            tokio::spawn(async move {
                server.process_events(sid, event_rx).await;
            })
        };

        tokio::select! {
            result = handler_task => {
                if let Err(e) = result {
                    error!("Session task error: {}", e);
                }
            }
            _ = event_task => {}
        }

        self.cleanup_session(&session_id, &handler).await;

        Ok(())
    }

    /// Process events from one session
    async fn process_events(
        &self,
        session_id: String,
        mut event_rx: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        while let Some(event) = event_rx.recv().await {
            if let Err(e) = self.handle_event(&session_id, event).await {
                warn!("Event handling error for {}: {}", session_id, e);
            }
        }
    }

    /// Handle a single session event
    async fn handle_event(&self, session_id: &str, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Ready { identity, resumed } => {
                self.handle_ready(session_id, identity, resumed).await?;
            }

            SessionEvent::Chat { content, token } => {
                self.handle_chat(session_id, content, token).await?;
            }

            SessionEvent::Typing => {
                self.handle_typing(session_id, false).await?;
            }

            SessionEvent::StopTyping => {
                self.handle_typing(session_id, true).await?;
            }

            SessionEvent::Closed { reason } => {
                debug!("Session {} closed: {}", session_id, reason);
            }
        }

        Ok(())
    }

    /// A session finished its handshake
    async fn handle_ready(&self, session_id: &str, identity: String, resumed: bool) -> Result<()> {
        // Attach the identity to the registry entry
        {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(session_id) {
                session.identity = Some(identity.clone());
            }
        }

        info!(
            session_id = %session_id,
            identity = %identity,
            resumed,
            "Session joined"
        );

        // Membership only changes when the identity was previously offline
        let newly_online = self.presence.connect(&identity).await;
        if newly_online {
            self.broadcast_except(
                session_id,
                SessionCommand::Joined(UserJoined {
                    identity: identity.clone(),
                }),
            )
            .await;

            let snapshot = self.presence.snapshot().await;
            self.broadcast_all(SessionCommand::Online(OnlineUsers {
                identities: snapshot,
            }))
            .await;
        }

        Ok(())
    }

    /// A session sent a chat message
    async fn handle_chat(&self, session_id: &str, content: String, token: String) -> Result<()> {
        let sender = self.session_identity(session_id).await;

        match self.log.append(&sender, &content, &token) {
            Ok(AppendOutcome::Stored(offset)) => {
                // Acknowledge the sender, then fan out to every session
                // (sender included, so its UI picks up the assigned offset)
                self.send_to(
                    session_id,
                    SessionCommand::Ack(MessageAck {
                        token,
                        offset,
                    }),
                )
                .await;

                self.broadcast_all(SessionCommand::Deliver(ChatMessage {
                    offset,
                    sender,
                    content,
                }))
                .await;

                debug!(offset, "Message recorded and broadcast");
            }
            Ok(AppendOutcome::Duplicate(offset)) => {
                // Already recorded and already broadcast once; only the
                // retrying sender needs to hear back
                debug!(offset, "Duplicate token acknowledged");
                self.send_to(
                    session_id,
                    SessionCommand::Ack(MessageAck {
                        token,
                        offset,
                    }),
                )
                .await;
            }
            Err(e) => {
                // No ack: the client keeps the message and retries
                warn!("Append failed, client will retry: {}", e);
            }
        }

        Ok(())
    }

    /// Forward a typing indicator to everyone else
    async fn handle_typing(&self, session_id: &str, stopped: bool) -> Result<()> {
        let identity = self.session_identity(session_id).await;

        let cmd = if stopped {
            SessionCommand::StopTyping(StopTyping {
                identity: Some(identity),
            })
        } else {
            SessionCommand::Typing(Typing {
                identity: Some(identity),
            })
        };

        self.broadcast_except(session_id, cmd).await;
        Ok(())
    }

    /// Identity registered for a session, or the anonymous fallback
    async fn session_identity(&self, session_id: &str) -> String {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .and_then(|s| s.identity.clone())
            .unwrap_or_else(|| ANONYMOUS.to_string())
    }

    /// Send a command to a single session
    async fn send_to(&self, session_id: &str, cmd: SessionCommand) {
        let sessions = self.sessions.read().await;
        if let Some(session) = sessions.get(session_id) {
            let _ = session.command_tx.send(cmd);
        }
    }

    /// Send a command to every session
    async fn broadcast_all(&self, cmd: SessionCommand) {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            let _ = session.command_tx.send(cmd.clone());
        }
    }

    /// Send a command to every session except one
    async fn broadcast_except(&self, exclude: &str, cmd: SessionCommand) {
        let sessions = self.sessions.read().await;
        for (id, session) in sessions.iter() {
            if id == exclude {
                continue;
            }
            let _ = session.command_tx.send(cmd.clone());
        }
    }

    /// Clean up a finished session
    async fn cleanup_session(&self, session_id: &str, handler: &SessionHandler) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id)
        };

        let Some(removed) = removed else {
            return;
        };

        debug!(
            session_id = %session_id,
            remote_addr = %removed.remote_addr,
            uptime_ms = current_timestamp().saturating_sub(removed.connected_at),
            "Cleaned up connection"
        );

        // A session that never completed its handshake was invisible
        let Some(identity) = removed.identity else {
            return;
        };

        // Park delivery state so a quick reconnect can resume
        self.resumes
            .remember(session_id, &identity, handler.delivered())
            .await;

        let went_offline = self.presence.disconnect(&identity).await;
        if went_offline {
            self.broadcast_all(SessionCommand::Left(UserLeft {
                identity: identity.clone(),
            }))
            .await;

            let snapshot = self.presence.snapshot().await;
            self.broadcast_all(SessionCommand::Online(OnlineUsers {
                identities: snapshot,
            }))
            .await;
        }

        info!(session_id = %session_id, identity = %identity, "Session left");
    }

    /// Get server statistics
    pub async fn get_stats(&self) -> RelayStats {
        let sessions = self.sessions.read().await;
        let active_count = sessions.values().filter(|s| s.identity.is_some()).count();

        RelayStats {
            total_connections: sessions.len(),
            active_sessions: active_count,
            online_identities: self.presence.online_count().await,
            recorded_messages: self.log.len().unwrap_or(0),
            bind_address: self.config.bind_addr,
        }
    }

    /// Shutdown the server
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(endpoint) = self.endpoint.take() {
            // Close all sessions
            let sessions = self.sessions.read().await;
            for session in sessions.values() {
                let _ = session
                    .command_tx
                    .send(SessionCommand::Close("Server shutdown".to_string()));
            }

            endpoint.close(0u32.into(), b"Server shutdown");
            info!("Relay shutdown complete");
        }
        Ok(())
    }

    /// Clone reference for spawning tasks
    fn clone_ref(&self) -> Arc<Self> {
        Arc::new(Self {
            config: self.config.clone(),
            endpoint: self.endpoint.clone(),
            log: Arc::clone(&self.log),
            presence: Arc::clone(&self.presence),
            resumes: Arc::clone(&self.resumes),
            sessions: Arc::clone(&self.sessions),
        })
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct RelayStats {
    pub total_connections: usize,
    pub active_sessions: usize,
    pub online_identities: usize,
    pub recorded_messages: u64,
    pub bind_address: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> RelayConfig {
        RelayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            db_path: dir.path().join("relay.db"),
            ..Default::default()
        }
    }

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr.port(), 4433);
        assert!(!config.reset_log);
        assert_eq!(config.max_connections, 1024);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let dir = tempfile::tempdir().unwrap();
        let server = RelayServer::new(test_config(&dir)).unwrap();
        assert!(server.endpoint.is_none());
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_server_stats() {
        let dir = tempfile::tempdir().unwrap();
        let server = RelayServer::new(test_config(&dir)).unwrap();

        let stats = server.get_stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.online_identities, 0);
        assert_eq!(stats.recorded_messages, 0);
    }

    #[tokio::test]
    async fn test_bind_assigns_ephemeral_port() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = RelayServer::new(test_config(&dir)).unwrap();

        let addr = server.bind().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
    }
}
