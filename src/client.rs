//! Chat relay client
//!
//! This module provides a client for connecting to the relay, sending
//! messages with exactly-once tokens, and receiving the live broadcast.
//! The client remembers its session id and the highest offset it has
//! seen, so reconnecting picks up exactly the missed messages (or resumes
//! without replay when the server kept its delivery state).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use quinn::{ClientConfig as QuinnClientConfig, Connection, Endpoint, RecvStream, SendStream};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::generate_token;
use crate::protocol::codec::{Encodable, WireEvent};
use crate::protocol::frame::{Frame, FrameCodec};
use crate::protocol::messages::*;

/// Relay client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Server address to connect to
    pub server_addr: std::net::SocketAddr,
    /// Client bind address (use 0.0.0.0:0 for auto)
    pub bind_addr: std::net::SocketAddr,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:4433".parse().unwrap(),
            bind_addr: "0.0.0.0:0".parse().unwrap(),
            connect_timeout_secs: 10,
        }
    }
}

/// Events that the client can receive
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Handshake completed
    Connected { resumed: bool, head_offset: Offset },
    /// A chat message arrived (live or replayed)
    Message(ChatMessage),
    /// A sent message was recorded
    Acked(MessageAck),
    /// Someone came online
    Joined(String),
    /// Someone went offline
    Left(String),
    /// Online identities snapshot
    Online(Vec<String>),
    /// Someone is typing
    Typing(String),
    /// Someone stopped typing
    StopTyping(String),
    /// The server reported an error
    Error(RelayError),
    /// Disconnected from the server
    Disconnected(String),
}

/// Chat relay client
pub struct RelayClient {
    config: ClientConfig,
    identity: Option<String>,
    connection: Option<Connection>,
    endpoint: Option<Endpoint>,
    control_send: Option<Arc<Mutex<SendStream>>>,
    /// Session id from the last handshake, presented for resumption
    session_id: Option<String>,
    /// Highest offset seen, the recovery watermark for reconnects
    last_seen: Arc<AtomicU64>,
}

impl RelayClient {
    /// Create a new relay client with the given configuration
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            identity: None,
            connection: None,
            endpoint: None,
            control_send: None,
            session_id: None,
            last_seen: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Connect to the relay with the given identity.
    ///
    /// On a reconnect the client presents its previous session id and the
    /// highest offset it has seen; the server either resumes the session
    /// or replays the missed messages.
    pub async fn connect(&mut self, identity: &str) -> Result<mpsc::UnboundedReceiver<ClientEvent>> {
        info!("Connecting to relay at {}", self.config.server_addr);

        self.identity = Some(identity.to_string());

        let client_config = self.configure_client()?;

        let mut endpoint = Endpoint::client(self.config.bind_addr)
            .map_err(|e| RelayError::network(format!("Failed to create endpoint: {}", e)))?;
        endpoint.set_default_client_config(client_config);
        self.endpoint = Some(endpoint.clone());

        let connecting = endpoint
            .connect(self.config.server_addr, "localhost")
            .map_err(|e| RelayError::connection(format!("Failed to initiate connection: {}", e)))?;

        let connection = tokio::time::timeout(
            std::time::Duration::from_secs(self.config.connect_timeout_secs),
            connecting,
        )
        .await
        .map_err(|_| RelayError::timeout("Connection timeout"))?
        .map_err(|e| RelayError::connection(format!("Failed to connect: {}", e)))?;

        self.connection = Some(connection.clone());

        // Open the control stream and introduce ourselves
        let (send, recv) = connection.open_bi().await?;
        let send = Arc::new(Mutex::new(send));
        self.control_send = Some(Arc::clone(&send));

        let hello = Hello {
            identity: Some(identity.to_string()),
            last_seen_offset: self.last_seen.load(Ordering::Acquire),
            resume: self.session_id.clone(),
        };
        Self::write_frame(&send, &hello).await?;

        // The HelloAck comes first on the control stream; whatever is
        // buffered behind it (replay, presence) goes to the reader task
        let (ack, codec, recv) = Self::await_hello_ack(recv).await?;
        self.session_id = Some(ack.session_id.clone());

        info!(
            identity = %ack.identity,
            resumed = ack.resumed,
            head_offset = ack.head_offset,
            "Connected to relay"
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(ClientEvent::Connected {
            resumed: ack.resumed,
            head_offset: ack.head_offset,
        });

        // Control stream reader
        {
            let event_tx = event_tx.clone();
            let last_seen = Arc::clone(&self.last_seen);
            let send = Arc::clone(&send);
            tokio::spawn(async move {
                Self::read_control_stream(recv, codec, send, event_tx, last_seen).await;
            });
        }

        // Datagram reader (typing indicators)
        {
            let event_tx = event_tx.clone();
            let connection = connection.clone();
            tokio::spawn(async move {
                Self::read_datagrams(connection, event_tx).await;
            });
        }

        Ok(event_rx)
    }

    /// Configure the QUIC client
    fn configure_client(&self) -> Result<QuinnClientConfig> {
        // Accept the server's self-signed development certificate.
        // WARNING: insecure, development/testing only.
        let mut crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth();

        crypto.alpn_protocols = vec![b"relais".to_vec()];

        Ok(QuinnClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| RelayError::config(format!("Failed to create QUIC config: {}", e)))?,
        )))
    }

    /// Read frames until the HelloAck arrives
    async fn await_hello_ack(
        mut recv: RecvStream,
    ) -> Result<(HelloAck, FrameCodec, RecvStream)> {
        let mut codec = FrameCodec::new();
        let mut buf = vec![0u8; 4096];

        loop {
            if let Some(frame) = codec
                .decode_next()
                .map_err(|e| RelayError::protocol(format!("Frame decode error: {}", e)))?
            {
                return match WireEvent::decode(&frame) {
                    Ok(WireEvent::HelloAck(ack)) => Ok((ack, codec, recv)),
                    Ok(WireEvent::Error(err)) => {
                        Err(RelayError::handshake(format!(
                            "Server rejected handshake ({}): {}",
                            err.code, err.message
                        )))
                    }
                    Ok(other) => Err(RelayError::protocol(format!(
                        "Expected HelloAck, got {:?}",
                        other.frame_type()
                    ))),
                    Err(e) => Err(RelayError::protocol(format!("Invalid HelloAck: {}", e))),
                };
            }

            match recv.read(&mut buf).await {
                Ok(Some(n)) => codec.feed(&buf[..n]),
                Ok(None) => {
                    return Err(RelayError::connection("Stream closed during handshake"));
                }
                Err(e) => {
                    return Err(RelayError::network(format!("Handshake read error: {}", e)));
                }
            }
        }
    }

    /// Control stream reader: frames in, client events out
    async fn read_control_stream(
        mut recv: RecvStream,
        mut codec: FrameCodec,
        send: Arc<Mutex<SendStream>>,
        event_tx: mpsc::UnboundedSender<ClientEvent>,
        last_seen: Arc<AtomicU64>,
    ) {
        let mut buf = vec![0u8; 4096];

        loop {
            // Drain everything buffered before reading more
            loop {
                let frame = match codec.decode_next() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        let _ =
                            event_tx.send(ClientEvent::Disconnected(format!("Bad frame: {}", e)));
                        return;
                    }
                };

                Self::dispatch_frame(frame, &send, &event_tx, &last_seen).await;
            }

            match recv.read(&mut buf).await {
                Ok(Some(n)) => codec.feed(&buf[..n]),
                Ok(None) => {
                    let _ = event_tx.send(ClientEvent::Disconnected("Stream closed".to_string()));
                    return;
                }
                Err(e) => {
                    let _ =
                        event_tx.send(ClientEvent::Disconnected(format!("Connection lost: {}", e)));
                    return;
                }
            }
        }
    }

    /// Translate one server frame into a client event
    async fn dispatch_frame(
        frame: Frame,
        send: &Arc<Mutex<SendStream>>,
        event_tx: &mpsc::UnboundedSender<ClientEvent>,
        last_seen: &Arc<AtomicU64>,
    ) {
        match WireEvent::decode(&frame) {
            Ok(WireEvent::ChatMessage(msg)) => {
                // Replay and live delivery both advance the watermark
                last_seen.fetch_max(msg.offset, Ordering::AcqRel);
                let _ = event_tx.send(ClientEvent::Message(msg));
            }
            Ok(WireEvent::MessageAck(ack)) => {
                let _ = event_tx.send(ClientEvent::Acked(ack));
            }
            Ok(WireEvent::UserJoined(msg)) => {
                let _ = event_tx.send(ClientEvent::Joined(msg.identity));
            }
            Ok(WireEvent::UserLeft(msg)) => {
                let _ = event_tx.send(ClientEvent::Left(msg.identity));
            }
            Ok(WireEvent::OnlineUsers(msg)) => {
                let _ = event_tx.send(ClientEvent::Online(msg.identities));
            }
            Ok(WireEvent::Ping(ping)) => {
                // Keepalive: echo the timestamp back
                let pong = Pong {
                    timestamp: ping.timestamp,
                };
                if let Err(e) = Self::write_frame(send, &pong).await {
                    debug!("Failed to answer ping: {}", e);
                }
            }
            Ok(WireEvent::Pong(_)) => {}
            Ok(WireEvent::Error(err)) => {
                let _ = event_tx.send(ClientEvent::Error(RelayError::protocol(format!(
                    "Server error {}: {}",
                    err.code, err.message
                ))));
            }
            Ok(other) => {
                warn!("Unexpected frame from server: {:?}", other.frame_type());
            }
            Err(e) => {
                warn!("Failed to decode server frame: {}", e);
            }
        }
    }

    /// Datagram reader (typing indicators)
    async fn read_datagrams(connection: Connection, event_tx: mpsc::UnboundedSender<ClientEvent>) {
        loop {
            match connection.read_datagram().await {
                Ok(data) => {
                    let Ok(frame) = Frame::decode_complete(&data) else {
                        continue;
                    };
                    match WireEvent::decode(&frame) {
                        Ok(WireEvent::Typing(t)) => {
                            let _ =
                                event_tx.send(ClientEvent::Typing(t.identity.unwrap_or_default()));
                        }
                        Ok(WireEvent::StopTyping(t)) => {
                            let _ = event_tx
                                .send(ClientEvent::StopTyping(t.identity.unwrap_or_default()));
                        }
                        _ => {}
                    }
                }
                Err(e) => {
                    debug!("Datagram receive ended: {}", e);
                    break;
                }
            }
        }
    }

    /// Send a chat message with a fresh token, returning the token.
    ///
    /// Until the matching [`ClientEvent::Acked`] arrives, the message may
    /// or may not be recorded; retry with [`Self::send_message_with_token`]
    /// and the same token, and the relay records it at most once.
    pub async fn send_message(&self, content: &str) -> Result<String> {
        let token = generate_token();
        self.send_message_with_token(content, &token).await?;
        Ok(token)
    }

    /// Send a chat message under a caller-chosen token (retries)
    pub async fn send_message_with_token(&self, content: &str, token: &str) -> Result<()> {
        let send = self
            .control_send
            .as_ref()
            .ok_or_else(|| RelayError::connection("Not connected to relay"))?;

        let msg = SendMessage {
            content: content.to_string(),
            token: token.to_string(),
        };
        Self::write_frame(send, &msg).await?;

        debug!(token = %token, "Sent message");
        Ok(())
    }

    /// Tell the relay we started typing
    pub fn typing(&self) -> Result<()> {
        self.send_typing_datagram(true)
    }

    /// Tell the relay we stopped typing
    pub fn stop_typing(&self) -> Result<()> {
        self.send_typing_datagram(false)
    }

    fn send_typing_datagram(&self, start: bool) -> Result<()> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| RelayError::connection("Not connected to relay"))?;

        let frame = if start {
            Typing { identity: None }.encode_frame()
        } else {
            StopTyping { identity: None }.encode_frame()
        }
        .map_err(|e| RelayError::serialization(format!("Failed to encode frame: {}", e)))?;

        connection
            .send_datagram(frame.encode_to_bytes())
            .map_err(|e| RelayError::network(format!("Failed to send datagram: {}", e)))?;

        Ok(())
    }

    /// Write a frame to the control stream
    async fn write_frame<T: Encodable>(send: &Arc<Mutex<SendStream>>, msg: &T) -> Result<()> {
        let frame = msg
            .encode_frame()
            .map_err(|e| RelayError::serialization(format!("Failed to encode frame: {}", e)))?;

        let data = frame.encode_to_bytes();
        let mut stream = send.lock().await;
        stream.write_all(&data).await?;
        Ok(())
    }

    /// Disconnect from the relay.
    ///
    /// The session id and watermark are kept, so a later `connect` presents
    /// them for resumption or replay.
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.take() {
            connection.close(0u32.into(), b"Client disconnect");
            info!("Disconnected from relay");
        }

        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close(0u32.into(), b"Client shutdown");
        }

        self.control_send = None;
        Ok(())
    }

    /// Get the identity used for the current connection
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Session id assigned by the server, if connected at least once
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Highest message offset this client has seen
    pub fn last_seen_offset(&self) -> Offset {
        self.last_seen.load(Ordering::Acquire)
    }

    /// Check if connected to the relay
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

/// Certificate verifier that accepts any certificate (INSECURE - for development only)
#[derive(Debug)]
struct AcceptAnyCertificate;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
