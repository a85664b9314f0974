//! Per-connection session handling
//!
//! Each connection gets one [`SessionHandler`] that owns the protocol
//! handshake, inbound event dispatch, and the outbound writer. The writer
//! is the only thing that sends chat messages to the client, and it owns
//! the session's delivery watermark: replay after (re)connection, duplicate
//! suppression, and gap backfill all reduce to comparing an incoming offset
//! against that watermark and paging the durable log when behind.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use quinn::{Connection, RecvStream, SendStream};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::current_timestamp;
use crate::error::{RelayError, Result};
use crate::protocol::codec::{Decodable, Encodable};
use crate::protocol::frame::{Frame, FrameCodec, FrameType};
use crate::protocol::messages::*;
use crate::server::recovery::{ResumeCache, plan_recovery};
use crate::store::MessageLog;

/// Messages replayed per log read during catch-up
const REPLAY_BATCH: usize = 256;

/// Keepalive ping interval
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Longest accepted display name
const MAX_IDENTITY_LEN: usize = 64;

/// Events emitted by a session to the relay
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake completed; the session is live
    Ready { identity: String, resumed: bool },

    /// Client sent a chat message
    Chat { content: String, token: String },

    /// Client started typing
    Typing,

    /// Client stopped typing
    StopTyping,

    /// Session ended
    Closed { reason: String },
}

/// Commands the relay (or the session itself) sends to the writer
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Seed the delivery watermark and reconcile against the log
    StartDelivery { from: Offset },

    /// Deliver a live chat message (deduplicated against the watermark)
    Deliver(ChatMessage),

    /// Acknowledge a SendMessage to this client
    Ack(MessageAck),

    /// Someone joined
    Joined(UserJoined),

    /// Someone left
    Left(UserLeft),

    /// Online identities snapshot
    Online(OnlineUsers),

    /// Typing indicator (datagram)
    Typing(Typing),

    /// Stop-typing indicator (datagram)
    StopTyping(StopTyping),

    /// Close the connection
    Close(String),
}

/// State of the connection handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Waiting for Hello from the client
    AwaitingHello,
    /// Handshake done, session live
    Active,
}

/// What the writer should do with an incoming live message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryAction {
    /// Already delivered (at or below the watermark)
    Skip,
    /// Next in line, send directly
    Send,
    /// Offsets are missing in between, backfill from the log first
    Backfill,
}

/// Classify a live message offset against the delivery watermark
fn classify_delivery(delivered: Offset, incoming: Offset) -> DeliveryAction {
    if incoming <= delivered {
        DeliveryAction::Skip
    } else if incoming == delivered + 1 {
        DeliveryAction::Send
    } else {
        DeliveryAction::Backfill
    }
}

/// Per-connection handler owning handshake, dispatch, and delivery
pub struct SessionHandler {
    /// Underlying QUIC connection
    connection: Connection,

    /// Session id, also the resume token handed to the client
    session_id: String,

    /// Identity (set once the handshake completes)
    identity: RwLock<Option<String>>,

    /// Handshake state
    state: RwLock<HandshakeState>,

    /// Durable log, for replay and backfill reads
    log: Arc<MessageLog>,

    /// Parked sessions eligible for resumption
    resumes: Arc<ResumeCache>,

    /// Channel for sending events to the relay
    event_tx: mpsc::UnboundedSender<SessionEvent>,

    /// Channel for queueing commands to our own writer
    command_tx: mpsc::UnboundedSender<SessionCommand>,

    /// Command receiver, taken by the writer task
    command_rx: RwLock<Option<mpsc::UnboundedReceiver<SessionCommand>>>,

    /// Control stream sender
    control_send: RwLock<Option<SendStream>>,

    /// Highest offset delivered to this client
    delivered: AtomicU64,
}

impl SessionHandler {
    /// Create a new session handler
    pub fn new(
        connection: Connection,
        session_id: String,
        log: Arc<MessageLog>,
        resumes: Arc<ResumeCache>,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
        command_tx: mpsc::UnboundedSender<SessionCommand>,
        command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Self {
        Self {
            connection,
            session_id,
            identity: RwLock::new(None),
            state: RwLock::new(HandshakeState::AwaitingHello),
            log,
            resumes,
            event_tx,
            command_tx,
            command_rx: RwLock::new(Some(command_rx)),
            control_send: RwLock::new(None),
            delivered: AtomicU64::new(0),
        }
    }

    /// Get the remote address
    pub fn remote_address(&self) -> std::net::SocketAddr {
        self.connection.remote_address()
    }

    /// Session id / resume token
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Identity, once the handshake completed
    pub async fn identity(&self) -> Option<String> {
        self.identity.read().await.clone()
    }

    /// Highest offset delivered to this client so far
    pub fn delivered(&self) -> Offset {
        self.delivered.load(Ordering::Acquire)
    }

    /// Check whether the handshake completed
    pub async fn is_active(&self) -> bool {
        *self.state.read().await == HandshakeState::Active
    }

    /// Run the session. This is the main entry point, spawned as a task.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = self.remote_address();
        debug!(session_id = %self.session_id, %addr, "New connection");

        let result = self.accept_and_run(Arc::clone(&self)).await;

        let reason = match &result {
            Ok(()) => "normal".to_string(),
            Err(e) => e.to_string(),
        };
        let _ = self.event_tx.send(SessionEvent::Closed { reason });

        debug!(session_id = %self.session_id, %addr, "Connection closed");
        result
    }

    /// Accept the control stream and run all session tasks
    async fn accept_and_run(self: &Arc<Self>, handler: Arc<Self>) -> Result<()> {
        // The client opens the control stream right after connecting
        let (send, recv) = self.connection.accept_bi().await.map_err(|e| {
            RelayError::connection(format!("Failed to accept control stream: {}", e))
        })?;

        {
            let mut control = self.control_send.write().await;
            *control = Some(send);
        }

        // Control stream reader
        let recv_handle = {
            let h = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = h.handle_control_stream(recv).await {
                    debug!("Control stream ended: {}", e);
                }
            })
        };

        // Outbound writer
        let write_handle = {
            let h = Arc::clone(&handler);
            tokio::spawn(async move {
                h.handle_commands().await;
            })
        };

        // Datagram receiver (typing indicators)
        let dgram_handle = {
            let h = Arc::clone(&handler);
            tokio::spawn(async move {
                h.handle_datagrams().await;
            })
        };

        // Keepalive
        let ping_handle = {
            let h = Arc::clone(&handler);
            tokio::spawn(async move {
                h.ping_loop().await;
            })
        };

        // Any task finishing means the session is over
        tokio::select! {
            _ = recv_handle => {},
            _ = write_handle => {},
            _ = dgram_handle => {},
            _ = ping_handle => {},
        }

        Ok(())
    }

    /// Read frames off the control stream and dispatch them
    async fn handle_control_stream(self: &Arc<Self>, mut recv: RecvStream) -> Result<()> {
        let mut codec = FrameCodec::new();
        let mut buf = vec![0u8; 4096];

        loop {
            match recv.read(&mut buf).await {
                Ok(Some(n)) => {
                    codec.feed(&buf[..n]);

                    loop {
                        match codec.decode_next() {
                            Ok(Some(frame)) => {
                                // Bad payloads are answered, not fatal
                                if let Err(e) = self.handle_control_frame(frame).await {
                                    warn!(session_id = %self.session_id, "Dropped frame: {}", e);
                                    self.send_error(e).await?;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                return Err(RelayError::protocol(format!(
                                    "Frame decode error: {}",
                                    e
                                )));
                            }
                        }
                    }
                }
                Ok(None) => {
                    debug!("Control stream finished");
                    break;
                }
                Err(e) => {
                    return Err(RelayError::network(format!(
                        "Control stream read error: {}",
                        e
                    )));
                }
            }
        }

        Ok(())
    }

    /// Handle a single control frame
    async fn handle_control_frame(&self, frame: Frame) -> Result<()> {
        let state = *self.state.read().await;

        match (state, frame.frame_type) {
            (HandshakeState::AwaitingHello, FrameType::Hello) => {
                let hello = Hello::decode_frame(&frame)
                    .map_err(|e| RelayError::handshake(format!("Invalid Hello: {}", e)))?;
                self.handle_hello(hello).await?;
            }

            (HandshakeState::Active, FrameType::SendMessage) => {
                let msg = SendMessage::decode_frame(&frame)
                    .map_err(|e| RelayError::protocol(format!("Invalid SendMessage: {}", e)))?;

                if msg.token.is_empty() {
                    return Err(RelayError::protocol("SendMessage without token"));
                }

                let _ = self.event_tx.send(SessionEvent::Chat {
                    content: msg.content,
                    token: msg.token,
                });
            }

            (HandshakeState::Active, FrameType::Ping) => {
                let ping = Ping::decode_frame(&frame)
                    .map_err(|e| RelayError::protocol(format!("Invalid Ping: {}", e)))?;

                let pong = Pong {
                    timestamp: ping.timestamp,
                };
                self.send_control_frame(&pong).await?;
            }

            (HandshakeState::Active, FrameType::Pong) => {
                // RTT bookkeeping only
                let _ = Pong::decode_frame(&frame);
            }

            (_, FrameType::Goodbye) => {
                let goodbye = Goodbye::decode_frame(&frame)
                    .map_err(|e| RelayError::protocol(format!("Invalid Goodbye: {}", e)))?;

                info!(session_id = %self.session_id, "Client sent Goodbye: {}", goodbye.reason);
                self.connection.close(0u32.into(), goodbye.reason.as_bytes());
            }

            (state, frame_type) => {
                return Err(RelayError::protocol(format!(
                    "Unexpected frame {:?} in state {:?}",
                    frame_type, state
                )));
            }
        }

        Ok(())
    }

    /// Complete the handshake: resolve identity, plan recovery, go live
    async fn handle_hello(&self, hello: Hello) -> Result<()> {
        let identity = resolve_identity(hello.identity.as_deref())?;

        // A resume token is only as good as the state parked behind it
        let entry = match &hello.resume {
            Some(token) => self.resumes.claim(token).await,
            None => None,
        };

        let (head, entry) = match self.log.head_offset() {
            Ok(head) => (head, entry),
            Err(e) => {
                // Degrade: no resumption, replay from the client's claim
                warn!(session_id = %self.session_id, "Head lookup failed: {}", e);
                (0, None)
            }
        };

        let plan = plan_recovery(entry.as_ref(), hello.last_seen_offset, head);

        {
            let mut id = self.identity.write().await;
            *id = Some(identity.clone());
        }
        *self.state.write().await = HandshakeState::Active;

        let ack = HelloAck {
            session_id: self.session_id.clone(),
            identity: identity.clone(),
            resumed: plan.is_resumed(),
            head_offset: head,
        };
        self.send_control_frame(&ack).await?;

        // Prime our writer; anything broadcast before this is dropped by
        // the writer and covered by the priming reconcile
        let _ = self.command_tx.send(SessionCommand::StartDelivery {
            from: plan.from_offset(),
        });

        let _ = self.event_tx.send(SessionEvent::Ready {
            identity: identity.clone(),
            resumed: plan.is_resumed(),
        });

        info!(
            session_id = %self.session_id,
            identity = %identity,
            resumed = plan.is_resumed(),
            from = plan.from_offset(),
            "Session active"
        );
        Ok(())
    }

    /// Handle incoming datagrams (typing indicators)
    async fn handle_datagrams(self: &Arc<Self>) {
        loop {
            match self.connection.read_datagram().await {
                Ok(data) => {
                    if let Err(e) = self.handle_datagram(data).await {
                        warn!(session_id = %self.session_id, "Datagram dropped: {}", e);
                    }
                }
                Err(e) => {
                    debug!("Datagram receive ended: {}", e);
                    break;
                }
            }
        }
    }

    /// Handle a single datagram
    async fn handle_datagram(&self, data: Bytes) -> Result<()> {
        if !self.is_active().await {
            return Ok(()); // Silently ignore datagrams before the handshake
        }

        let frame = Frame::decode_complete(&data)
            .map_err(|e| RelayError::protocol(format!("Invalid datagram frame: {}", e)))?;

        match frame.frame_type {
            FrameType::Typing => {
                let _ = Typing::decode_frame(&frame)
                    .map_err(|e| RelayError::protocol(format!("Invalid Typing: {}", e)))?;
                let _ = self.event_tx.send(SessionEvent::Typing);
            }

            FrameType::StopTyping => {
                let _ = StopTyping::decode_frame(&frame)
                    .map_err(|e| RelayError::protocol(format!("Invalid StopTyping: {}", e)))?;
                let _ = self.event_tx.send(SessionEvent::StopTyping);
            }

            _ => {
                warn!("Unexpected datagram frame type: {:?}", frame.frame_type);
            }
        }

        Ok(())
    }

    /// Outbound writer: drains the command queue and owns the watermark
    async fn handle_commands(self: &Arc<Self>) {
        let rx = self.command_rx.write().await.take();
        let Some(mut rx) = rx else { return };

        // Nothing reaches the client before the handshake seeds delivery:
        // the HelloAck must be the first frame the client sees, and any
        // broadcast dropped here is recovered by the seed-time reconcile.
        let mut primed = false;

        while let Some(cmd) = rx.recv().await {
            let result = match cmd {
                SessionCommand::StartDelivery { from } => {
                    primed = true;
                    self.delivered.store(from, Ordering::Release);
                    // Replays the missed backlog; a single empty read when
                    // nothing was missed
                    self.catch_up().await
                }
                SessionCommand::Close(reason) => {
                    self.connection.close(0u32.into(), reason.as_bytes());
                    Ok(())
                }
                _ if !primed => Ok(()),
                other => self.handle_command(other).await,
            };

            if let Err(e) = result {
                warn!(session_id = %self.session_id, "Writer stopped: {}", e);
                break;
            }
        }
    }

    /// Handle a single post-handshake command
    async fn handle_command(&self, cmd: SessionCommand) -> Result<()> {
        match cmd {
            // Handled by the writer loop itself
            SessionCommand::StartDelivery { .. } | SessionCommand::Close(_) => {}

            SessionCommand::Deliver(msg) => {
                self.deliver(msg).await?;
            }

            SessionCommand::Ack(ack) => {
                self.send_control_frame(&ack).await?;
            }

            SessionCommand::Joined(msg) => {
                self.send_control_frame(&msg).await?;
            }

            SessionCommand::Left(msg) => {
                self.send_control_frame(&msg).await?;
            }

            SessionCommand::Online(msg) => {
                self.send_control_frame(&msg).await?;
            }

            SessionCommand::Typing(msg) => {
                self.send_datagram(&msg)?;
            }

            SessionCommand::StopTyping(msg) => {
                self.send_datagram(&msg)?;
            }
        }

        Ok(())
    }

    /// Deliver a live message, healing ordering against the watermark
    async fn deliver(&self, msg: ChatMessage) -> Result<()> {
        let delivered = self.delivered.load(Ordering::Acquire);

        match classify_delivery(delivered, msg.offset) {
            DeliveryAction::Skip => {
                debug!(
                    session_id = %self.session_id,
                    offset = msg.offset,
                    delivered,
                    "Suppressed duplicate delivery"
                );
            }
            DeliveryAction::Send => {
                self.send_control_frame(&msg).await?;
                self.delivered.store(msg.offset, Ordering::Release);
            }
            DeliveryAction::Backfill => {
                // Older messages were broadcast while this session was
                // replaying (or the queue reordered); read them from the log
                self.catch_up().await?;

                // If the read degraded, the live message still goes out
                if msg.offset > self.delivered.load(Ordering::Acquire) {
                    self.send_control_frame(&msg).await?;
                    self.delivered.store(msg.offset, Ordering::Release);
                }
            }
        }

        Ok(())
    }

    /// Page the log out to this client from the current watermark.
    ///
    /// A failed read is logged and abandons the rest of the backlog; the
    /// session stays connected and continues with live traffic.
    async fn catch_up(&self) -> Result<()> {
        loop {
            let from = self.delivered.load(Ordering::Acquire);
            let batch = match self.log.read_after(from, REPLAY_BATCH) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(
                        session_id = %self.session_id,
                        from,
                        "Replay read failed, continuing without backlog: {}",
                        e
                    );
                    return Ok(());
                }
            };

            if batch.is_empty() {
                return Ok(());
            }

            for stored in batch {
                let msg = ChatMessage {
                    offset: stored.offset,
                    sender: stored.sender,
                    content: stored.content,
                };
                self.send_control_frame(&msg).await?;
                self.delivered.store(msg.offset, Ordering::Release);
            }
        }
    }

    /// Send a frame on the control stream
    async fn send_control_frame<T: Encodable>(&self, msg: &T) -> Result<()> {
        let frame = msg
            .encode_frame()
            .map_err(|e| RelayError::serialization(format!("Failed to encode frame: {}", e)))?;

        let mut control = self.control_send.write().await;
        if let Some(send) = control.as_mut() {
            let data = frame.encode_to_bytes();
            send.write_all(&data).await.map_err(|e| {
                RelayError::network(format!("Failed to write to control stream: {}", e))
            })?;
        } else {
            return Err(RelayError::connection("Control stream not open"));
        }

        Ok(())
    }

    /// Send a datagram
    fn send_datagram<T: Encodable>(&self, msg: &T) -> Result<()> {
        let frame = msg
            .encode_frame()
            .map_err(|e| RelayError::serialization(format!("Failed to encode frame: {}", e)))?;

        self.connection
            .send_datagram(frame.encode_to_bytes())
            .map_err(|e| RelayError::network(format!("Failed to send datagram: {}", e)))?;

        Ok(())
    }

    /// Send an error frame
    async fn send_error(&self, error: RelayError) -> Result<()> {
        let err = Error::new(error.code(), error.message().to_string());
        self.send_control_frame(&err).await
    }

    /// Keepalive ping loop
    async fn ping_loop(self: &Arc<Self>) {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        // The immediate first tick would ping mid-handshake
        interval.tick().await;

        loop {
            interval.tick().await;

            if !self.is_active().await {
                continue;
            }

            let ping = Ping {
                timestamp: current_timestamp(),
            };

            if let Err(e) = self.send_control_frame(&ping).await {
                debug!("Failed to send ping: {}", e);
                break;
            }
        }
    }
}

/// Resolve the handshake identity: default, trim, bound
fn resolve_identity(identity: Option<&str>) -> Result<String> {
    let identity = identity.map(str::trim).filter(|s| !s.is_empty());

    match identity {
        None => Ok(ANONYMOUS.to_string()),
        Some(name) if name.len() > MAX_IDENTITY_LEN => {
            Err(RelayError::handshake("Identity too long"))
        }
        Some(name) => Ok(name.to_string()),
    }
}
