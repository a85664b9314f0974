//! Protocol message types for the chat relay
//!
//! All message payloads that can be serialized/deserialized within frames.
//! Uses serde for JSON serialization.

use serde::{Deserialize, Serialize};

/// Offset assigned by the durable log; doubles as the recovery watermark.
pub type Offset = u64;

/// Display name used when the handshake does not carry one.
pub const ANONYMOUS: &str = "Anonymous";

// =============================================================================
// Control messages (0x00 - 0x0F)
// =============================================================================

/// Initial handshake from client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hello {
    /// Display name; the server falls back to "Anonymous" when absent
    #[serde(default)]
    pub identity: Option<String>,
    /// Highest offset the client claims to have already seen
    #[serde(default)]
    pub last_seen_offset: Offset,
    /// Session id of a prior connection, for resumption
    #[serde(default)]
    pub resume: Option<String>,
}

/// Server response to Hello
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAck {
    /// Session id assigned to this connection (present it in `resume` next time)
    pub session_id: String,
    /// Identity the server registered for this session
    pub identity: String,
    /// Whether the prior session's delivery state was preserved without gaps
    pub resumed: bool,
    /// Highest offset currently in the log
    pub head_offset: Offset,
}

/// Ping message for keepalive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    /// Timestamp when ping was sent (for RTT measurement)
    pub timestamp: u64,
}

/// Pong response to Ping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    /// Echo back the timestamp from Ping
    pub timestamp: u64,
}

/// Graceful disconnect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goodbye {
    /// Reason for disconnect
    pub reason: String,
}

// =============================================================================
// Client commands (0x10 - 0x1F) - Client -> Server
// =============================================================================

/// Send a chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessage {
    /// Message content
    pub content: String,
    /// Client-generated token for exactly-once recording
    pub token: String,
}

// =============================================================================
// Server events (0x30 - 0x3F) - Server -> Client
// =============================================================================

/// A recorded chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Offset assigned by the durable log
    pub offset: Offset,
    /// Sender identity
    pub sender: String,
    /// Message content
    pub content: String,
}

/// Acknowledgment that a SendMessage was recorded
///
/// Sent once per SendMessage, including retries of an already-recorded
/// token; a retry is acked with the original row's offset and is not
/// re-broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAck {
    /// Client token being acknowledged
    pub token: String,
    /// Offset under which the message is recorded
    pub offset: Offset,
}

/// Someone joined the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserJoined {
    /// Identity that came online
    pub identity: String,
}

/// Someone left the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLeft {
    /// Identity that went offline
    pub identity: String,
}

/// Snapshot of all online identities, sent on every membership change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineUsers {
    /// Currently online identities, sorted
    pub identities: Vec<String>,
}

// =============================================================================
// Datagram messages (0x80 - 0x8F) - Unreliable
// =============================================================================

/// User is typing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Typing {
    /// Identity (filled by the server for outgoing)
    pub identity: Option<String>,
}

/// User stopped typing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopTyping {
    /// Identity (filled by the server for outgoing)
    pub identity: Option<String>,
}

// =============================================================================
// Error message (0xFF)
// =============================================================================

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    /// Error code
    pub code: u32,
    /// Error message
    pub message: String,
}

impl Error {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_defaults() {
        // A bare handshake payload must decode with every field defaulted
        let hello: Hello = serde_json::from_str("{}").unwrap();
        assert!(hello.identity.is_none());
        assert_eq!(hello.last_seen_offset, 0);
        assert!(hello.resume.is_none());
    }

    #[test]
    fn test_hello_roundtrip() {
        let hello = Hello {
            identity: Some("alice".to_string()),
            last_seen_offset: 42,
            resume: Some("session-1".to_string()),
        };

        let json = serde_json::to_string(&hello).unwrap();
        let decoded: Hello = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.identity.as_deref(), Some("alice"));
        assert_eq!(decoded.last_seen_offset, 42);
        assert_eq!(decoded.resume.as_deref(), Some("session-1"));
    }

    #[test]
    fn test_serialize_send_message() {
        let msg = SendMessage {
            content: "Hello, World!".to_string(),
            token: "abc123".to_string(),
        };

        let json = serde_json::to_string(&msg).unwrap();
        let decoded: SendMessage = serde_json::from_str(&json).unwrap();

        assert_eq!(msg.content, decoded.content);
        assert_eq!(msg.token, decoded.token);
    }

    #[test]
    fn test_serialize_chat_message() {
        let msg = ChatMessage {
            offset: 7,
            sender: "alice".to_string(),
            content: "Test message".to_string(),
        };

        let json = serde_json::to_string(&msg).unwrap();
        let decoded: ChatMessage = serde_json::from_str(&json).unwrap();

        assert_eq!(msg.offset, decoded.offset);
        assert_eq!(msg.sender, decoded.sender);
        assert_eq!(msg.content, decoded.content);
    }

    #[test]
    fn test_send_message_missing_token_is_rejected() {
        let result = serde_json::from_str::<SendMessage>(r#"{"content":"hi"}"#);
        assert!(result.is_err());
    }
}
