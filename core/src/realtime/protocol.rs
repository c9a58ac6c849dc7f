/// Wire protocol for the real-time channel
///
/// Every packet is a JSON envelope `{"event": "<name>", "data": {...}}`. On the
/// streaming transport envelopes travel inside length-prefixed frames.
use crate::error::{ChatError, Result};
use crate::messenger_types::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version sent in the handshake
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest frame payload accepted from the server
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Events pushed by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    /// A peer message for one of our conversations
    ReceiveMessage { message: Message },

    /// Server confirmation of a message we sent
    MessageSent { message: Message },

    /// Peer started (`status == true`) or stopped typing; servers may omit the conversation
    #[serde(rename_all = "camelCase")]
    UserTyping {
        #[serde(default, alias = "chatId")]
        conversation_id: Option<String>,
        user_id: String,
        status: bool,
    },

    #[serde(rename_all = "camelCase")]
    MessageDelivered {
        message_id: String,
        #[serde(default, alias = "chatId")]
        conversation_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    MessageRead {
        message_id: String,
        #[serde(default, alias = "chatId")]
        conversation_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    MessageError {
        message_id: String,
        #[serde(default)]
        error: String,
    },

    #[serde(rename_all = "camelCase")]
    UserStatus {
        user_id: String,
        is_online: bool,
        #[serde(default)]
        last_seen: Option<DateTime<Utc>>,
    },
}

/// Discriminant of [`InboundEvent`], used as the subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ReceiveMessage,
    MessageSent,
    UserTyping,
    MessageDelivered,
    MessageRead,
    MessageError,
    UserStatus,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::ReceiveMessage,
        EventKind::MessageSent,
        EventKind::UserTyping,
        EventKind::MessageDelivered,
        EventKind::MessageRead,
        EventKind::MessageError,
        EventKind::UserStatus,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ReceiveMessage => "receive_message",
            EventKind::MessageSent => "message_sent",
            EventKind::UserTyping => "user_typing",
            EventKind::MessageDelivered => "message_delivered",
            EventKind::MessageRead => "message_read",
            EventKind::MessageError => "message_error",
            EventKind::UserStatus => "user_status",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl InboundEvent {
    /// Decode and validate one envelope
    pub fn decode(data: &[u8]) -> Result<Self> {
        let event: InboundEvent = serde_json::from_slice(data)
            .map_err(|e| ChatError::Protocol(format!("Invalid event: {}", e)))?;
        event.validate()?;
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::ReceiveMessage { .. } => EventKind::ReceiveMessage,
            InboundEvent::MessageSent { .. } => EventKind::MessageSent,
            InboundEvent::UserTyping { .. } => EventKind::UserTyping,
            InboundEvent::MessageDelivered { .. } => EventKind::MessageDelivered,
            InboundEvent::MessageRead { .. } => EventKind::MessageRead,
            InboundEvent::MessageError { .. } => EventKind::MessageError,
            InboundEvent::UserStatus { .. } => EventKind::UserStatus,
        }
    }

    /// Conversation the event belongs to, when the payload names one
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            InboundEvent::ReceiveMessage { message } | InboundEvent::MessageSent { message } => {
                Some(message.conversation_id.as_str())
            }
            InboundEvent::UserTyping { conversation_id, .. }
            | InboundEvent::MessageDelivered { conversation_id, .. }
            | InboundEvent::MessageRead { conversation_id, .. } => conversation_id.as_deref(),
            InboundEvent::MessageError { .. } | InboundEvent::UserStatus { .. } => None,
        }
    }

    /// Reject payloads with missing identifiers
    pub fn validate(&self) -> Result<()> {
        let missing = |field: &str| {
            Err(ChatError::Protocol(format!(
                "{} event without {}",
                self.kind(),
                field
            )))
        };
        match self {
            InboundEvent::ReceiveMessage { message } | InboundEvent::MessageSent { message } => {
                if message.id.is_empty() {
                    return missing("message id");
                }
                if message.conversation_id.is_empty() {
                    return missing("conversation id");
                }
            }
            InboundEvent::UserTyping {
                conversation_id,
                user_id,
                ..
            } => {
                if conversation_id.as_deref() == Some("") {
                    return missing("conversation id");
                }
                if user_id.is_empty() {
                    return missing("user id");
                }
            }
            InboundEvent::MessageDelivered { message_id, .. }
            | InboundEvent::MessageRead { message_id, .. }
            | InboundEvent::MessageError { message_id, .. } => {
                if message_id.is_empty() {
                    return missing("message id");
                }
            }
            InboundEvent::UserStatus { user_id, .. } => {
                if user_id.is_empty() {
                    return missing("user id");
                }
            }
        }
        Ok(())
    }
}

/// Events emitted by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    #[serde(rename_all = "camelCase")]
    SendMessage {
        message_id: String,
        conversation_id: String,
        receiver_id: String,
        body: String,
        created_at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    TypingStart {
        conversation_id: String,
        receiver_id: String,
    },

    #[serde(rename_all = "camelCase")]
    TypingEnd {
        conversation_id: String,
        receiver_id: String,
    },

    #[serde(rename_all = "camelCase")]
    MarkRead {
        conversation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },

    /// Ask the server to push messages queued while we were offline
    #[serde(rename_all = "camelCase")]
    SyncUndelivered { conversation_id: String },
}

impl OutboundEvent {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::SendMessage { .. } => "send_message",
            OutboundEvent::TypingStart { .. } => "typing_start",
            OutboundEvent::TypingEnd { .. } => "typing_end",
            OutboundEvent::MarkRead { .. } => "mark_read",
            OutboundEvent::SyncUndelivered { .. } => "sync_undelivered",
        }
    }
}

impl fmt::Display for OutboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutboundEvent({})", self.name())
    }
}

/// Connection control packets on the streaming transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Control {
    #[serde(rename_all = "camelCase")]
    Handshake {
        user_id: String,
        token: String,
        protocol_version: u8,
    },

    #[serde(rename_all = "camelCase")]
    HandshakeAck { session_id: String },

    HandshakeReject { reason: String },

    Ping { timestamp: i64 },

    Pong { timestamp: i64 },

    Close { reason: String },
}

impl Control {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Anything the server can put in a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Control(Control),
    Event(InboundEvent),
}

impl Packet {
    /// Control packets are recognised first; everything else must be a valid event
    pub fn decode(data: &[u8]) -> Result<Self> {
        if let Ok(control) = serde_json::from_slice::<Control>(data) {
            return Ok(Packet::Control(control));
        }
        InboundEvent::decode(data).map(Packet::Event)
    }
}

/// Protocol frame with length prefix
#[derive(Debug)]
pub struct Frame {
    pub length: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            length: payload.len() as u32,
            payload,
        }
    }

    /// Serialize frame to bytes (length prefix + payload)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.payload.len());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Read one frame; `Ok(None)` on a clean end of stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Self>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(ChatError::Io(e)),
        }

        let length = u32::from_be_bytes(len_buf) as usize;
        if length > MAX_FRAME_LEN {
            return Err(ChatError::Protocol(format!(
                "Frame of {} bytes exceeds limit",
                length
            )));
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;
        Ok(Some(Self::new(payload)))
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}
