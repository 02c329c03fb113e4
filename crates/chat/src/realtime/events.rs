//! Realtime event types and serialization
//!
//! Every frame on the chat channel is a JSON text frame of the form
//! `{"event": "<name>", "data": {...}}`. Inbound and outbound events are
//! modelled as adjacently tagged enums so unknown or malformed frames fail
//! to parse instead of reaching the reducers.

use helpmate_shared::{Message, MessageId, SyncError, TempId, TicketId, UserId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Events received from the chat service
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum InboundEvent {
    /// Transport-level connect acknowledged
    Connect,

    /// Credential accepted; the channel is now authenticated
    Connected { user_id: UserId },

    /// Room membership confirmed
    JoinedTicket { ticket_id: TicketId },

    /// Remote side closed the session
    Disconnect,

    /// Error reported by the service
    Error { message: String },

    /// Message pushed to the ticket room
    NewMessage(Message),

    /// Confirmation of one of our own sends
    MessageSent { temp_id: TempId, message: Message },

    /// Read receipt
    MessageRead {
        message_id: MessageId,
        #[serde(with = "time::serde::rfc3339")]
        read_at: OffsetDateTime,
        #[serde(default)]
        read_by: Option<UserId>,
    },

    /// Another participant started or stopped typing
    UserTyping {
        user_id: UserId,
        is_typing: bool,
        #[serde(default)]
        ticket_id: Option<TicketId>,
    },
}

impl InboundEvent {
    /// Parse one text frame
    pub fn from_frame(frame: &str) -> Result<Self, SyncError> {
        serde_json::from_str(frame).map_err(|e| SyncError::Protocol(e.to_string()))
    }

    /// Wire name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::Connect => "connect",
            InboundEvent::Connected { .. } => "connected",
            InboundEvent::JoinedTicket { .. } => "joined-ticket",
            InboundEvent::Disconnect => "disconnect",
            InboundEvent::Error { .. } => "error",
            InboundEvent::NewMessage(_) => "new-message",
            InboundEvent::MessageSent { .. } => "message-sent",
            InboundEvent::MessageRead { .. } => "message-read",
            InboundEvent::UserTyping { .. } => "user-typing",
        }
    }
}

// =============================================================================
// Client-to-Server Events
// =============================================================================

/// Events emitted to the chat service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum OutboundEvent {
    JoinTicket { ticket_id: TicketId },

    LeaveTicket { ticket_id: TicketId },

    SendMessage {
        ticket_id: TicketId,
        message: OutgoingMessage,
        temp_id: TempId,
    },

    Typing { ticket_id: TicketId, is_typing: bool },

    MarkAsRead { message_id: MessageId },
}

impl OutboundEvent {
    pub fn to_frame(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::Protocol(e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::JoinTicket { .. } => "join-ticket",
            OutboundEvent::LeaveTicket { .. } => "leave-ticket",
            OutboundEvent::SendMessage { .. } => "send-message",
            OutboundEvent::Typing { .. } => "typing",
            OutboundEvent::MarkAsRead { .. } => "mark-as-read",
        }
    }
}

/// Body of a `send-message` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_ids: Option<Vec<String>>,
    pub is_internal: bool,
}
