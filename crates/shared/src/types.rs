//! Chat domain types shared across HelpMate
//!
//! Wire representation is camelCase JSON with RFC 3339 timestamps, matching
//! what the ticketing backend pushes over the realtime channel and returns
//! from the history endpoint.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Prefix for client-generated placeholder message ids
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Ticket ID wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub String);

impl From<&str> for TicketId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// User ID wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation id threaded through `send-message` and echoed back in
/// `message-sent`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempId(pub u64);

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message ID wrapper
///
/// Either a server-assigned id or a synthetic `temp-<tempId>` placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Placeholder id for an optimistic send
    pub fn temporary(temp_id: TempId) -> Self {
        Self(format!("{}{}", TEMP_ID_PREFIX, temp_id.0))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Users
// =============================================================================

/// Role of a ticketing participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    #[serde(alias = "client")]
    Client,
    #[serde(alias = "operator")]
    Operator,
    #[serde(alias = "specialist")]
    Specialist,
    #[serde(alias = "manager")]
    Manager,
}

impl UserRole {
    /// Ticket owners never see internal notes
    pub fn can_see_internal(&self) -> bool {
        !matches!(self, UserRole::Client)
    }
}

/// Display snapshot of a message author
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub role: UserRole,
}

impl Author {
    pub fn display_name(&self) -> String {
        if self.last_name.is_empty() {
            self.first_name.clone()
        } else {
            format!("{} {}", self.first_name, self.last_name)
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// File reference attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub url: String,
}

/// One chat utterance in a ticket conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub ticket_id: TicketId,
    pub author_id: UserId,
    pub author: Author,
    pub content: String,
    #[serde(default)]
    pub is_internal: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub read_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Build the locally visible placeholder for a send that has not been
    /// confirmed yet
    pub fn optimistic(
        temp_id: TempId,
        ticket_id: TicketId,
        author: &Author,
        content: String,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: MessageId::temporary(temp_id),
            ticket_id,
            author_id: author.id.clone(),
            author: author.clone(),
            content,
            is_internal: false,
            created_at,
            read_at: None,
            attachments: Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_temporary()
    }

    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}
