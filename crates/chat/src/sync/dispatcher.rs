//! Outbound command dispatch
//!
//! Sends are optimistic: the placeholder is appended to the timeline and the
//! `send-message` command is emitted in the same step. Nothing waits for the
//! acknowledgement and nothing is queued while the channel is down.

use helpmate_shared::{
    Author, Message, MessageId, SyncError, SyncResult, TempId, TicketId,
};
use time::OffsetDateTime;

use super::store::{MessageStore, PendingSend};
use crate::realtime::connection::Emitter;
use crate::realtime::events::{OutboundEvent, OutgoingMessage};

/// Longest message body accepted, in characters
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 2000;

/// Correlation ids from wall-clock milliseconds, strictly increasing
#[derive(Debug, Default)]
pub struct TempIdGenerator {
    last: u64,
}

impl TempIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id; two sends within the same millisecond still differ
    pub fn next(&mut self, wall: OffsetDateTime) -> TempId {
        let millis = u64::try_from(wall.unix_timestamp_nanos() / 1_000_000).unwrap_or(0);
        self.last = millis.max(self.last + 1);
        TempId(self.last)
    }
}

/// A send request from the view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub ticket_id: TicketId,
    pub content: String,
    pub attachment_ids: Option<Vec<String>>,
}

/// Emits user commands through the channel
#[derive(Debug)]
pub struct CommandDispatcher {
    temp_ids: TempIdGenerator,
    max_length: usize,
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LENGTH)
    }
}

impl CommandDispatcher {
    pub fn new(max_length: usize) -> Self {
        Self {
            temp_ids: TempIdGenerator::new(),
            max_length,
        }
    }

    /// Append an optimistic message and emit `send-message`
    ///
    /// Rejected without side effects when the channel is not authenticated
    /// or the content is blank or too long.
    pub fn send_message(
        &mut self,
        store: &mut MessageStore,
        emitter: &dyn Emitter,
        author: &Author,
        request: SendRequest,
        now: OffsetDateTime,
    ) -> SyncResult<TempId> {
        if !emitter.is_ready() {
            return Err(SyncError::NotConnected);
        }
        self.validate(&request.content)?;

        let temp_id = self.temp_ids.next(now);
        let SendRequest {
            ticket_id,
            content,
            attachment_ids,
        } = request;

        let placeholder = Message::optimistic(
            temp_id,
            ticket_id.clone(),
            author,
            content.clone(),
            now,
        );
        let pending = PendingSend {
            temp_id,
            ticket_id: ticket_id.clone(),
            content: content.clone(),
            dispatched_at: now,
        };
        if !store.append_optimistic(placeholder, pending) {
            tracing::debug!(ticket_id = %ticket_id, temp_id = %temp_id, "No open timeline for optimistic send");
        }

        emitter.emit(OutboundEvent::SendMessage {
            ticket_id: ticket_id.clone(),
            message: OutgoingMessage {
                content,
                attachment_ids,
                is_internal: false,
            },
            temp_id,
        })?;

        tracing::debug!(ticket_id = %ticket_id, temp_id = %temp_id, "Message dispatched");
        Ok(temp_id)
    }

    /// Emit `mark-as-read`
    pub fn mark_as_read(&self, emitter: &dyn Emitter, message_id: MessageId) -> SyncResult<()> {
        if message_id.is_temporary() {
            return Err(SyncError::InvalidContent(format!(
                "cannot mark unconfirmed message {} as read",
                message_id
            )));
        }
        emitter.emit(OutboundEvent::MarkAsRead { message_id })
    }

    /// Emit `typing`
    pub fn emit_typing(
        &self,
        emitter: &dyn Emitter,
        ticket_id: TicketId,
        is_typing: bool,
    ) -> SyncResult<()> {
        emitter.emit(OutboundEvent::Typing {
            ticket_id,
            is_typing,
        })
    }

    fn validate(&self, content: &str) -> SyncResult<()> {
        if content.trim().is_empty() {
            return Err(SyncError::InvalidContent("message is empty".to_string()));
        }
        let length = content.chars().count();
        if length > self.max_length {
            return Err(SyncError::InvalidContent(format!(
                "message is {} characters, limit is {}",
                length, self.max_length
            )));
        }
        Ok(())
    }
}
