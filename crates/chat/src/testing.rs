//! Test doubles and fixtures shared by the unit tests

use std::cell::{Cell, RefCell};

use helpmate_shared::{Author, Message, MessageId, SyncError, SyncResult, TicketId, UserId, UserRole};
use time::{Duration, OffsetDateTime};

use crate::realtime::connection::Emitter;
use crate::realtime::events::OutboundEvent;

/// Emitter that records what it was asked to send
pub(crate) struct RecordingEmitter {
    ready: Cell<bool>,
    sent: RefCell<Vec<OutboundEvent>>,
}

impl RecordingEmitter {
    pub(crate) fn ready() -> Self {
        Self {
            ready: Cell::new(true),
            sent: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn offline() -> Self {
        let emitter = Self::ready();
        emitter.ready.set(false);
        emitter
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.set(ready);
    }

    pub(crate) fn sent(&self) -> Vec<OutboundEvent> {
        self.sent.borrow().clone()
    }

    pub(crate) fn clear(&self) {
        self.sent.borrow_mut().clear();
    }
}

impl Emitter for RecordingEmitter {
    fn is_ready(&self) -> bool {
        self.ready.get()
    }

    fn emit(&self, event: OutboundEvent) -> SyncResult<()> {
        if !self.ready.get() {
            return Err(SyncError::NotConnected);
        }
        self.sent.borrow_mut().push(event);
        Ok(())
    }
}

pub(crate) fn base_time() -> OffsetDateTime {
    time::macros::datetime!(2025-03-01 10:00:00 UTC)
}

pub(crate) fn author(id: &str, role: UserRole) -> Author {
    Author {
        id: UserId::from(id),
        first_name: format!("User {}", id),
        last_name: String::new(),
        avatar: None,
        role,
    }
}

/// Confirmed message `id` on `ticket` by `author_id`, `minutes` after the
/// base time
pub(crate) fn message(id: &str, ticket: &str, author_id: &str, minutes: i64) -> Message {
    let author = author(author_id, UserRole::Operator);
    Message {
        id: MessageId::from(id),
        ticket_id: TicketId::from(ticket),
        author_id: author.id.clone(),
        author,
        content: format!("content of {}", id),
        is_internal: false,
        created_at: base_time() + Duration::minutes(minutes),
        read_at: None,
        attachments: Vec::new(),
    }
}

pub(crate) fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}
