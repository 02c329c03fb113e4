//! Read receipts
//!
//! `message-read` only ever updates `read_at` of a message that is already
//! in the timeline. A receipt for an id the client has not seen is dropped;
//! the next history load carries the read state anyway.

use helpmate_shared::{MessageId, TicketId, UserId};
use time::OffsetDateTime;

use super::store::MessageStore;

/// Payload of a `message-read` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub read_at: OffsetDateTime,
    pub read_by: Option<UserId>,
}

/// Applies read receipts to the store
#[derive(Debug, Default)]
pub struct ReadReceiptTracker {
    applied: u64,
    unmatched: u64,
}

impl ReadReceiptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a message was updated
    pub fn apply(&mut self, store: &mut MessageStore, ticket_id: &TicketId, receipt: ReadReceipt) -> bool {
        if store.mark_read(ticket_id, &receipt.message_id, receipt.read_at) {
            self.applied += 1;
            true
        } else {
            self.unmatched += 1;
            tracing::debug!(
                ticket_id = %ticket_id,
                message_id = %receipt.message_id,
                "Read receipt for unknown message"
            );
            false
        }
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn unmatched(&self) -> u64 {
        self.unmatched
    }
}
