//! Message reconciliation store
//!
//! Merges three sources into one timeline per ticket:
//!
//! - **History**: the bulk-loaded page, authoritative for confirmed ids
//! - **Optimistic sends**: `temp-<tempId>` placeholders appended at send time
//! - **Server events**: `message-sent` confirmations and `new-message` pushes
//!
//! The same final id may arrive through both the confirmation and the push
//! path, in either order, or twice. Exactly one copy survives, and once a
//! confirmation arrives its placeholder is gone.
//!
//! Canonical order is ascending `created_at`; entries with equal timestamps
//! keep their arrival order.

use std::collections::{BTreeMap, HashMap};

use helpmate_shared::{
    Message, MessageId, SyncError, TempId, TicketId, UserId, UserRole,
};
use time::{Date, OffsetDateTime, UtcOffset};

/// A send awaiting its `message-sent` confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub temp_id: TempId,
    pub ticket_id: TicketId,
    pub content: String,
    pub dispatched_at: OffsetDateTime,
}

/// Result of applying a confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmOutcome {
    /// The `temp-<tempId>` placeholder was present and removed
    pub placeholder_removed: bool,
    /// The confirmed record was inserted (false if a push got there first)
    pub inserted: bool,
}

/// Result of applying a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Inserted,
    Duplicate,
    /// No open timeline for the message's ticket
    Dropped,
}

/// Result of merging a history page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryOutcome {
    pub inserted: usize,
    pub replaced: usize,
}

/// Messages of one calendar day, for display
#[derive(Debug, Clone, PartialEq)]
pub struct DayGroup<'a> {
    pub date: Date,
    pub messages: Vec<&'a Message>,
}

/// Ordered, de-duplicated message timeline of one ticket
#[derive(Debug, Default)]
pub struct Timeline {
    messages: Vec<Message>,
    pending: BTreeMap<TempId, PendingSend>,
    loaded: bool,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// History has been merged at least once
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.position(id).map(|idx| &self.messages[idx])
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    pub fn pending_sends(&self) -> impl Iterator<Item = &PendingSend> {
        self.pending.values()
    }

    /// Merge a page of confirmed history
    ///
    /// Entries with a known id are replaced by the page's version; temporary
    /// placeholders are left alone.
    pub fn load_history(&mut self, page: Vec<Message>) -> HistoryOutcome {
        let mut outcome = HistoryOutcome::default();

        for message in page {
            if message.id.is_temporary() {
                tracing::warn!(message_id = %message.id, "Ignoring temporary id in history page");
                continue;
            }
            match self.position(&message.id) {
                Some(idx) if self.messages[idx].created_at == message.created_at => {
                    self.messages[idx] = message;
                    outcome.replaced += 1;
                }
                Some(idx) => {
                    self.messages.remove(idx);
                    self.insert_ordered(message);
                    outcome.replaced += 1;
                }
                None => {
                    self.insert_ordered(message);
                    outcome.inserted += 1;
                }
            }
        }

        self.loaded = true;
        outcome
    }

    /// Append the placeholder for a send that is in flight
    pub fn append_optimistic(&mut self, message: Message, pending: PendingSend) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.pending.insert(pending.temp_id, pending);
        self.insert_ordered(message);
        true
    }

    /// Apply a `message-sent` confirmation
    pub fn confirm(&mut self, temp_id: TempId, message: Message) -> ConfirmOutcome {
        let placeholder = MessageId::temporary(temp_id);
        self.pending.remove(&temp_id);

        let placeholder_removed = match self.position(&placeholder) {
            Some(idx) => {
                self.messages.remove(idx);
                true
            }
            None => false,
        };

        let inserted = self.push(message);
        ConfirmOutcome {
            placeholder_removed,
            inserted,
        }
    }

    /// Remove every unconfirmed placeholder and its pending entry
    ///
    /// Used when the transport that carried the sends is gone and their
    /// confirmations can no longer arrive.
    pub fn abandon_pending(&mut self) -> Vec<PendingSend> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        self.messages.retain(|m| !m.id.is_temporary());
        std::mem::take(&mut self.pending).into_values().collect()
    }

    /// Apply a `new-message` push; false if the id is already present
    pub fn push(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.insert_ordered(message);
        true
    }

    /// Set `read_at` in place; false if the message is not here (yet)
    pub fn mark_read(&mut self, id: &MessageId, read_at: OffsetDateTime) -> bool {
        match self.position(id) {
            Some(idx) => {
                self.messages[idx].read_at = Some(read_at);
                true
            }
            None => false,
        }
    }

    /// Messages a viewer with `role` may see
    pub fn visible_to(&self, role: UserRole) -> Vec<&Message> {
        self.messages
            .iter()
            .filter(|m| !m.is_internal || role.can_see_internal())
            .collect()
    }

    /// Confirmed messages from other participants that are still unread
    pub fn unread_count(&self, viewer: &UserId) -> usize {
        self.messages
            .iter()
            .filter(|m| &m.author_id != viewer && !m.is_pending() && m.read_at.is_none())
            .count()
    }

    /// Group by calendar day in `offset`, preserving timeline order
    pub fn group_by_day(&self, offset: UtcOffset) -> Vec<DayGroup<'_>> {
        let mut groups: Vec<DayGroup<'_>> = Vec::new();
        for message in &self.messages {
            let date = message.created_at.to_offset(offset).date();
            match groups.last_mut() {
                Some(group) if group.date == date => group.messages.push(message),
                _ => groups.push(DayGroup {
                    date,
                    messages: vec![message],
                }),
            }
        }
        groups
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    /// Insert after every entry with `created_at <= message.created_at`
    fn insert_ordered(&mut self, message: Message) {
        let idx = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(idx, message);
    }
}

/// Timelines of the tickets that are currently open
#[derive(Debug, Default)]
pub struct MessageStore {
    timelines: HashMap<TicketId, Timeline>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or keep) the timeline for `ticket_id`
    pub fn open(&mut self, ticket_id: TicketId) -> &mut Timeline {
        self.timelines.entry(ticket_id).or_default()
    }

    pub fn timeline(&self, ticket_id: &TicketId) -> Option<&Timeline> {
        self.timelines.get(ticket_id)
    }

    /// Drop a ticket's timeline; unconfirmed sends are abandoned silently
    pub fn evict(&mut self, ticket_id: &TicketId) -> Vec<PendingSend> {
        let Some(timeline) = self.timelines.remove(ticket_id) else {
            return Vec::new();
        };
        let abandoned: Vec<PendingSend> = timeline.pending.into_values().collect();
        log_abandoned(ticket_id, &abandoned);
        abandoned
    }

    /// Drop the unconfirmed sends of a ticket but keep its timeline
    pub fn abandon_pending(&mut self, ticket_id: &TicketId) -> Vec<PendingSend> {
        let abandoned = self
            .timelines
            .get_mut(ticket_id)
            .map(Timeline::abandon_pending)
            .unwrap_or_default();
        log_abandoned(ticket_id, &abandoned);
        abandoned
    }

    pub fn load_history(&mut self, ticket_id: &TicketId, page: Vec<Message>) -> Option<HistoryOutcome> {
        let timeline = self.timelines.get_mut(ticket_id)?;
        let outcome = timeline.load_history(page);
        tracing::debug!(
            ticket_id = %ticket_id,
            inserted = outcome.inserted,
            replaced = outcome.replaced,
            total = timeline.len(),
            "Merged message history"
        );
        Some(outcome)
    }

    pub fn append_optimistic(&mut self, message: Message, pending: PendingSend) -> bool {
        match self.timelines.get_mut(&message.ticket_id) {
            Some(timeline) => timeline.append_optimistic(message, pending),
            None => false,
        }
    }

    /// Route a confirmation to its ticket; None if that ticket is not open
    pub fn confirm(&mut self, temp_id: TempId, message: Message) -> Option<ConfirmOutcome> {
        let ticket_id = message.ticket_id.clone();
        let timeline = self.timelines.get_mut(&ticket_id)?;
        let outcome = timeline.confirm(temp_id, message);
        if !outcome.placeholder_removed {
            tracing::debug!(
                ticket_id = %ticket_id,
                temp_id = %temp_id,
                "Confirmation without a local placeholder"
            );
        }
        Some(outcome)
    }

    pub fn push(&mut self, message: Message) -> PushOutcome {
        match self.timelines.get_mut(&message.ticket_id) {
            Some(timeline) => {
                if timeline.push(message) {
                    PushOutcome::Inserted
                } else {
                    PushOutcome::Duplicate
                }
            }
            None => PushOutcome::Dropped,
        }
    }

    pub fn mark_read(&mut self, ticket_id: &TicketId, id: &MessageId, read_at: OffsetDateTime) -> bool {
        self.timelines
            .get_mut(ticket_id)
            .map(|timeline| timeline.mark_read(id, read_at))
            .unwrap_or(false)
    }
}

fn log_abandoned(ticket_id: &TicketId, abandoned: &[PendingSend]) {
    for pending in abandoned {
        tracing::debug!(
            ticket_id = %ticket_id,
            error = %SyncError::SendNotAcknowledged { temp_id: pending.temp_id },
            "Abandoning unconfirmed send"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::{author, base_time, ids, message};
    use time::macros::offset;
    use time::Duration;

    fn optimistic(temp_id: u64, ticket: &str, minutes: i64) -> (Message, PendingSend) {
        let created_at = base_time() + Duration::minutes(minutes);
        let message = Message::optimistic(
            TempId(temp_id),
            TicketId::from(ticket),
            &author("me", UserRole::Client),
            "hello".to_string(),
            created_at,
        );
        let pending = PendingSend {
            temp_id: TempId(temp_id),
            ticket_id: TicketId::from(ticket),
            content: "hello".to_string(),
            dispatched_at: created_at,
        };
        (message, pending)
    }

    fn confirmed(id: &str, minutes: i64) -> Message {
        let mut message = message(id, "T1", "me", minutes);
        message.content = "hello".to_string();
        message
    }

    #[test]
    fn test_push_is_idempotent() {
        let mut timeline = Timeline::new();
        assert!(timeline.push(message("m1", "T1", "u2", 0)));
        assert!(!timeline.push(message("m1", "T1", "u2", 0)));

        assert_eq!(ids(timeline.messages()), vec!["m1"]);
    }

    #[test]
    fn test_confirm_only_path() {
        let mut timeline = Timeline::new();
        let (temp, pending) = optimistic(7, "T1", 1);
        timeline.append_optimistic(temp, pending);
        assert_eq!(ids(timeline.messages()), vec!["temp-7"]);

        let outcome = timeline.confirm(TempId(7), confirmed("m1", 1));

        assert_eq!(
            outcome,
            ConfirmOutcome {
                placeholder_removed: true,
                inserted: true
            }
        );
        assert_eq!(ids(timeline.messages()), vec!["m1"]);
        assert_eq!(timeline.pending_sends().count(), 0);
    }

    #[test]
    fn test_push_before_confirm_leaves_single_copy() {
        let mut timeline = Timeline::new();
        let (temp, pending) = optimistic(7, "T1", 1);
        timeline.append_optimistic(temp, pending);

        assert!(timeline.push(confirmed("m1", 1)));
        assert_eq!(timeline.len(), 2);

        let outcome = timeline.confirm(TempId(7), confirmed("m1", 1));

        assert_eq!(
            outcome,
            ConfirmOutcome {
                placeholder_removed: true,
                inserted: false
            }
        );
        assert_eq!(ids(timeline.messages()), vec!["m1"]);
    }

    #[test]
    fn test_duplicate_confirmation_is_harmless() {
        let mut timeline = Timeline::new();
        let (temp, pending) = optimistic(7, "T1", 1);
        timeline.append_optimistic(temp, pending);

        timeline.confirm(TempId(7), confirmed("m1", 1));
        let again = timeline.confirm(TempId(7), confirmed("m1", 1));

        assert_eq!(
            again,
            ConfirmOutcome {
                placeholder_removed: false,
                inserted: false
            }
        );
        assert_eq!(ids(timeline.messages()), vec!["m1"]);
    }

    #[test]
    fn test_order_independent_of_arrival() {
        let mut timeline = Timeline::new();
        for (id, minutes) in [("m3", 3), ("m1", 1), ("m4", 4), ("m0", 0), ("m2", 2)] {
            timeline.push(message(id, "T1", "u2", minutes));
        }

        assert_eq!(
            ids(timeline.messages()),
            vec!["m0", "m1", "m2", "m3", "m4"]
        );
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut timeline = Timeline::new();
        timeline.push(message("b", "T1", "u2", 5));
        timeline.push(message("a", "T1", "u2", 5));
        timeline.push(message("early", "T1", "u2", 1));
        timeline.push(message("c", "T1", "u2", 5));

        assert_eq!(ids(timeline.messages()), vec!["early", "b", "a", "c"]);
    }

    #[test]
    fn test_history_is_authoritative_for_confirmed_ids() {
        let mut timeline = Timeline::new();
        let mut stale = message("m1", "T1", "u2", 1);
        stale.content = "stale".to_string();
        timeline.push(stale);
        let (temp, pending) = optimistic(9, "T1", 10);
        timeline.append_optimistic(temp, pending);

        let outcome = timeline.load_history(vec![
            message("m0", "T1", "u2", 0),
            message("m1", "T1", "u2", 1),
        ]);

        assert_eq!(outcome, HistoryOutcome { inserted: 1, replaced: 1 });
        assert_eq!(ids(timeline.messages()), vec!["m0", "m1", "temp-9"]);
        assert_eq!(timeline.messages()[1].content, "content of m1");
        assert!(timeline.is_loaded());
    }

    #[test]
    fn test_history_skips_temporary_ids() {
        let mut timeline = Timeline::new();
        let (temp, _) = optimistic(3, "T1", 0);

        let outcome = timeline.load_history(vec![temp]);

        assert_eq!(outcome, HistoryOutcome::default());
        assert!(timeline.is_empty());
    }

    #[test]
    fn test_read_receipt_for_missing_message_is_noop() {
        let mut timeline = Timeline::new();
        timeline.push(message("m1", "T1", "u2", 0));

        assert!(!timeline.mark_read(&MessageId::from("ghost"), base_time()));
        assert_eq!(ids(timeline.messages()), vec!["m1"]);

        assert!(timeline.mark_read(&MessageId::from("m1"), base_time()));
        assert_eq!(timeline.get(&MessageId::from("m1")).unwrap().read_at, Some(base_time()));
    }

    #[test]
    fn test_internal_messages_hidden_from_clients() {
        let mut timeline = Timeline::new();
        timeline.push(message("public", "T1", "u2", 0));
        let mut note = message("note", "T1", "u2", 1);
        note.is_internal = true;
        timeline.push(note);

        let client_view: Vec<&str> = timeline
            .visible_to(UserRole::Client)
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(client_view, vec!["public"]);
        assert_eq!(timeline.visible_to(UserRole::Operator).len(), 2);
    }

    #[test]
    fn test_unread_count_ignores_own_and_pending() {
        let mut timeline = Timeline::new();
        timeline.push(message("theirs", "T1", "u2", 0));
        timeline.push(message("mine", "T1", "me", 1));
        let mut read = message("read", "T1", "u2", 2);
        read.read_at = Some(base_time());
        timeline.push(read);
        let (temp, pending) = optimistic(1, "T1", 3);
        timeline.append_optimistic(temp, pending);

        assert_eq!(timeline.unread_count(&UserId::from("me")), 1);
    }

    #[test]
    fn test_group_by_day_uses_display_offset() {
        let mut timeline = Timeline::new();
        // 10:00 UTC on 1 March, then 22:30 UTC (next day in UTC+3)
        timeline.push(message("morning", "T1", "u2", 0));
        timeline.push(message("late", "T1", "u2", 12 * 60 + 30));

        assert_eq!(timeline.group_by_day(offset!(UTC)).len(), 1);

        let groups = timeline.group_by_day(offset!(+3));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].messages[0].id.as_str(), "morning");
        assert_eq!(groups[1].messages[0].id.as_str(), "late");
        assert!(groups[0].date < groups[1].date);
    }

    #[test]
    fn test_store_routes_by_ticket() {
        let mut store = MessageStore::new();
        store.open(TicketId::from("T1"));

        assert_eq!(store.push(message("m1", "T1", "u2", 0)), PushOutcome::Inserted);
        assert_eq!(store.push(message("m1", "T1", "u2", 0)), PushOutcome::Duplicate);
        assert_eq!(store.push(message("x", "T2", "u2", 0)), PushOutcome::Dropped);
        assert!(store.confirm(TempId(1), message("y", "T2", "me", 0)).is_none());
        assert!(store.timeline(&TicketId::from("T2")).is_none());
    }

    #[test]
    fn test_evict_abandons_pending_sends() {
        let mut store = MessageStore::new();
        store.open(TicketId::from("T1"));
        let (temp, pending) = optimistic(5, "T1", 0);
        assert!(store.append_optimistic(temp, pending));

        let abandoned = store.evict(&TicketId::from("T1"));

        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].temp_id, TempId(5));
        assert!(store.timeline(&TicketId::from("T1")).is_none());
        assert!(store.evict(&TicketId::from("T1")).is_empty());
    }

    #[test]
    fn test_abandon_pending_keeps_confirmed_messages() {
        let mut store = MessageStore::new();
        store.open(TicketId::from("T1"));
        store.push(message("m1", "T1", "u2", 0));
        let (temp, pending) = optimistic(7, "T1", 1);
        assert!(store.append_optimistic(temp, pending));

        let abandoned = store.abandon_pending(&TicketId::from("T1"));

        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].temp_id, TempId(7));
        let timeline = store.timeline(&TicketId::from("T1")).unwrap();
        assert_eq!(ids(timeline.messages()), vec!["m1"]);
        assert_eq!(timeline.pending_sends().count(), 0);

        // A late confirmation still lands exactly once
        store.confirm(TempId(7), confirmed("m2", 1));
        let timeline = store.timeline(&TicketId::from("T1")).unwrap();
        assert_eq!(ids(timeline.messages()), vec!["m1", "m2"]);
        assert!(store.abandon_pending(&TicketId::from("T2")).is_empty());
    }
}
