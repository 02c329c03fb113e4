//! Typing presence
//!
//! Inbound `user-typing` signals become a per-ticket set of users with an
//! expiry; outbound keystrokes are collapsed into one `typing:true` per burst
//! and a trailing `typing:false`.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use helpmate_shared::{TicketId, UserId};

/// Quiet window after which a typing indicator disappears on its own
pub const DEFAULT_TYPING_EXPIRY: Duration = Duration::from_millis(3000);

/// Idle window after which the local user is reported as stopped
pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_millis(1000);

/// Who is typing in which ticket
#[derive(Debug)]
pub struct TypingAggregator {
    local_user: Option<UserId>,
    expiry: Duration,
    tickets: HashMap<TicketId, HashMap<UserId, Instant>>,
}

impl Default for TypingAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_EXPIRY)
    }
}

impl TypingAggregator {
    pub fn new(expiry: Duration) -> Self {
        Self {
            local_user: None,
            expiry,
            tickets: HashMap::new(),
        }
    }

    /// Signals about this user are ignored
    pub fn set_local_user(&mut self, user_id: Option<UserId>) {
        if let Some(user_id) = &user_id {
            for users in self.tickets.values_mut() {
                users.remove(user_id);
            }
        }
        self.local_user = user_id;
    }

    /// Apply a `user-typing` signal
    ///
    /// Returns true if the visible set for `ticket_id` changed.
    pub fn set_typing(
        &mut self,
        ticket_id: &TicketId,
        user_id: UserId,
        is_typing: bool,
        now: Instant,
    ) -> bool {
        if self.local_user.as_ref() == Some(&user_id) {
            return false;
        }

        if is_typing {
            let users = self.tickets.entry(ticket_id.clone()).or_default();
            let was_visible = users.get(&user_id).is_some_and(|expires| *expires > now);
            users.insert(user_id, now + self.expiry);
            !was_visible
        } else {
            let Some(users) = self.tickets.get_mut(ticket_id) else {
                return false;
            };
            let removed = users.remove(&user_id).is_some_and(|expires| expires > now);
            if users.is_empty() {
                self.tickets.remove(ticket_id);
            }
            removed
        }
    }

    /// Users typing in `ticket_id` as of `now`
    pub fn currently_typing(&self, ticket_id: &TicketId, now: Instant) -> BTreeSet<UserId> {
        self.tickets
            .get(ticket_id)
            .map(|users| {
                users
                    .iter()
                    .filter(|(_, expires)| **expires > now)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop expired entries; returns how many were removed
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        self.tickets.retain(|_, users| {
            let before = users.len();
            users.retain(|_, expires| *expires > now);
            evicted += before - users.len();
            !users.is_empty()
        });
        evicted
    }

    /// Earliest pending expiry
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tickets
            .values()
            .flat_map(|users| users.values())
            .min()
            .copied()
    }

    /// Forget a ticket entirely
    pub fn clear(&mut self, ticket_id: &TicketId) {
        self.tickets.remove(ticket_id);
    }
}

/// Collapses local keystrokes into `typing` signals
#[derive(Debug)]
pub struct TypingDebouncer {
    idle: Duration,
    last_keystroke: Option<Instant>,
}

impl Default for TypingDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_IDLE)
    }
}

impl TypingDebouncer {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            last_keystroke: None,
        }
    }

    /// Currently inside a burst
    pub fn is_active(&self) -> bool {
        self.last_keystroke.is_some()
    }

    /// Record a keystroke; `Some(true)` on the first one of a burst
    pub fn keystroke(&mut self, now: Instant) -> Option<bool> {
        let started = self.last_keystroke.is_none();
        self.last_keystroke = Some(now);
        started.then_some(true)
    }

    /// `Some(false)` once the idle window has passed
    pub fn poll(&mut self, now: Instant) -> Option<bool> {
        match self.deadline() {
            Some(deadline) if deadline <= now => {
                self.last_keystroke = None;
                Some(false)
            }
            _ => None,
        }
    }

    /// End the burst now (message sent); `Some(false)` if one was active
    pub fn stop(&mut self) -> Option<bool> {
        self.last_keystroke.take().map(|_| false)
    }

    /// When [`Self::poll`] will next yield
    pub fn deadline(&self) -> Option<Instant> {
        self.last_keystroke.map(|last| last + self.idle)
    }
}
