//! Ticket room membership
//!
//! A conversation view is a member of at most one ticket room at a time.
//! Joining another ticket leaves the previous room first so pushes for the
//! old ticket stop arriving before the new one starts.

use helpmate_shared::TicketId;

use super::connection::Emitter;
use super::events::OutboundEvent;

/// Membership of the active ticket room
#[derive(Debug, Clone, PartialEq, Eq)]
enum Membership {
    /// Waiting for authentication; `join-ticket` will be replayed
    Queued,
    /// `join-ticket` emitted, no acknowledgement yet
    Requested,
    /// Service answered with `joined-ticket`
    Joined,
}

/// Tracks the single active ticket room of one conversation view
#[derive(Debug, Default)]
pub struct RoomTracker {
    active: Option<(TicketId, Membership)>,
}

impl RoomTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticket whose room is active, joined or not
    pub fn active_ticket(&self) -> Option<&TicketId> {
        self.active.as_ref().map(|(ticket, _)| ticket)
    }

    /// Events tagged for any other ticket must be ignored
    pub fn is_active(&self, ticket_id: &TicketId) -> bool {
        self.active_ticket() == Some(ticket_id)
    }

    /// True once the service acknowledged the join
    pub fn is_joined(&self) -> bool {
        matches!(self.active, Some((_, Membership::Joined)))
    }

    /// Join `ticket_id`, leaving any other room first
    ///
    /// Returns the ticket that was left, if any. Without an authenticated
    /// channel the join is queued and replayed by [`Self::on_authenticated`].
    pub fn join_room(&mut self, ticket_id: TicketId, emitter: &dyn Emitter) -> Option<TicketId> {
        if self.is_active(&ticket_id) {
            if matches!(self.active, Some((_, Membership::Queued))) && emitter.is_ready() {
                self.request_join(emitter);
            }
            return None;
        }

        let previous = self
            .active_ticket()
            .cloned()
            .filter(|previous| self.leave_room(previous, emitter));

        self.active = Some((ticket_id, Membership::Queued));
        if emitter.is_ready() {
            self.request_join(emitter);
        } else if let Some(ticket) = self.active_ticket() {
            tracing::debug!(ticket_id = %ticket, "Channel not authenticated - join queued");
        }

        previous
    }

    /// Leave `ticket_id` if it is the active room
    ///
    /// Best-effort: a `leave-ticket` that cannot be delivered is logged and
    /// forgotten. Returns false if `ticket_id` was not active.
    pub fn leave_room(&mut self, ticket_id: &TicketId, emitter: &dyn Emitter) -> bool {
        if !self.is_active(ticket_id) {
            return false;
        }
        let was_queued = matches!(self.active, Some((_, Membership::Queued)));
        self.active = None;

        if !was_queued {
            if let Err(e) = emitter.emit(OutboundEvent::LeaveTicket {
                ticket_id: ticket_id.clone(),
            }) {
                tracing::debug!(ticket_id = %ticket_id, error = %e, "leave-ticket not delivered");
            }
        }
        tracing::debug!(ticket_id = %ticket_id, "Left ticket room");
        true
    }

    /// Replay (or re-issue after reconnect) the active join
    pub fn on_authenticated(&mut self, emitter: &dyn Emitter) {
        if self.active.is_some() {
            self.request_join(emitter);
        }
    }

    /// Membership is lost with the transport; rejoin on next authentication
    pub fn on_disconnected(&mut self) {
        if let Some((_, membership)) = self.active.as_mut() {
            *membership = Membership::Queued;
        }
    }

    /// `joined-ticket` acknowledgement
    pub fn on_joined(&mut self, ticket_id: &TicketId) {
        match self.active.as_mut() {
            Some((active, membership)) if active == ticket_id => {
                *membership = Membership::Joined;
                tracing::debug!(ticket_id = %ticket_id, "Joined ticket room");
            }
            _ => {
                tracing::debug!(ticket_id = %ticket_id, "Ignoring join acknowledgement for inactive ticket");
            }
        }
    }

    fn request_join(&mut self, emitter: &dyn Emitter) {
        let Some((ticket_id, membership)) = self.active.as_mut() else {
            return;
        };
        match emitter.emit(OutboundEvent::JoinTicket {
            ticket_id: ticket_id.clone(),
        }) {
            Ok(()) => *membership = Membership::Requested,
            Err(e) => {
                *membership = Membership::Queued;
                tracing::debug!(ticket_id = %ticket_id, error = %e, "join-ticket queued");
            }
        }
    }
}
