//! Conversation session reducer
//!
//! [`ChatSession`] owns everything one mounted conversation needs: room
//! membership, the message store, typing presence and the outbound
//! dispatcher. It is a plain state machine; the runner in
//! [`super::runner`] feeds it channel events, user commands and timer ticks
//! one at a time and carries out the effects it returns.

use std::time::{Duration, Instant};

use helpmate_shared::{
    Author, Message, MessageId, SyncError, SyncResult, TempId, TicketId, UserId,
};

use super::dispatcher::{CommandDispatcher, SendRequest, DEFAULT_MAX_MESSAGE_LENGTH};
use super::receipts::{ReadReceipt, ReadReceiptTracker};
use super::store::{MessageStore, PendingSend, PushOutcome};
use super::typing::{TypingAggregator, TypingDebouncer, DEFAULT_TYPING_EXPIRY, DEFAULT_TYPING_IDLE};
use crate::clock::SharedClock;
use crate::realtime::connection::{ChannelEvent, ConnectionState, Emitter, FailureReason, Lifecycle};
use crate::realtime::events::InboundEvent;
use crate::realtime::room::RoomTracker;

/// Tunables of a conversation session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub typing_expiry: Duration,
    pub typing_idle: Duration,
    pub max_message_length: usize,
    /// Reload history after every re-authentication to cover the gap
    pub refetch_on_reconnect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            typing_expiry: DEFAULT_TYPING_EXPIRY,
            typing_idle: DEFAULT_TYPING_IDLE,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            refetch_on_reconnect: true,
        }
    }
}

/// Something the view should tell the user about
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    /// A message from another participant arrived
    Incoming(Message),
    /// Transport lost after having been authenticated
    ConnectionLost,
    /// Authenticated again after a loss
    Reconnected,
    /// The channel gave up
    Offline(FailureReason),
    /// The service reported an error on an authenticated channel
    ServiceError(String),
    /// History could not be loaded
    HistoryFailed(SyncError),
    /// Sends made on a lost transport that were never confirmed
    SendsAbandoned(Vec<PendingSend>),
}

/// Work the session asks its driver to perform
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    FetchHistory(TicketId),
    Notify(SessionNotice),
}

/// Snapshot of a conversation for rendering
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatView {
    pub ticket_id: Option<TicketId>,
    pub connection: ConnectionState,
    /// Timeline filtered by the local user's role
    pub messages: Vec<Message>,
    pub typing: Vec<UserId>,
    pub unread: usize,
    pub loaded: bool,
}

/// State machine behind one conversation view
pub struct ChatSession {
    me: Author,
    config: SessionConfig,
    clock: SharedClock,
    connection: ConnectionState,
    /// Authenticated at least once; the next authentication is a reconnect
    was_authenticated: bool,
    rooms: RoomTracker,
    store: MessageStore,
    typing: TypingAggregator,
    debouncer: TypingDebouncer,
    dispatcher: CommandDispatcher,
    receipts: ReadReceiptTracker,
}

impl ChatSession {
    pub fn new(me: Author, config: SessionConfig, clock: SharedClock) -> Self {
        let mut typing = TypingAggregator::new(config.typing_expiry);
        typing.set_local_user(Some(me.id.clone()));

        Self {
            typing,
            debouncer: TypingDebouncer::new(config.typing_idle),
            dispatcher: CommandDispatcher::new(config.max_message_length),
            me,
            config,
            clock,
            connection: ConnectionState::Disconnected,
            was_authenticated: false,
            rooms: RoomTracker::new(),
            store: MessageStore::new(),
            receipts: ReadReceiptTracker::new(),
        }
    }

    pub fn active_ticket(&self) -> Option<&TicketId> {
        self.rooms.active_ticket()
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Adopt the state of a channel that may already be authenticated
    pub fn attach(&mut self, state: ConnectionState, emitter: &dyn Emitter) {
        if let Some(user_id) = state.user_id() {
            self.typing.set_local_user(Some(user_id.clone()));
            self.was_authenticated = true;
        }
        let authenticated = state.is_authenticated();
        self.connection = state;
        if authenticated {
            self.rooms.on_authenticated(emitter);
        }
    }

    /// Make `ticket_id` the active conversation
    ///
    /// Leaves the previous ticket first and evicts its timeline.
    pub fn open_ticket(&mut self, ticket_id: TicketId, emitter: &dyn Emitter) -> Vec<SessionEffect> {
        if self.rooms.is_active(&ticket_id) {
            return Vec::new();
        }
        self.close_ticket(emitter);

        self.rooms.join_room(ticket_id.clone(), emitter);
        let timeline = self.store.open(ticket_id.clone());
        tracing::debug!(ticket_id = %ticket_id, "Conversation opened");

        if timeline.is_loaded() {
            Vec::new()
        } else {
            vec![SessionEffect::FetchHistory(ticket_id)]
        }
    }

    /// Leave the active ticket, if any
    pub fn close_ticket(&mut self, emitter: &dyn Emitter) {
        let Some(ticket_id) = self.rooms.active_ticket().cloned() else {
            return;
        };
        self.stop_typing(&ticket_id, emitter);
        self.rooms.leave_room(&ticket_id, emitter);
        self.store.evict(&ticket_id);
        self.typing.clear(&ticket_id);
        tracing::debug!(ticket_id = %ticket_id, "Conversation closed");
    }

    /// Merge a history result; results for inactive tickets are dropped
    pub fn load_history(
        &mut self,
        ticket_id: &TicketId,
        result: SyncResult<Vec<Message>>,
    ) -> Vec<SessionEffect> {
        if !self.rooms.is_active(ticket_id) {
            tracing::debug!(ticket_id = %ticket_id, "Dropping history for inactive ticket");
            return Vec::new();
        }
        match result {
            Ok(page) => {
                self.store.load_history(ticket_id, page);
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(ticket_id = %ticket_id, error = %e, "Failed to load message history");
                vec![SessionEffect::Notify(SessionNotice::HistoryFailed(e))]
            }
        }
    }

    /// Apply one event observed on the channel
    pub fn handle_channel_event(
        &mut self,
        event: ChannelEvent,
        emitter: &dyn Emitter,
    ) -> Vec<SessionEffect> {
        match event {
            ChannelEvent::Lifecycle(lifecycle) => self.handle_lifecycle(lifecycle, emitter),
            ChannelEvent::Inbound(event) => self.handle_inbound(event),
        }
    }

    /// Something was missed on the channel; reload the active timeline
    pub fn resync(&self) -> Vec<SessionEffect> {
        self.active_ticket()
            .cloned()
            .map(SessionEffect::FetchHistory)
            .into_iter()
            .collect()
    }

    fn handle_lifecycle(&mut self, lifecycle: Lifecycle, emitter: &dyn Emitter) -> Vec<SessionEffect> {
        let mut effects = Vec::new();

        match lifecycle {
            Lifecycle::Connecting { attempt } => {
                self.connection = ConnectionState::Connecting { attempt };
            }
            Lifecycle::Connected => {
                self.connection = ConnectionState::Connected;
            }
            Lifecycle::Authenticated { .. } if self.connection.is_authenticated() => {}
            Lifecycle::Authenticated { user_id } => {
                self.typing.set_local_user(Some(user_id.clone()));
                self.connection = ConnectionState::Authenticated { user_id };
                self.rooms.on_authenticated(emitter);

                if self.was_authenticated {
                    effects.push(SessionEffect::Notify(SessionNotice::Reconnected));
                    if let Some(ticket_id) = self.rooms.active_ticket().cloned() {
                        // Their confirmations went down with the old socket
                        let abandoned = self.store.abandon_pending(&ticket_id);
                        if !abandoned.is_empty() {
                            effects.push(SessionEffect::Notify(SessionNotice::SendsAbandoned(abandoned)));
                        }
                    }
                    if self.config.refetch_on_reconnect {
                        effects.extend(self.resync());
                    }
                }
                self.was_authenticated = true;
            }
            Lifecycle::Disconnected => {
                let was_authenticated = self.connection.is_authenticated();
                self.connection = ConnectionState::Disconnected;
                self.rooms.on_disconnected();
                self.debouncer.stop();
                if was_authenticated {
                    effects.push(SessionEffect::Notify(SessionNotice::ConnectionLost));
                }
            }
            Lifecycle::Error(message) => {
                effects.push(SessionEffect::Notify(SessionNotice::ServiceError(message)));
            }
            Lifecycle::Failed(reason) => {
                self.connection = ConnectionState::Failed(reason.clone());
                self.rooms.on_disconnected();
                self.debouncer.stop();
                effects.push(SessionEffect::Notify(SessionNotice::Offline(reason)));
            }
        }

        effects
    }

    /// Inbound transition table
    fn handle_inbound(&mut self, event: InboundEvent) -> Vec<SessionEffect> {
        match event {
            // Connection bookkeeping arrives as lifecycle notifications
            InboundEvent::Connect
            | InboundEvent::Connected { .. }
            | InboundEvent::Disconnect
            | InboundEvent::Error { .. } => Vec::new(),

            InboundEvent::JoinedTicket { ticket_id } => {
                self.rooms.on_joined(&ticket_id);
                Vec::new()
            }

            InboundEvent::NewMessage(message) => {
                if !self.rooms.is_active(&message.ticket_id) {
                    tracing::debug!(ticket_id = %message.ticket_id, "Ignoring message for inactive ticket");
                    return Vec::new();
                }
                let incoming = message.author_id != self.me.id;
                match self.store.push(message.clone()) {
                    PushOutcome::Inserted if incoming => {
                        vec![SessionEffect::Notify(SessionNotice::Incoming(message))]
                    }
                    _ => Vec::new(),
                }
            }

            InboundEvent::MessageSent { temp_id, message } => {
                if !self.rooms.is_active(&message.ticket_id) {
                    tracing::debug!(ticket_id = %message.ticket_id, temp_id = %temp_id, "Ignoring confirmation for inactive ticket");
                    return Vec::new();
                }
                self.store.confirm(temp_id, message);
                Vec::new()
            }

            InboundEvent::MessageRead {
                message_id,
                read_at,
                read_by,
            } => {
                if let Some(ticket_id) = self.rooms.active_ticket().cloned() {
                    self.receipts.apply(
                        &mut self.store,
                        &ticket_id,
                        ReadReceipt {
                            message_id,
                            read_at,
                            read_by,
                        },
                    );
                }
                Vec::new()
            }

            InboundEvent::UserTyping {
                user_id,
                is_typing,
                ticket_id,
            } => {
                let Some(active) = self.rooms.active_ticket().cloned() else {
                    return Vec::new();
                };
                if ticket_id.as_ref().is_some_and(|ticket| ticket != &active) {
                    return Vec::new();
                }
                self.typing
                    .set_typing(&active, user_id, is_typing, self.clock.now());
                Vec::new()
            }
        }
    }

    /// Send `content` to the active ticket
    pub fn send_message(
        &mut self,
        content: String,
        attachment_ids: Option<Vec<String>>,
        emitter: &dyn Emitter,
    ) -> SyncResult<TempId> {
        // Not in any room: there is nowhere to send to
        let ticket_id = self
            .rooms
            .active_ticket()
            .cloned()
            .ok_or(SyncError::NotConnected)?;

        if emitter.is_ready() {
            self.stop_typing(&ticket_id, emitter);
        }
        self.dispatcher.send_message(
            &mut self.store,
            emitter,
            &self.me,
            SendRequest {
                ticket_id,
                content,
                attachment_ids,
            },
            self.clock.wall(),
        )
    }

    /// The local user typed something
    pub fn keystroke(&mut self, emitter: &dyn Emitter) {
        let Some(ticket_id) = self.rooms.active_ticket().cloned() else {
            return;
        };
        if !emitter.is_ready() {
            return;
        }
        if let Some(is_typing) = self.debouncer.keystroke(self.clock.now()) {
            if let Err(e) = self.dispatcher.emit_typing(emitter, ticket_id, is_typing) {
                tracing::debug!(error = %e, "typing not delivered");
            }
        }
    }

    pub fn mark_as_read(&self, message_id: MessageId, emitter: &dyn Emitter) -> SyncResult<()> {
        self.dispatcher.mark_as_read(emitter, message_id)
    }

    /// Expire typing indicators and end idle typing bursts
    pub fn tick(&mut self, emitter: &dyn Emitter) {
        let now = self.clock.now();
        let evicted = self.typing.evict_expired(now);
        if evicted > 0 {
            tracing::trace!(evicted, "Typing indicators expired");
        }

        if let Some(is_typing) = self.debouncer.poll(now) {
            if let Some(ticket_id) = self.rooms.active_ticket().cloned() {
                if let Err(e) = self.dispatcher.emit_typing(emitter, ticket_id, is_typing) {
                    tracing::debug!(error = %e, "typing stop not delivered");
                }
            }
        }
    }

    /// When [`Self::tick`] next has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.typing.next_deadline(), self.debouncer.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn view(&self) -> ChatView {
        let now = self.clock.now();
        let Some(ticket_id) = self.rooms.active_ticket().cloned() else {
            return ChatView {
                connection: self.connection.clone(),
                ..ChatView::default()
            };
        };
        let Some(timeline) = self.store.timeline(&ticket_id) else {
            return ChatView {
                ticket_id: Some(ticket_id),
                connection: self.connection.clone(),
                ..ChatView::default()
            };
        };

        ChatView {
            messages: timeline
                .visible_to(self.me.role)
                .into_iter()
                .cloned()
                .collect(),
            typing: self
                .typing
                .currently_typing(&ticket_id, now)
                .into_iter()
                .collect(),
            unread: timeline.unread_count(&self.me.id),
            loaded: timeline.is_loaded(),
            connection: self.connection.clone(),
            ticket_id: Some(ticket_id),
        }
    }

    fn stop_typing(&mut self, ticket_id: &TicketId, emitter: &dyn Emitter) {
        if let Some(is_typing) = self.debouncer.stop() {
            if let Err(e) = self
                .dispatcher
                .emit_typing(emitter, ticket_id.clone(), is_typing)
            {
                tracing::debug!(ticket_id = %ticket_id, error = %e, "typing stop not delivered");
            }
        }
    }
}
