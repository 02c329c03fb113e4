//! Realtime channel connection state
//!
//! A [`ChannelHandle`] is the shared, cloneable face of one logical channel
//! (namespace). Every mounted conversation view holds a clone; the driver
//! task in [`super::handler`] owns the transport behind it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use helpmate_shared::{SyncError, SyncResult, UserId};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use uuid::Uuid;

use super::events::{InboundEvent, OutboundEvent};

/// Capacity of the per-channel event fan-out
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a channel stopped trying
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Reconnect attempts exhausted; shown as a persistent offline indicator
    Offline,
    /// The credential was refused. Not retried.
    AuthenticationRejected(String),
}

/// Connection state of one channel
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting {
        attempt: u32,
    },
    /// Transport open, credential not yet acknowledged
    Connected,
    Authenticated {
        user_id: UserId,
    },
    Failed(FailureReason),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Authenticated { .. }
        )
    }

    /// Outbound commands may only be dispatched in this state
    pub fn is_authenticated(&self) -> bool {
        matches!(self, ConnectionState::Authenticated { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }

    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            ConnectionState::Authenticated { user_id } => Some(user_id),
            _ => None,
        }
    }
}

/// Lifecycle notifications published to every subscriber of a channel
#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle {
    Connecting { attempt: u32 },
    Connected,
    Authenticated { user_id: UserId },
    Disconnected,
    Error(String),
    Failed(FailureReason),
}

/// Everything a subscriber observes on a channel, in delivery order
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Lifecycle(Lifecycle),
    Inbound(InboundEvent),
}

/// Reconnection backoff settings
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Connect attempts per cycle before giving up; an attempt ends at
    /// authentication, not at transport open
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum backoff duration
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delays between opens within one connect cycle
    ///
    /// `from_millis(2)` doubles on every step; the factor scales it so the
    /// first delay equals `base_delay`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let factor = (base_ms / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .take(self.max_attempts.saturating_sub(1) as usize)
            .map(jitter)
    }
}

/// Something outbound commands can be emitted through
pub trait Emitter {
    /// True when the channel is authenticated
    fn is_ready(&self) -> bool;

    fn emit(&self, event: OutboundEvent) -> SyncResult<()>;
}

/// State shared between a channel's handles and its driver task
#[derive(Debug)]
pub(crate) struct ChannelShared {
    pub(crate) name: String,
    pub(crate) session_id: Uuid,
    pub(crate) outbound: mpsc::UnboundedSender<OutboundEvent>,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) events: broadcast::Sender<ChannelEvent>,
    pub(crate) shutdown: watch::Sender<bool>,
    refs: AtomicUsize,
}

impl ChannelShared {
    /// Update state and notify subscribers
    pub(crate) fn transition(&self, state: ConnectionState, lifecycle: Lifecycle) {
        self.state.send_replace(state);
        self.publish(ChannelEvent::Lifecycle(lifecycle));
    }

    pub(crate) fn publish(&self, event: ChannelEvent) {
        // No subscribers is fine; views come and go
        let _ = self.events.send(event);
    }
}

/// Shared handle to one logical channel
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    pub(crate) shared: Arc<ChannelShared>,
}

impl ChannelHandle {
    /// Create a handle and the receiving end its driver task consumes
    pub(crate) fn new(name: &str) -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let handle = Self {
            shared: Arc::new(ChannelShared {
                name: name.to_string(),
                session_id: Uuid::new_v4(),
                outbound,
                state,
                events,
                shutdown,
                refs: AtomicUsize::new(1),
            }),
        };
        (handle, outbound_rx)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Unique id of this channel instance
    pub fn session_id(&self) -> Uuid {
        self.shared.session_id
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Observe connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Subscribe to lifecycle notifications and inbound events
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events.subscribe()
    }

    /// Still connecting, connected or waiting to reconnect
    pub fn is_live(&self) -> bool {
        !*self.shared.shutdown.borrow() && !self.state().is_failed()
    }

    pub fn ref_count(&self) -> usize {
        self.shared.refs.load(Ordering::SeqCst)
    }

    pub(crate) fn acquire(&self) -> usize {
        self.shared.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn release(&self) -> usize {
        let previous = self
            .shared
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Ask the driver task to close the transport and stop
    pub(crate) fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }
}

impl Emitter for ChannelHandle {
    fn is_ready(&self) -> bool {
        self.state().is_authenticated()
    }

    fn emit(&self, event: OutboundEvent) -> SyncResult<()> {
        if !self.is_ready() {
            tracing::debug!(
                channel = %self.shared.name,
                event = event.name(),
                "Dropping outbound event - channel not authenticated"
            );
            return Err(SyncError::NotConnected);
        }
        self.shared
            .outbound
            .send(event)
            .map_err(|_| SyncError::ChannelClosed)
    }
}
