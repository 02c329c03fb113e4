//! Realtime channel support
//!
//! Keeps a duplex connection to the chat service alive and exposes it to
//! conversation views.
//!
//! # Architecture
//!
//! - **Connection**: Shared handle, state and lifecycle notifications of a channel
//! - **Handler**: Driver task owning the transport, with reconnect backoff
//! - **State**: Process-wide channel registry with reference counting
//! - **Room**: Ticket room membership of one conversation view
//! - **Transport**: WebSocket and in-memory connectors
//! - **Events**: Type-safe event definitions for client/server communication

pub mod connection;
pub mod events;
mod handler;
pub mod room;
pub mod state;
pub mod transport;

pub use connection::{
    ChannelEvent, ChannelHandle, ConnectionState, Emitter, FailureReason, Lifecycle,
    ReconnectPolicy,
};
pub use events::{InboundEvent, OutboundEvent, OutgoingMessage};
pub use room::RoomTracker;
pub use state::{ChannelRegistry, RegistryStats};
pub use transport::{Connector, MemoryConnector, MemoryPeer, TransportError, WsConnector};
