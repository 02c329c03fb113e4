//! HelpMate chat synchronization engine
//!
//! Keeps per-ticket message timelines consistent over an unreliable realtime
//! channel, reconciling optimistic sends with server-confirmed records.

pub mod clock;
pub mod config;
pub mod history;
pub mod realtime;
pub mod sync;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{Config, ConfigError};
pub use history::{HistoryClient, MessageSource};
pub use realtime::{ChannelHandle, ChannelRegistry, ConnectionState};
pub use sync::{spawn_session, ChatView, SessionHandle, SessionNotice};
