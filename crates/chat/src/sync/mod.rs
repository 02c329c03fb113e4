//! Per-ticket timeline synchronization
//!
//! - **Store**: Reconciles history, optimistic sends, confirmations and pushes
//! - **Typing**: Inbound typing presence and outbound keystroke debounce
//! - **Dispatcher**: Outbound user commands
//! - **Receipts**: Read-receipt application
//! - **Session**: The reducer tying the above to one conversation view
//! - **Runner**: Tokio task driving a session

pub mod dispatcher;
pub mod receipts;
pub mod runner;
pub mod session;
pub mod store;
pub mod typing;

pub use dispatcher::{CommandDispatcher, SendRequest, TempIdGenerator};
pub use receipts::{ReadReceipt, ReadReceiptTracker};
pub use runner::{spawn_session, SessionCommand, SessionHandle};
pub use session::{ChatSession, ChatView, SessionConfig, SessionEffect, SessionNotice};
pub use store::{DayGroup, MessageStore, PendingSend, PushOutcome, Timeline};
pub use typing::{TypingAggregator, TypingDebouncer};
