//! Error types for HelpMate chat

use thiserror::Error;

use crate::types::TempId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Connect or reconnect failed; retried with backoff before surfacing
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote side refused the credential. Terminal, never retried.
    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// Malformed or unexpected inbound event
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Send {temp_id} was never acknowledged")]
    SendNotAcknowledged { temp_id: TempId },

    #[error("Channel is not connected")]
    NotConnected,

    #[error("Invalid message content: {0}")]
    InvalidContent(String),

    #[error("History fetch failed: {0}")]
    History(String),

    #[error("Channel closed")]
    ChannelClosed,
}

impl SyncError {
    /// Connection-level failures disable send affordances as a whole;
    /// everything else is local to a single message or event.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_)
                | SyncError::AuthenticationRejected(_)
                | SyncError::NotConnected
                | SyncError::ChannelClosed
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_level_classification() {
        assert!(SyncError::NotConnected.is_connection_level());
        assert!(SyncError::AuthenticationRejected("bad token".into()).is_connection_level());
        assert!(!SyncError::Protocol("garbage".into()).is_connection_level());
        assert!(!SyncError::SendNotAcknowledged { temp_id: TempId(7) }.is_connection_level());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::SendNotAcknowledged { temp_id: TempId(42) };
        assert_eq!(err.to_string(), "Send 42 was never acknowledged");
    }
}
