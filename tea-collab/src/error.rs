//! Crate-wide error taxonomy.
//!
//! Transport failures (not open, timeout, reconnect exhaustion) surface to
//! the immediate caller. Reconciliation never errors: rolling back or
//! confirming an unknown update only changes presented state.

use std::time::Duration;
use thiserror::Error;

use crate::connection::ConnectionState;
use crate::protocol::ProtocolError;

/// Errors produced by the collaboration core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollabError {
    /// `send` was called while the connection was not open.
    #[error("connection is not open (state: {0:?})")]
    NotOpen(ConnectionState),

    /// `wait_for_connection` exceeded its deadline.
    #[error("connection did not open within {0:?}")]
    ConnectionTimeout(Duration),

    /// The connection reached `Closed` and can no longer be used.
    #[error("connection closed")]
    ConnectionClosed,

    /// The reconnection controller exhausted its retry budget.
    #[error("reconnection failed after {attempts} attempts: {last_error}")]
    ReconnectFailed { attempts: u32, last_error: String },

    /// The outgoing buffer of the connection is full.
    #[error("send buffer full")]
    SendBufferFull,

    /// Underlying WebSocket or I/O failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The message queue stopped draining after a processor failure.
    #[error("message queue halted: {0}")]
    QueueHalted(String),

    /// A message processor rejected a message.
    #[error("processing failed: {0}")]
    Processing(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for CollabError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IssueKind;

    #[test]
    fn test_reconnect_failed_display() {
        let err = CollabError::ReconnectFailed {
            attempts: 3,
            last_error: "refused".into(),
        };
        assert_eq!(err.to_string(), "reconnection failed after 3 attempts: refused");
    }

    #[test]
    fn test_protocol_error_converts() {
        let err: CollabError = ProtocolError::Malformed(vec![IssueKind::MissingType]).into();
        assert!(matches!(err, CollabError::Protocol(_)));
    }

    #[test]
    fn test_not_open_mentions_state() {
        let err = CollabError::NotOpen(ConnectionState::Closing);
        assert!(err.to_string().contains("Closing"));
    }
}
