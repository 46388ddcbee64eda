//! Error taxonomy for the relay core

use std::time::Duration;

use thiserror::Error;

/// Failure of the stream transport (network or HTTP level)
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Backend answered with a non-2xx status
    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Could not establish the connection
    #[error("connection failed: {0}")]
    Connect(String),

    /// Connection dropped or a read failed mid-stream
    #[error("stream interrupted: {0}")]
    Disconnected(String),

    /// Backend reported an error frame
    #[error("backend error: {0}")]
    Server(String),

    /// Request could not be built
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Whether a reconnect may recover from this failure
    ///
    /// HTTP status errors and server-reported errors are never retried.
    pub fn is_reconnectable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Disconnected(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            TransportError::Connect(err.to_string())
        } else if err.is_builder() {
            TransportError::InvalidRequest(err.to_string())
        } else {
            TransportError::Disconnected(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) => TransportError::Status {
                status: response.status().as_u16(),
                body: String::new(),
            },
            WsError::Url(e) => TransportError::InvalidRequest(e.to_string()),
            WsError::Io(e) => TransportError::Connect(e.to_string()),
            other => TransportError::Disconnected(other.to_string()),
        }
    }
}

/// Failure of the persistence collaborator
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Durable storage can't be used right now; callers fall back to memory
    #[error("persistence unavailable: {0}")]
    Unavailable(String),

    /// Referenced chat or message does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// SQLite error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Background task failed
    #[error("storage task failed: {0}")]
    Task(String),
}

/// Error type returned by the relay and state machine
#[derive(Debug, Error)]
pub enum RelayError {
    /// Network or HTTP failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A send is already in flight for this conversation
    #[error("conversation {0} already has a message in flight")]
    ConcurrentSend(String),

    /// An interrupt was not resolved in time
    #[error("interrupt for conversation {conversation_id} unresolved after {waited:?}")]
    InterruptTimeout {
        conversation_id: String,
        waited: Duration,
    },

    /// Commit to the persistence collaborator failed
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Malformed control event or illegal state transition
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Conversation not known to the store
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    /// Invalid configuration
    #[error("config error: {0}")]
    Config(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnectable_errors() {
        assert!(TransportError::Connect("refused".into()).is_reconnectable());
        assert!(TransportError::Disconnected("eof".into()).is_reconnectable());
        assert!(!TransportError::Status {
            status: 500,
            body: String::new()
        }
        .is_reconnectable());
        assert!(!TransportError::Server("boom".into()).is_reconnectable());
    }

    #[test]
    fn test_display_concurrent_send() {
        let err = RelayError::ConcurrentSend("c1".to_string());
        assert_eq!(
            err.to_string(),
            "conversation c1 already has a message in flight"
        );
    }
}
