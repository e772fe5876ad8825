//! Streaming error types.

use thiserror::Error;

/// Errors surfaced by the streaming engine.
#[derive(Debug, Error)]
pub enum StreamingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] streamwire_protocol::ProtocolError),

    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("transport disconnected: {0}")]
    Disconnected(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("request {0} is already awaiting a response")]
    DuplicateRequest(uuid::Uuid),

    #[error("request timeout")]
    Timeout,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("body ended early: expected {expected} bytes, got {actual}")]
    ShortBody { expected: usize, actual: usize },

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl StreamingError {
    /// Returns whether this error means the connection is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            StreamingError::Io(_)
                | StreamingError::NotConnected
                | StreamingError::Disconnected(_)
                | StreamingError::ShortBody { .. }
        )
    }

    /// Returns whether the caller may retry the operation on a new connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamingError::Io(_) | StreamingError::Timeout | StreamingError::Disconnected(_)
        )
    }
}

/// Result alias for streaming operations.
pub type Result<T> = std::result::Result<T, StreamingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(StreamingError::Disconnected("closed".into()).is_disconnect());
        assert!(StreamingError::NotConnected.is_disconnect());
        assert!(!StreamingError::Cancelled.is_disconnect());
        assert!(!StreamingError::Timeout.is_disconnect());

        assert!(StreamingError::Timeout.is_retryable());
        assert!(!StreamingError::Cancelled.is_retryable());
        assert!(!StreamingError::AlreadyConnected.is_retryable());
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: StreamingError = streamwire_protocol::ProtocolError::InvalidTerminator(b'x').into();
        assert!(matches!(err, StreamingError::Protocol(_)));
        assert!(err.to_string().starts_with("protocol error"));
    }
}
