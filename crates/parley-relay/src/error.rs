//! Error types for the relay path.

use thiserror::Error;

/// Errors raised while reading from or writing to a live connection.
///
/// Every variant terminates only the connection it was raised on.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The peer disconnected or the connection was closed locally.
    #[error("transport closed")]
    TransportClosed,

    /// The peer sent a frame that is not a valid message.
    #[error("decode error: {0}")]
    Decode(String),

    /// A message could not be serialized for the wire.
    #[error("encode error: {0}")]
    Encode(String),

    /// The recipient's outbound queue stayed full past the write deadline.
    #[error("write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),

    /// Transport-level failure other than a clean close.
    #[error("transport error: {0}")]
    Transport(String),

    /// No frame arrived within the configured idle window.
    #[error("connection idle for too long")]
    IdleTimeout,

    /// The connection's shutdown token fired.
    #[error("connection cancelled")]
    Cancelled,
}

impl RelayError {
    /// Create a new decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new encode error.
    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    /// Create a new transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Whether this error means the peer is simply gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, RelayError::TransportClosed | RelayError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_is_closed_only_for_clean_endings() {
        assert!(RelayError::TransportClosed.is_closed());
        assert!(RelayError::Cancelled.is_closed());
        assert!(!RelayError::decode("bad").is_closed());
        assert!(!RelayError::encode("bad").is_closed());
        assert!(!RelayError::WriteTimeout(Duration::from_millis(5)).is_closed());
    }

    #[test]
    fn test_encode_and_decode_are_distinct() {
        assert_eq!(RelayError::encode("x").to_string(), "encode error: x");
        assert_eq!(RelayError::decode("x").to_string(), "decode error: x");
    }
}
