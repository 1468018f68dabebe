//! Error types for the sync client.

use liveq_protocol::StateVersion;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur inside the sync client.
///
/// Transport errors are always recovered locally via reconnect and
/// backoff; they are never surfaced to callers as exceptions. Protocol
/// errors are fatal to the current connection and force a fresh
/// reconnect cycle rather than silently desynchronizing.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Network or socket-level failure.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether reconnecting can help.
        retryable: bool,
    },

    /// A wire message failed to encode or decode.
    #[error("protocol error: {0}")]
    Protocol(#[from] liveq_protocol::ProtocolError),

    /// A `Transition` did not extend the current version exactly.
    #[error("transition starts at {actual:?} but current version is {expected:?}")]
    VersionMismatch {
        /// The client's current version.
        expected: StateVersion,
        /// The transition's start version.
        actual: StateVersion,
    },

    /// The connection dropped while a non-idempotent request was in
    /// flight.
    #[error("connection lost while {0} was in flight")]
    ConnectionLost(String),

    /// The client was shut down with the request still pending.
    #[error("client closed")]
    ClientClosed,
}

impl ClientError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if reconnecting can recover from this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { retryable, .. } => *retryable,
            ClientError::VersionMismatch { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(ClientError::transport_retryable("connection reset").is_retryable());
        assert!(!ClientError::transport_fatal("bad certificate").is_retryable());
        assert!(ClientError::VersionMismatch {
            expected: StateVersion::initial(),
            actual: StateVersion::initial(),
        }
        .is_retryable());
        assert!(!ClientError::ClientClosed.is_retryable());
    }

    #[test]
    fn error_display() {
        assert_eq!(ClientError::ClientClosed.to_string(), "client closed");
        assert_eq!(
            ClientError::ConnectionLost("action".into()).to_string(),
            "connection lost while action was in flight"
        );
    }
}
