use std::io;
use thiserror::Error;

/// Custom error types for fbblink
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed line, bad verdict count, batch checksum mismatch,
    /// invalid B2F headers, or an unexpected command for the current state.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Read/write failure, timeout, or peer closed mid-message.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Challenge received without a configured secret, or response rejected.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Traffic limit reached before the outbound queue drained.
    #[error("Traffic limit: {0}")]
    Limit(String),

    /// AX.25 retries exhausted, SABM refused, or DISC mid-session.
    #[error("Link error: {0}")]
    Link(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Creates a new authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    /// Creates a new traffic-limit error
    pub fn limit(msg: impl Into<String>) -> Self {
        Error::Limit(msg.into())
    }

    /// Creates a new link error
    pub fn link(msg: impl Into<String>) -> Self {
        Error::Link(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::protocol("test error");
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(err.to_string(), "Protocol error: test error");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_limit_is_not_transport() {
        let err = Error::limit("2 messages deferred");
        assert!(!matches!(err, Error::Transport(_)));
        assert_eq!(err.to_string(), "Traffic limit: 2 messages deferred");
    }
}
